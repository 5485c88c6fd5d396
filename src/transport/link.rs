use std::io::{self, Read, Write};
use std::time::Duration;

use super::TransportError;

/// A byte link to the LED driver. The writer owns it; the monitor only reads
/// through an independent handle.
pub trait SerialLink: Write + Send {
    fn reader(&self) -> io::Result<Box<dyn Read + Send>>;
    /// Discard anything buffered in either direction.
    fn clear(&mut self) -> io::Result<()>;
    fn name(&self) -> &str;
}

/// Opens fresh links; called again after every failure.
pub trait LinkConnector: Send {
    fn open(&mut self) -> Result<Box<dyn SerialLink>, TransportError>;
}

pub struct SerialPortLink {
    name: String,
    port: Box<dyn serialport::SerialPort>,
}

impl Write for SerialPortLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl SerialLink for SerialPortLink {
    fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        let clone = self.port.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(clone))
    }

    fn clear(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::All)
            .map_err(io::Error::from)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub struct SerialPortConnector {
    pub path: String,
    pub baud: u32,
    /// Applies to reads and writes alike
    pub timeout: Duration,
}

impl SerialPortConnector {
    pub fn new(path: &str, baud: u32) -> Self {
        Self {
            path: path.to_string(),
            baud,
            timeout: Duration::from_secs(2),
        }
    }
}

impl LinkConnector for SerialPortConnector {
    fn open(&mut self) -> Result<Box<dyn SerialLink>, TransportError> {
        log::info!("Connecting to LED driver on {} @ {} baud", self.path, self.baud);
        let port = serialport::new(&self.path, self.baud)
            .timeout(self.timeout)
            .open()
            .map_err(|e| TransportError::Open {
                port: self.path.clone(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(SerialPortLink {
            name: self.path.clone(),
            port,
        }))
    }
}
