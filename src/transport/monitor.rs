//! Reader side of the device link.
//!
//! A single background thread reads device output line by line. Frame
//! confirmations go to a one-slot channel the writer waits on; telemetry lines
//! are parsed into [`DeviceInfo`]. The thread never writes to the link.

use std::io::{ErrorKind, Read};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};

/// Upper bound on how long a pending read can keep the old handle alive
const DETACH_WAIT: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ack {
    FrameOk,
    ChecksumError,
}

/// Configuration the LED driver reports at startup.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_leds: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_pins: Option<Vec<u32>>,
    pub raw: String,
}

#[derive(Debug, PartialEq)]
enum DeviceLine {
    Ack(Ack),
    Info(DeviceInfo),
    Other,
}

fn parse_list<T: std::str::FromStr>(s: &str) -> Option<Vec<T>> {
    s.split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(|x| x.parse().ok())
        .collect()
}

fn value_after<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    line.find(key).map(|i| line[i + key.len()..].trim())
}

fn classify(line: &str) -> DeviceLine {
    if line.contains("Frame OK") {
        return DeviceLine::Ack(Ack::FrameOk);
    }
    if line.contains("Checksum error") {
        return DeviceLine::Ack(Ack::ChecksumError);
    }
    let is_info = ["TOTAL_LEDS=", "STRIP_SEGMENTS=", "DATA_PINS="]
        .iter()
        .any(|k| line.starts_with(k));
    if !is_info {
        return DeviceLine::Other;
    }
    DeviceLine::Info(DeviceInfo {
        total_leds: value_after(line, "TOTAL_LEDS=").and_then(|v| v.parse().ok()),
        segments: value_after(line, "STRIP_SEGMENTS=").and_then(parse_list),
        data_pins: value_after(line, "DATA_PINS=").and_then(parse_list),
        raw: line.to_string(),
    })
}

enum Control {
    Attach(Box<dyn Read + Send>),
    /// Drop the current handle, then signal on the sender
    Detach(Sender<()>),
}

pub struct Monitor {
    control: Sender<Control>,
    acks: Receiver<Ack>,
    info: Receiver<DeviceInfo>,
}

impl Monitor {
    pub fn spawn() -> std::io::Result<Self> {
        let (control, control_rx) = unbounded();
        let (ack_tx, acks) = bounded(1);
        let (info_tx, info) = unbounded();
        thread::Builder::new()
            .name("device-monitor".into())
            .spawn(move || read_loop(control_rx, ack_tx, info_tx))?;
        Ok(Self { control, acks, info })
    }

    /// Point the reader thread at a freshly opened link.
    pub fn arm(&self, reader: Box<dyn Read + Send>) {
        let _ = self.control.send(Control::Attach(reader));
    }

    /// Release the reader handle of a link that is being closed.
    ///
    /// The port cannot be reopened while any handle to it is alive, so this
    /// blocks until the reader thread has dropped it (or `DETACH_WAIT` passes).
    pub fn disarm(&self) {
        let (done_tx, done) = bounded(1);
        if self.control.send(Control::Detach(done_tx)).is_err() {
            return;
        }
        if done.recv_timeout(DETACH_WAIT).is_err() {
            log::warn!("Device monitor still holds the old link after {:?}", DETACH_WAIT);
        }
    }

    /// Forget confirmations that belong to earlier frames.
    pub fn drain_acks(&self) {
        while self.acks.try_recv().is_ok() {}
    }

    pub fn wait_ack(&self, timeout: Duration) -> Option<Ack> {
        self.acks.recv_timeout(timeout).ok()
    }

    pub fn device_info(&self) -> Receiver<DeviceInfo> {
        self.info.clone()
    }
}

fn read_loop(control: Receiver<Control>, acks: Sender<Ack>, info: Sender<DeviceInfo>) {
    let mut current: Option<Box<dyn Read + Send>> = None;
    let mut line_buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 256];

    loop {
        let msg = if current.is_none() {
            match control.recv() {
                Ok(msg) => Some(msg),
                Err(_) => return,
            }
        } else {
            match control.try_recv() {
                Ok(msg) => Some(msg),
                Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => None,
            }
        };
        match msg {
            Some(Control::Attach(r)) => {
                current = Some(r);
                line_buf.clear();
            }
            Some(Control::Detach(done)) => {
                current = None;
                line_buf.clear();
                let _ = done.try_send(());
                continue;
            }
            None => {}
        }
        let Some(reader) = current.as_mut() else {
            continue;
        };

        match reader.read(&mut chunk) {
            Ok(0) => {
                log::debug!("Device link closed");
                current = None;
            }
            Ok(n) => {
                line_buf.extend_from_slice(&chunk[..n]);
                while let Some(pos) = line_buf.iter().position(|&b| b == b'\n') {
                    let raw: Vec<u8> = line_buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&raw).trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    match classify(&line) {
                        DeviceLine::Ack(ack) => {
                            log::trace!("[device] {}", line);
                            let _ = acks.try_send(ack);
                        }
                        DeviceLine::Info(device) => {
                            log::info!("[device] {}", line);
                            let _ = info.send(device);
                        }
                        DeviceLine::Other => log::info!("[device] {}", line),
                    }
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(e) => {
                // idle until the writer reconnects and re-arms
                log::warn!("Device monitor read failed: {}", e);
                current = None;
            }
        }
    }
}
