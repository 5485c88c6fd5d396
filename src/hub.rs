//! Line-delimited JSON event hub.
//!
//! Every client receives each `ShowEvent` as one JSON object per line and may
//! send `ControlCommand`s back the same way.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::events::{ControlCommand, EventBus, ShowEvent};
use crate::playback::control::Controller;

pub struct Hub {
    listener: TcpListener,
    bus: Arc<EventBus>,
    controller: Arc<Controller>,
}

impl Hub {
    pub fn bind(addr: &str, bus: Arc<EventBus>, controller: Arc<Controller>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        log::info!("Event hub listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            bus,
            controller,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until the listener fails.
    pub fn run(self) -> io::Result<()> {
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("Accept failed: {}", e);
                    continue;
                }
            };
            let bus = self.bus.clone();
            let controller = self.controller.clone();
            thread::Builder::new().name("hub-client".into()).spawn(move || {
                if let Err(e) = serve_client(stream, &bus, &controller) {
                    log::warn!("Client session ended with error: {}", e);
                }
            })?;
        }
        Ok(())
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new().name("hub".into()).spawn(move || {
            if let Err(e) = self.run() {
                log::error!("Event hub stopped: {}", e);
            }
        })
    }
}

fn write_event(w: &mut impl Write, event: &ShowEvent) -> io::Result<()> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    w.write_all(line.as_bytes())
}

fn serve_client(stream: TcpStream, bus: &EventBus, controller: &Controller) -> io::Result<()> {
    let peer = stream.peer_addr()?;
    log::info!("Client connected: {}", peer);

    let events = bus.subscribe();
    let mut writer = stream.try_clone()?;
    if let Some(view) = controller.queue_view() {
        write_event(&mut writer, &ShowEvent::QueueUpdated(view))?;
    }
    // exits on the first failed write after the socket closes
    thread::Builder::new().name("hub-writer".into()).spawn(move || {
        for event in events.iter() {
            if let Err(e) = write_event(&mut writer, &event) {
                log::debug!("Dropping subscriber {}: {}", peer, e);
                break;
            }
        }
    })?;

    let mut is_bridge = false;
    for line in BufReader::new(stream.try_clone()?).lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                log::debug!("Read from {} failed: {}", peer, e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let cmd = match serde_json::from_str::<ControlCommand>(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                log::warn!("Ignoring malformed command from {}: {}", peer, e);
                continue;
            }
        };
        if matches!(cmd, ControlCommand::AnnounceBridge(_)) {
            if is_bridge {
                log::debug!("{} announced itself again", peer);
                continue;
            }
            is_bridge = true;
        }
        if let Err(e) = controller.handle(cmd) {
            log::warn!("Command from {} failed: {}", peer, e);
        }
    }

    if is_bridge {
        bus.bridge_disconnected();
        log::info!("Bridge disconnected: {}", peer);
    } else {
        log::info!("Client disconnected: {}", peer);
    }
    let _ = stream.shutdown(Shutdown::Both);
    Ok(())
}
