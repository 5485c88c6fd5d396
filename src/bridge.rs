//! Relays light frames from the event hub to the serial LED driver.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use serde_json::Value;

use crate::events::{BridgeAnnouncement, ControlCommand};
use crate::show::model::{Rgb, StripFrame};
use crate::transport::streamer::{FrameStreamer, SendOutcome};

const LEVELS_INTERVAL: Duration = Duration::from_millis(50);
/// How often device telemetry is forwarded when no frames arrive
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Lines held while the device reconnects; beyond this the socket backs up
/// and the hub sheds frames for us
const READ_BACKLOG: usize = 256;

pub struct BridgeSettings {
    /// Hub address, `host:port`
    pub server: String,
    pub reconnect: Duration,
    /// Serial port name, reported to the hub
    pub port: Option<String>,
}

pub struct Bridge {
    streamer: FrameStreamer,
    settings: BridgeSettings,
    last_levels: Option<Instant>,
    frames: u64,
    skipped: u64,
}

impl Bridge {
    pub fn new(streamer: FrameStreamer, settings: BridgeSettings) -> Self {
        Self {
            streamer,
            settings,
            last_levels: None,
            frames: 0,
            skipped: 0,
        }
    }

    /// Stay connected to the hub forever.
    pub fn run(&mut self) -> ! {
        loop {
            match TcpStream::connect(&self.settings.server) {
                Ok(stream) => {
                    log::info!("Connected to hub at {}", self.settings.server);
                    match self.session(stream) {
                        Ok(()) => log::warn!("Hub closed the connection"),
                        Err(e) => log::warn!("Hub session failed: {:#}", e),
                    }
                }
                Err(e) => log::warn!("Cannot reach hub at {}: {}", self.settings.server, e),
            }
            thread::sleep(self.settings.reconnect);
        }
    }

    /// Handle one hub connection until it closes.
    pub fn session(&mut self, stream: TcpStream) -> Result<()> {
        let lines = spawn_reader(stream.try_clone().context("Failed to clone hub socket")?)
            .context("Failed to start the hub reader")?;
        let result = self.pump(&stream, &lines);
        // unblocks the reader thread
        let _ = stream.shutdown(Shutdown::Both);
        result
    }

    fn pump(&mut self, stream: &TcpStream, lines: &Receiver<io::Result<String>>) -> Result<()> {
        let mut writer = stream;
        send(
            &mut writer,
            &ControlCommand::AnnounceBridge(BridgeAnnouncement {
                total_leds: self.streamer.total_leds(),
                segments: self.streamer.segments().to_vec(),
                port: self.settings.port.clone(),
            }),
        )?;

        let device_info = self.streamer.device_info();
        loop {
            for info in device_info.try_iter() {
                log::info!("Device info: {:?}", info);
                send(&mut writer, &ControlCommand::DeviceInfo(info))?;
            }

            let first = match lines.recv_timeout(POLL_INTERVAL) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            };
            // frames queue up while the device is busy; only the newest is worth sending
            let mut newest = None;
            for line in std::iter::once(first).chain(lines.try_iter()) {
                let line = line.context("Failed to read from hub")?;
                if let Some(strips) = parse_frame(&line) {
                    if newest.replace(strips).is_some() {
                        self.skipped += 1;
                    }
                }
            }
            if let Some(strips) = newest {
                self.relay(&strips, &mut writer)?;
            }
        }
    }

    fn relay(&mut self, strips: &[StripFrame], writer: &mut impl Write) -> Result<()> {
        self.frames += 1;
        match self.streamer.send_frame(strips) {
            SendOutcome::Confirmed | SendOutcome::Unconfirmed => {}
            SendOutcome::Rejected => log::debug!("Frame {} rejected by device", self.frames),
            SendOutcome::Dropped => log::warn!("Frame {} lost while the link was down", self.frames),
        }
        if self.frames % 100 == 0 {
            log::info!("Relayed {} frames, skipped {} stale", self.frames, self.skipped);
        }

        let due = self.last_levels.map_or(true, |t| t.elapsed() >= LEVELS_INTERVAL);
        if due {
            self.last_levels = Some(Instant::now());
            send(
                writer,
                &ControlCommand::LedLevels {
                    levels: led_levels(strips, self.streamer.segments().len()),
                    ts: unix_now(),
                },
            )?;
        }
        Ok(())
    }
}

/// Read hub lines on their own thread so a slow device never backs up the socket.
fn spawn_reader(stream: TcpStream) -> io::Result<Receiver<io::Result<String>>> {
    let (tx, rx) = bounded(READ_BACKLOG);
    thread::Builder::new().name("hub-reader".into()).spawn(move || {
        for line in BufReader::new(stream).lines() {
            let failed = line.is_err();
            if tx.send(line).is_err() || failed {
                break;
            }
        }
    })?;
    Ok(rx)
}

/// Strips of a `light_frame` line; `None` for anything else.
fn parse_frame(line: &str) -> Option<Vec<StripFrame>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("Ignoring malformed event: {}", e);
            return None;
        }
    };
    if value.get("event").and_then(Value::as_str) != Some("light_frame") {
        return None;
    }
    Some(sanitize_strips(&value["strips"]))
}

fn send(w: &mut impl Write, cmd: &ControlCommand) -> io::Result<()> {
    let mut line = serde_json::to_string(cmd)?;
    line.push('\n');
    w.write_all(line.as_bytes())
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Strips from an untrusted `light_frame` payload. Entries without a
/// numeric `strip_id` are skipped.
pub fn sanitize_strips(strips: &Value) -> Vec<StripFrame> {
    let Some(strips) = strips.as_array() else {
        return Vec::new();
    };
    strips
        .iter()
        .filter_map(|s| {
            let strip_id = u32::try_from(s.get("strip_id")?.as_u64()?).ok()?;
            let leds = s
                .get("leds")
                .and_then(Value::as_array)
                .map(|px| px.iter().map(sanitize_pixel).collect())
                .unwrap_or_default();
            Some(StripFrame { strip_id, leds })
        })
        .collect()
}

/// Numbers are rounded and clamped to 0..=255; anything else is black.
pub fn sanitize_pixel(px: &Value) -> Rgb {
    let Some(channels) = px.as_array().filter(|c| c.len() >= 3) else {
        return [0, 0, 0];
    };
    let mut out = [0u8; 3];
    for (slot, c) in out.iter_mut().zip(channels) {
        match c.as_f64() {
            Some(v) if v.is_finite() => *slot = v.round().clamp(0.0, 255.0) as u8,
            _ => return [0, 0, 0],
        }
    }
    out
}

/// Mean channel value of each segment, scaled to 0..=1. Segments the frame
/// does not cover read as 0.
pub fn led_levels(strips: &[StripFrame], segments: usize) -> Vec<f32> {
    let mut levels = vec![0.0; segments];
    for strip in strips {
        let Some(slot) = levels.get_mut(strip.strip_id as usize) else {
            continue;
        };
        if strip.leds.is_empty() {
            continue;
        }
        let sum: u64 = strip.leds.iter().flat_map(|p| p.iter()).map(|&c| c as u64).sum();
        *slot = sum as f32 / (strip.leds.len() * 3) as f32 / 255.0;
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::link::mock::{LinkEvent, MockConnector};
    use crate::transport::packet::ColorOrder;
    use crate::transport::streamer::StreamerSettings;
    use serde_json::json;
    use std::net::TcpListener;

    #[test]
    fn pixels_are_clamped_and_junk_is_black() {
        assert_eq!(sanitize_pixel(&json!([300, -5, 12.6])), [255, 0, 13]);
        assert_eq!(sanitize_pixel(&json!(["red", 0, 0])), [0, 0, 0]);
        assert_eq!(sanitize_pixel(&json!([1, 2])), [0, 0, 0]);
        assert_eq!(sanitize_pixel(&json!(null)), [0, 0, 0]);

        let strips = sanitize_strips(&json!([
            {"strip_id": 1, "leds": [[1, 2, 3], "x"]},
            {"leds": [[9, 9, 9]]},
            {"strip_id": 2}
        ]));
        assert_eq!(strips.len(), 2);
        assert_eq!(strips[0].leds, vec![[1, 2, 3], [0, 0, 0]]);
        assert!(strips[1].leds.is_empty());
        assert!(sanitize_strips(&json!("nope")).is_empty());
    }

    #[test]
    fn levels_are_mean_brightness_per_segment() {
        let strips = vec![
            StripFrame { strip_id: 2, leds: vec![[255, 255, 255], [0, 0, 0]] },
            StripFrame { strip_id: 0, leds: vec![[255, 255, 255]] },
            StripFrame { strip_id: 7, leds: vec![[255, 255, 255]] },
        ];
        let levels = led_levels(&strips, 3);
        assert_eq!(levels.len(), 3);
        assert!((levels[0] - 1.0).abs() < 1e-6);
        assert_eq!(levels[1], 0.0);
        assert!((levels[2] - 0.5).abs() < 1e-6);
    }

    fn streamer_settings(min_interval: Duration) -> StreamerSettings {
        StreamerSettings {
            color_order: ColorOrder::Rgb,
            min_interval,
            chunk_size: 64,
            chunk_delay: Duration::ZERO,
            ack_timeout: Duration::from_millis(200),
            reconnect_backoff: Duration::from_millis(5),
            settle: Duration::ZERO,
            warn_interval: Duration::from_secs(5),
        }
    }

    fn bridge(connector: MockConnector, segments: Vec<usize>, min_interval: Duration) -> Bridge {
        let streamer =
            FrameStreamer::new(Box::new(connector), segments, None, streamer_settings(min_interval)).unwrap();
        Bridge::new(
            streamer,
            BridgeSettings {
                server: String::new(),
                reconnect: Duration::from_millis(10),
                port: Some("mock".into()),
            },
        )
    }

    fn packets(log: &crate::transport::link::mock::EventLog) -> Vec<Vec<u8>> {
        log.lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                LinkEvent::Packet(p) => Some(p.payload.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn session_announces_and_relays_frames() {
        let connector = MockConnector::new(true);
        let log = connector.log.clone();
        let mut bridge = bridge(connector, vec![2, 1], Duration::ZERO);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let hub = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut hello = String::new();
            reader.read_line(&mut hello).unwrap();

            let frame = json!({
                "event": "light_frame",
                "song_id": "s",
                "timestamp": 0.5,
                "strips": [
                    {"strip_id": 0, "leds": [[255, 0, 0], [0, 0, 999]]},
                    {"strip_id": 1, "leds": [[0, 0, 0]]}
                ]
            });
            stream.write_all(b"{\"event\":\"playback_time_update\"}\n").unwrap();
            stream.write_all(format!("{}\n", frame).as_bytes()).unwrap();

            let mut levels = String::new();
            reader.read_line(&mut levels).unwrap();
            (hello, levels)
        });

        let stream = TcpStream::connect(addr).unwrap();
        bridge.session(stream).unwrap();
        let (hello, levels) = hub.join().unwrap();

        let hello: ControlCommand = serde_json::from_str(&hello).unwrap();
        assert_eq!(
            hello,
            ControlCommand::AnnounceBridge(BridgeAnnouncement {
                total_leds: 3,
                segments: vec![2, 1],
                port: Some("mock".into()),
            })
        );
        let levels: Value = serde_json::from_str(&levels).unwrap();
        assert_eq!(levels["command"], "led_levels");
        assert_eq!(levels["levels"].as_array().map(|l| l.len()), Some(2));

        let packets = packets(&log);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0], vec![255, 0, 0, 0, 0, 255, 0, 0, 0]);
    }

    #[test]
    fn slow_device_gets_the_newest_frame() {
        let connector = MockConnector::new(true);
        let log = connector.log.clone();
        // each packet costs far longer than the frames are apart
        let mut bridge = bridge(connector, vec![1], Duration::from_millis(200));

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let hub = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            for i in 0..20u8 {
                let frame = json!({
                    "event": "light_frame",
                    "song_id": "s",
                    "timestamp": i as f64 * 0.093,
                    "strips": [{"strip_id": 0, "leds": [[i, 0, 0]]}]
                });
                stream.write_all(format!("{}\n", frame).as_bytes()).unwrap();
                thread::sleep(Duration::from_millis(20));
            }
            stream.shutdown(Shutdown::Write).unwrap();
            let mut rest = String::new();
            let _ = io::Read::read_to_string(&mut stream, &mut rest);
        });

        let started = Instant::now();
        bridge.session(TcpStream::connect(addr).unwrap()).unwrap();
        hub.join().unwrap();

        let packets = packets(&log);
        assert!(packets.len() < 10, "{} packets for 20 frames", packets.len());
        assert_eq!(packets.last(), Some(&vec![19, 0, 0]));
        assert!(bridge.skipped > 0);
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    }
}
