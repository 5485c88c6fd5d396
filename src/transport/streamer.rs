use std::thread;
use std::time::{Duration, Instant};

use super::link::{LinkConnector, SerialLink};
use super::monitor::{Ack, DeviceInfo, Monitor};
use super::packet::{ColorOrder, FramePacket};
use super::TransportError;
use crate::config::BridgeConfig;
use crate::show::model::{Rgb, StripFrame};
use crossbeam_channel::Receiver;

/// Pause between arming the monitor and clearing the link buffers
const ARM_DELAY: Duration = Duration::from_millis(200);

#[derive(Clone, Debug)]
pub struct StreamerSettings {
    pub color_order: ColorOrder,
    pub min_interval: Duration,
    pub chunk_size: usize,
    pub chunk_delay: Duration,
    pub ack_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub settle: Duration,
    pub warn_interval: Duration,
}

impl StreamerSettings {
    pub fn from_config(cfg: &BridgeConfig) -> Self {
        Self {
            color_order: cfg.color_order,
            min_interval: Duration::from_millis(cfg.min_frame_interval_ms),
            chunk_size: cfg.chunk_size.max(1),
            chunk_delay: Duration::from_millis(cfg.chunk_delay_ms),
            ack_timeout: Duration::from_millis(cfg.ack_timeout_ms),
            reconnect_backoff: Duration::from_millis(cfg.reconnect_backoff_ms),
            settle: Duration::from_millis(cfg.settle_ms),
            warn_interval: Duration::from_millis(cfg.warn_interval_ms),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Device reported the frame processed
    Confirmed,
    /// Device rejected the checksum
    Rejected,
    /// Written, but no confirmation within the timeout
    Unconfirmed,
    /// Write failed; the link was closed and will be reopened on the next frame
    Dropped,
}

/// Pushes frames to the LED driver over a serial link.
///
/// Strips are laid out back to back in one flat buffer. Sends are throttled,
/// chunked and followed by a bounded wait for the device's confirmation.
pub struct FrameStreamer {
    connector: Box<dyn LinkConnector>,
    link: Option<Box<dyn SerialLink>>,
    monitor: Monitor,
    settings: StreamerSettings,
    segments: Vec<usize>,
    /// (offset, length) in LEDs, indexed by strip id
    offsets: Vec<(usize, usize)>,
    total_leds: usize,
    /// Device-ordered bytes, kept between frames
    buffer: Vec<u8>,
    last_send: Option<Instant>,
    last_warn: Option<Instant>,
    short_warnings: u64,
}

impl FrameStreamer {
    pub fn new(
        connector: Box<dyn LinkConnector>,
        segments: Vec<usize>,
        total_override: Option<usize>,
        settings: StreamerSettings,
    ) -> Result<Self, TransportError> {
        let mut offsets = Vec::with_capacity(segments.len());
        let mut running = 0;
        for &len in &segments {
            offsets.push((running, len));
            running += len;
        }
        let total_leds = match total_override {
            Some(n) if n > 0 => {
                if n != running {
                    log::warn!(
                        "LED count override {} differs from segment sum {}; segments still drive the mapping",
                        n,
                        running
                    );
                }
                n
            }
            _ => running,
        };
        if total_leds > u16::MAX as usize {
            return Err(TransportError::TooManyLeds(total_leds));
        }
        Ok(Self {
            connector,
            link: None,
            monitor: Monitor::spawn()?,
            settings,
            segments,
            offsets,
            total_leds,
            buffer: vec![0; total_leds * 3],
            last_send: None,
            last_warn: None,
            short_warnings: 0,
        })
    }

    pub fn total_leds(&self) -> usize {
        self.total_leds
    }

    pub fn segments(&self) -> &[usize] {
        &self.segments
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Telemetry the device prints at startup.
    pub fn device_info(&self) -> Receiver<DeviceInfo> {
        self.monitor.device_info()
    }

    /// Open the link, retrying forever with a fixed backoff.
    pub fn connect(&mut self) {
        self.drop_link();
        loop {
            match self.try_connect() {
                Ok(link) => {
                    log::info!("Serial connected and ready ({})", link.name());
                    self.link = Some(link);
                    return;
                }
                Err(e) => {
                    log::warn!(
                        "Serial connect failed: {}; retrying in {:?}",
                        e,
                        self.settings.reconnect_backoff
                    );
                    thread::sleep(self.settings.reconnect_backoff);
                }
            }
        }
    }

    fn try_connect(&mut self) -> Result<Box<dyn SerialLink>, TransportError> {
        let mut link = self.connector.open()?;
        // the monitor must be listening before buffers are cleared so startup output is seen
        self.monitor.arm(link.reader()?);
        thread::sleep(ARM_DELAY);
        if let Err(e) = link.clear() {
            drop(link);
            self.monitor.disarm();
            return Err(e.into());
        }
        log::info!("Waiting {:?} for device startup", self.settings.settle);
        thread::sleep(self.settings.settle);
        Ok(link)
    }

    /// Close the port along with the monitor's handle to it.
    fn drop_link(&mut self) {
        if self.link.take().is_some() {
            self.monitor.disarm();
        }
    }

    /// Copy strips into their segments. Short strips leave the rest of their
    /// segment at the previous value; unknown strip ids are ignored.
    fn merge(&mut self, strips: &[StripFrame]) {
        let order = self.settings.color_order;
        for strip in strips {
            let Some(&(offset, len)) = self.offsets.get(strip.strip_id as usize) else {
                log::debug!("Ignoring unknown strip_id={}", strip.strip_id);
                continue;
            };
            if strip.leds.len() != len {
                self.warn_short(strip.strip_id, strip.leds.len(), len);
            }
            for (i, &px) in strip.leds.iter().take(len).enumerate() {
                let base = (offset + i) * 3;
                if base + 3 > self.buffer.len() {
                    break;
                }
                self.buffer[base..base + 3].copy_from_slice(&order.arrange(px));
            }
        }
    }

    fn warn_short(&mut self, strip_id: u32, got: usize, expected: usize) {
        let now = Instant::now();
        let due = self
            .last_warn
            .map_or(true, |t| now.duration_since(t) >= self.settings.warn_interval);
        if due {
            log::warn!(
                "strip_id={} provided {} pixels, expected {}; filling available, rest keep previous values",
                strip_id,
                got,
                expected
            );
            self.last_warn = Some(now);
            self.short_warnings += 1;
        }
    }

    fn throttle(&mut self) {
        if let Some(last) = self.last_send {
            let elapsed = last.elapsed();
            if elapsed < self.settings.min_interval {
                thread::sleep(self.settings.min_interval - elapsed);
            }
        }
        self.last_send = Some(Instant::now());
    }

    pub fn send_frame(&mut self, strips: &[StripFrame]) -> SendOutcome {
        if self.link.is_none() {
            log::info!("Serial link down, reconnecting");
            self.connect();
        }
        self.merge(strips);
        let packet = FramePacket::new(self.buffer.clone());
        self.throttle();
        self.send_packet(&packet)
    }

    /// Send one solid color per strip, cycling red, green, blue, yellow.
    pub fn send_test_pattern(&mut self) -> SendOutcome {
        const COLORS: [Rgb; 4] = [[255, 0, 0], [0, 255, 0], [0, 0, 255], [255, 255, 0]];
        let strips: Vec<StripFrame> = self
            .segments
            .iter()
            .enumerate()
            .map(|(id, &len)| StripFrame {
                strip_id: id as u32,
                leds: vec![COLORS[id % COLORS.len()]; len],
            })
            .collect();
        self.send_frame(&strips)
    }

    fn send_packet(&mut self, packet: &FramePacket) -> SendOutcome {
        let bytes = packet.encode();
        log::debug!(
            "Sending frame: {} bytes ({} LEDs), checksum={:#06X}",
            bytes.len(),
            packet.led_count,
            FramePacket::checksum(&packet.payload)
        );

        self.monitor.drain_acks();
        if let Err(e) = self.write_chunked(&bytes) {
            log::error!("Serial write failed: {}", e);
            self.drop_link();
            return SendOutcome::Dropped;
        }

        match self.monitor.wait_ack(self.settings.ack_timeout) {
            Some(Ack::FrameOk) => SendOutcome::Confirmed,
            Some(Ack::ChecksumError) => {
                log::warn!("Device reported a checksum error");
                SendOutcome::Rejected
            }
            None => {
                log::warn!(
                    "No frame confirmation within {:?}; proceeding",
                    self.settings.ack_timeout
                );
                SendOutcome::Unconfirmed
            }
        }
    }

    fn write_chunked(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let Some(link) = self.link.as_mut() else {
            return Err(TransportError::ShortWrite {
                written: 0,
                total: bytes.len(),
            });
        };
        let mut written = 0;
        for chunk in bytes.chunks(self.settings.chunk_size) {
            let n = link.write(chunk)?;
            written += n;
            if n != chunk.len() {
                return Err(TransportError::ShortWrite {
                    written,
                    total: bytes.len(),
                });
            }
            link.flush()?;
            if !self.settings.chunk_delay.is_zero() {
                thread::sleep(self.settings.chunk_delay);
            }
        }
        Ok(())
    }
}
