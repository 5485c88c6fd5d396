mod audio;
mod bridge;
mod cli;
mod config;
mod events;
mod hub;
mod playback;
mod queue;
mod show;
mod transport;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use audio::analysis::AnalysisParams;
use bridge::{Bridge, BridgeSettings};
use cli::{Cli, Command, DeviceArgs};
use config::Config;
use events::{EventBus, ShowEvent};
use hub::Hub;
use playback::clock::{Clock, SystemClock};
use playback::control::Controller;
use playback::output::default_factory;
use playback::state::PlaybackHandle;
use playback::sync::Synchronizer;
use queue::coordinator::QueueCoordinator;
use queue::download::HttpFetcher;
use queue::prefetch::Prefetcher;
use queue::worker::{PlayerContext, PlayerWorker};
use show::composer::{ComposerSettings, LightShowComposer};
use show::library::ShowLibrary;
use show::model::LightShow;
use transport::link::SerialPortConnector;
use transport::streamer::{FrameStreamer, StreamerSettings};

const PREFETCH_INTERVAL: Duration = Duration::from_secs(2);
const PLAYER_POLL: Duration = Duration::from_secs(1);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    let config = match config::discover(cli.config.as_deref()) {
        Some(path) => match config::load_config(&path) {
            Some(cfg) => {
                log::info!("Loaded config from {}", path.display());
                cfg
            }
            None => {
                log::warn!("Failed to load config from {}; using defaults", path.display());
                Config::with_defaults()
            }
        },
        None => Config::with_defaults(),
    };

    match cli.command {
        Command::Serve { listen } => serve(&config, listen),
        Command::Bridge { device, server } => run_bridge(&config, &device, server),
        Command::Analyze { input, output } => analyze(&config, &input, output.as_deref()),
        Command::Play {
            input,
            port,
            baud,
            show,
        } => play(&config, &input, port, baud, show.as_deref()),
        Command::TestPattern { device } => test_pattern(&config, &device),
    }
}

fn show_library(config: &Config) -> ShowLibrary {
    ShowLibrary::new(
        AnalysisParams::new(&config.audio, config.bands),
        LightShowComposer::new(
            config.strips.clone(),
            ComposerSettings::new(&config.audio, &config.show),
        ),
        &config.downloads.lightshow_dir,
    )
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).with_context(|| format!("Failed to create {}", path.display()))
}

/// Open the LED driver named on the command line or in the config.
fn open_streamer(config: &Config, device: &DeviceArgs) -> Result<(FrameStreamer, String)> {
    let port = device
        .port
        .clone()
        .or_else(|| config.bridge.port.clone())
        .context("No serial port given (use --port or set [bridge] port)")?;
    let baud = device.baud.unwrap_or(config.bridge.baud);
    let segments = if device.segments.is_empty() {
        config.strips.iter().map(|s| s.led_count).collect()
    } else {
        device.segments.clone()
    };
    log::info!("Serial device {} @ {} baud, segments {:?}", port, baud, segments);
    let streamer = FrameStreamer::new(
        Box::new(SerialPortConnector::new(&port, baud)),
        segments,
        device.leds,
        StreamerSettings::from_config(&config.bridge),
    )
    .context("Failed to set up the LED streamer")?;
    Ok((streamer, port))
}

fn serve(config: &Config, listen: Option<String>) -> Result<()> {
    ensure_dir(&config.downloads.dir)?;
    ensure_dir(&config.downloads.lightshow_dir)?;

    let fetcher = HttpFetcher::new().context("Failed to build HTTP client")?;
    let queue = Arc::new(
        QueueCoordinator::open(&config.downloads.dir, Box::new(fetcher))
            .context("Failed to open the song queue")?,
    );
    let bus = Arc::new(EventBus::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let playback = PlaybackHandle::new(clock.clone());
    let controller = Arc::new(Controller::new(playback.clone(), Some(queue.clone()), bus.clone()));

    let _prefetch = Prefetcher::spawn(queue.clone(), bus.clone(), PREFETCH_INTERVAL)
        .context("Failed to start the prefetch worker")?;
    let _player = PlayerWorker::spawn(
        PlayerContext {
            queue,
            bus: bus.clone(),
            playback,
            outputs: default_factory(clock),
            library: show_library(config),
            tick: Duration::from_millis(config.server.tick_ms.max(1)),
        },
        PLAYER_POLL,
    )
    .context("Failed to start the player")?;

    let listen = listen.unwrap_or_else(|| config.server.listen.clone());
    let hub = Hub::bind(&listen, bus, controller).with_context(|| format!("Failed to listen on {}", listen))?;
    hub.run().context("Event hub failed")
}

fn run_bridge(config: &Config, device: &DeviceArgs, server: Option<String>) -> Result<()> {
    let (streamer, port) = open_streamer(config, device)?;
    let mut bridge = Bridge::new(
        streamer,
        BridgeSettings {
            server: server.unwrap_or_else(|| config.bridge.server.clone()),
            reconnect: Duration::from_millis(config.bridge.reconnect_backoff_ms),
            port: Some(port),
        },
    );
    bridge.run()
}

fn analyze(config: &Config, input: &Path, output: Option<&Path>) -> Result<()> {
    if !input.exists() {
        anyhow::bail!("Input file not found: {}", input.display());
    }
    let library = show_library(config);

    log::info!("Analyzing audio...");
    let analysis = library.analyze(input)?;
    log::info!(
        "Duration {:.1}s, tempo {:.1} BPM, {} beats, {} onsets, {} analysis frames",
        analysis.duration,
        analysis.tempo,
        analysis.beat_times.len(),
        analysis.onset_times.len(),
        analysis.frame_count()
    );

    let pb = ProgressBar::new(library.frame_count(&analysis) as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} frames ({eta} remaining)")
            .context("Invalid progress bar template")?
            .progress_chars("=>-"),
    );
    let show = library.compose(&analysis, &|| pb.inc(1));
    pb.finish_with_message("Composition complete");

    let path = output.map_or_else(|| library.path_for(input), Path::to_path_buf);
    show.save(&path)?;
    log::info!(
        "Wrote {} frames ({} LEDs, {:.2} fps) to {}",
        show.frames.len(),
        show.total_leds(),
        show.fps,
        path.display()
    );
    Ok(())
}

fn play(
    config: &Config,
    input: &Path,
    port: Option<String>,
    baud: Option<u32>,
    show_path: Option<&Path>,
) -> Result<()> {
    if !input.exists() {
        anyhow::bail!("Input file not found: {}", input.display());
    }
    let show = match show_path {
        Some(path) => LightShow::load(path)?,
        None => show_library(config).load_or_build(input)?,
    };

    let bus = Arc::new(EventBus::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let playback = PlaybackHandle::new(clock.clone());

    if port.is_some() || config.bridge.port.is_some() {
        let device = DeviceArgs {
            port,
            baud,
            leds: None,
            segments: show.strip_configs.iter().map(|s| s.led_count).collect(),
        };
        let (mut streamer, _) = open_streamer(config, &device)?;
        let frames = bus.subscribe();
        bus.bridge_connected();
        thread::Builder::new()
            .name("serial-relay".into())
            .spawn(move || {
                streamer.connect();
                for event in frames.iter() {
                    let ShowEvent::LightFrame { mut strips, .. } = event else {
                        continue;
                    };
                    // only the newest frame matters once the device falls behind
                    for newer in frames.try_iter() {
                        if let ShowEvent::LightFrame { strips: s, .. } = newer {
                            strips = s;
                        }
                    }
                    streamer.send_frame(&strips);
                }
            })
            .context("Failed to start the serial relay")?;
    }

    let outputs = default_factory(clock);
    let output = outputs(input, show.duration)?;
    let report = Synchronizer::start(
        "local",
        show.duration,
        Some(show.frames),
        playback,
        bus,
        output,
        Duration::from_millis(config.server.tick_ms.max(1)),
    )
    .run();
    log::info!("Done: {:?}, {} frames sent", report.outcome, report.frames_sent);
    Ok(())
}

fn test_pattern(config: &Config, device: &DeviceArgs) -> Result<()> {
    let (mut streamer, port) = open_streamer(config, device)?;
    let info = streamer.device_info();
    streamer.connect();
    let outcome = streamer.send_test_pattern();
    println!("{}: {:?}", port, outcome);
    for info in info.try_iter() {
        println!("  {}", info.raw);
    }
    Ok(())
}
