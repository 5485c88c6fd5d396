use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "jukeled", about = "Music-synchronized LED light shows")]
pub struct Cli {
    /// Config file (default: ./jukeled.toml, then the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the event hub with the song queue, player and prefetcher
    Serve {
        /// Listen address, e.g. 0.0.0.0:5000
        #[arg(long)]
        listen: Option<String>,
    },

    /// Relay light frames from the hub to a serial LED driver
    Bridge {
        #[command(flatten)]
        device: DeviceArgs,

        /// Hub address, e.g. 127.0.0.1:5000
        #[arg(long)]
        server: Option<String>,
    },

    /// Analyze an audio file and write its light show as JSON
    Analyze {
        /// Input audio file (WAV, MP3, FLAC, OGG)
        input: PathBuf,

        /// Output light show file (default: <lightshow_dir>/<stem>.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Play an audio file locally with its light show
    Play {
        input: PathBuf,

        /// Stream frames straight to this serial device
        #[arg(long)]
        port: Option<String>,

        #[arg(long)]
        baud: Option<u32>,

        /// Use this light show instead of building one
        #[arg(long)]
        show: Option<PathBuf>,
    },

    /// Light each strip in a solid color to check wiring
    TestPattern {
        #[command(flatten)]
        device: DeviceArgs,
    },
}

#[derive(clap::Args, Debug)]
pub struct DeviceArgs {
    /// Serial port of the LED driver, e.g. /dev/ttyACM0 or COM7
    #[arg(long)]
    pub port: Option<String>,

    #[arg(long)]
    pub baud: Option<u32>,

    /// Total LED count reported by the device, if it differs from the strips
    #[arg(long)]
    pub leds: Option<usize>,

    /// Strip lengths in order, comma-separated
    #[arg(long, value_delimiter = ',')]
    pub segments: Vec<usize>,
}
