// Commandline argument parser using clap for UrbanRecorder

use crate::dummy_sensors::Walk;
use crate::geo::GeoPosition3D;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Spatial walkie-talkie with simulated sensors.
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct RecorderArgs {
    #[command(subcommand, long_about)]
    /// Which side of the conversation to run
    pub command: CommandTask,

    /// RON configuration file; built-in defaults are used without one
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Stop after this many seconds instead of running until interrupted
    #[arg(short = 't', long = "seconds", global = true)]
    pub seconds: Option<u64>,
}

/// What to run.
#[derive(Debug, Subcommand, Clone)]
pub enum CommandTask {
    /// Send a microphone, a WAV file or a synthetic voice to a peer
    #[command(about)]
    Broadcast(BroadcastCommand),

    /// Listen to a peer and render it spatially to the speakers or a WAV file
    #[command(about)]
    Subscribe(SubscribeCommand),

    /// Run a broadcaster and a listener in one process over loopback
    #[command(about)]
    Loopback(LoopbackCommand),

    /// Write the default configuration to a file and exit
    #[command(about)]
    InitConfig(InitConfigCommand),
}

/// Options for `broadcast`.
#[derive(Debug, Args, Clone)]
pub struct BroadcastCommand {
    /// Our identity, stamped on every frame
    #[arg(long = "id")]
    pub local_id: String,

    /// Who we are talking to
    #[arg(long = "to")]
    pub remote_id: String,

    /// Destination host, overriding the configuration
    #[arg(long)]
    pub host: Option<String>,

    /// Destination port, overriding the configuration
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Stream this WAV file instead of a synthetic voice
    #[arg(short = 'w', long = "wav")]
    pub wav: Option<PathBuf>,

    /// Start the WAV file over when it ends
    #[arg(long = "loop")]
    pub looping: bool,

    /// Capture the system's default input device
    #[arg(long, conflicts_with = "wav")]
    pub mic: bool,

    /// How the simulated sensors move
    #[command(flatten)]
    pub walk: WalkArgs,
}

/// Options for `subscribe`.
#[derive(Debug, Args, Clone)]
pub struct SubscribeCommand {
    /// Our identity
    #[arg(long = "id")]
    pub local_id: String,

    /// Only accept frames from this sender; empty accepts anyone
    #[arg(long = "from", default_value = "")]
    pub remote_id: String,

    /// Port to listen on, overriding the configuration
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Filename for the rendered stereo output
    #[arg(short = 'o', long = "out", required_unless_present = "speaker")]
    pub outfile: Option<PathBuf>,

    /// Play through the system's default output device
    #[arg(long, conflicts_with = "outfile")]
    pub speaker: bool,

    /// How the simulated sensors move
    #[command(flatten)]
    pub walk: WalkArgs,
}

/// Options for `loopback`.
#[derive(Debug, Args, Clone)]
pub struct LoopbackCommand {
    /// Filename for the rendered stereo output
    #[arg(short = 'o', long = "out")]
    pub outfile: PathBuf,

    /// Voice for the broadcaster, instead of a synthetic one
    #[arg(short = 'w', long = "wav")]
    pub wav: Option<PathBuf>,

    /// How far away the broadcaster stands, in meters
    #[arg(long, default_value_t = 50.0)]
    pub distance: f64,

    /// Where the broadcaster stands, in degrees clockwise from north
    #[arg(long, default_value_t = 90.0, allow_hyphen_values = true)]
    pub bearing: f64,

    /// How the simulated sensors move
    #[command(flatten)]
    pub walk: WalkArgs,
}

/// Options for `init-config`.
#[derive(Debug, Args, Clone)]
pub struct InitConfigCommand {
    /// Where to write the configuration
    pub path: PathBuf,
}

/// How the simulated sensors move.
#[derive(Debug, Args, Clone)]
pub struct WalkArgs {
    /// Starting latitude
    #[arg(long, default_value_t = 40.7580, allow_hyphen_values = true)]
    pub lat: f64,

    /// Starting longitude
    #[arg(long, default_value_t = -73.9855, allow_hyphen_values = true)]
    pub lon: f64,

    /// Starting compass heading in degrees
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    pub heading: f64,

    /// Degrees per second, clockwise
    #[arg(long = "turn-rate", default_value_t = 10.0, allow_hyphen_values = true)]
    pub turn_rate: f64,

    /// Walking speed in meters per second
    #[arg(long, default_value_t = 1.4)]
    pub speed: f64,

    /// Pretend the compass is missing
    #[arg(long = "no-compass")]
    pub no_compass: bool,

    /// Pretend headphone motion is missing
    #[arg(long = "no-motion")]
    pub no_motion: bool,
}

impl WalkArgs {
    /// The walk these options describe.
    pub fn walk(&self) -> Walk {
        Walk {
            origin: GeoPosition3D::new(self.lat, self.lon, Walk::default().origin.altitude),
            heading: self.heading,
            turn_rate: self.turn_rate,
            speed: self.speed,
            without_compass: self.no_compass,
            without_motion: self.no_motion,
            ..Walk::default()
        }
    }
}
