//! Session configuration.
//!
//! Configuration is a [ron] document; every section and field is optional
//! and falls back to its default. A file that only changes the listen port
//! looks like this:
//!
//! ```text
//! (network: (listen_port: 7001))
//! ```

use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};
use thiserror::Error;

/// Largest number of samples a single frame may carry.
pub const MAX_FRAME_SAMPLES: usize = 8192;

/// Things that go wrong while reading or checking a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ron error: {0}")]
    Ron(#[from] ron::error::SpannedError),

    #[error("ron serialization error: {0}")]
    RonSer(#[from] ron::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration for a [Session](crate::session::Session).
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Rates and frame sizes.
    pub audio: AudioConfig,
    /// Sockets and addresses.
    pub network: NetworkConfig,
    /// How direction and distance shape the output.
    pub spatial: SpatialConfig,
    /// The speaking indicator.
    pub speech: SpeechConfig,
}

/// Sample format shared by capture, the wire and render.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Samples per second, mono.
    pub sample_rate: u32,
    /// Samples per network frame.
    pub frame_size: usize,
    /// Samples per render tick (one hardware buffer period). `frame_size`
    /// must be a multiple of it.
    pub render_period: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            frame_size: 960,
            render_period: 480,
        }
    }
}

impl AudioConfig {
    /// How long one render tick lasts.
    pub fn render_interval(&self) -> Duration {
        samples_to_duration(self.render_period, self.sample_rate)
    }

    /// How long one network frame lasts.
    pub fn frame_interval(&self) -> Duration {
        samples_to_duration(self.frame_size, self.sample_rate)
    }
}

fn samples_to_duration(samples: usize, sample_rate: u32) -> Duration {
    Duration::from_nanos(samples as u64 * 1_000_000_000 / sample_rate.max(1) as u64)
}

/// Addresses, ports and timing of the UDP channels.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local address the sockets bind to.
    pub bind_host: String,
    /// Local port of the broadcast socket; 0 picks an ephemeral port.
    pub broadcast_port: u16,
    /// Port the subscribe socket listens on.
    pub listen_port: u16,
    /// Destination of broadcast frames.
    pub destination_host: String,
    /// Destination port of broadcast frames.
    pub destination_port: u16,
    /// Allow sending to broadcast addresses.
    pub allow_broadcast: bool,
    /// Per-frame send timeout.
    pub send_timeout_ms: u64,
    /// How often the broadcast channel pings for round-trip latency.
    pub latency_ping_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_owned(),
            broadcast_port: 0,
            listen_port: 7000,
            destination_host: "127.0.0.1".to_owned(),
            destination_port: 7000,
            allow_broadcast: true,
            send_timeout_ms: 2000,
            latency_ping_interval_ms: 1000,
        }
    }
}

impl NetworkConfig {
    /// [send_timeout_ms](Self::send_timeout_ms) as a [Duration].
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// [latency_ping_interval_ms](Self::latency_ping_interval_ms) as a
    /// [Duration].
    pub fn latency_ping_interval(&self) -> Duration {
        Duration::from_millis(self.latency_ping_interval_ms)
    }
}

/// Parameters of the directional cue.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SpatialConfig {
    /// Distance under which the peer is heard at full level.
    pub reference_distance_m: f64,
    /// Steepness of the inverse-distance falloff.
    pub rolloff: f64,
    /// Quietest a far peer can get.
    pub min_gain: f64,
    /// Fraction of level removed for a source directly behind.
    pub rear_damping: f64,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            reference_distance_m: 10.0,
            rolloff: 1.0,
            min_gain: 0.1,
            rear_damping: 0.3,
        }
    }
}

/// When the peer counts as speaking.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Peak amplitude (0..1) that counts as voice.
    pub threshold: f32,
    /// How long the indicator stays on after the last loud frame.
    pub hold_ms: u64,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            threshold: 0.05,
            hold_ms: 400,
        }
    }
}

impl SpeechConfig {
    /// [hold_ms](Self::hold_ms) as a [Duration].
    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }
}

impl SessionConfig {
    /// Parses and validates a configuration from RON text.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = ron::de::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_ron(&text)
    }

    /// Writes the configuration as pretty RON.
    pub fn to_path(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Rejects values the pipeline cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let audio = &self.audio;
        if audio.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample_rate must be positive".into()));
        }
        if audio.frame_size == 0 || audio.frame_size > MAX_FRAME_SAMPLES {
            return Err(ConfigError::Invalid(format!(
                "frame_size must be within 1..={MAX_FRAME_SAMPLES}, got {}",
                audio.frame_size
            )));
        }
        if audio.render_period == 0 || audio.render_period > MAX_FRAME_SAMPLES {
            return Err(ConfigError::Invalid(format!(
                "render_period must be within 1..={MAX_FRAME_SAMPLES}, got {}",
                audio.render_period
            )));
        }
        // a frame must end on a tick boundary, or every frame's last tick is
        // padded with silence
        if audio.frame_size % audio.render_period != 0 {
            return Err(ConfigError::Invalid(format!(
                "frame_size ({}) must be a multiple of render_period ({})",
                audio.frame_size, audio.render_period
            )));
        }
        if self.network.send_timeout_ms == 0 {
            return Err(ConfigError::Invalid("send_timeout_ms must be positive".into()));
        }
        if self.network.latency_ping_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "latency_ping_interval_ms must be positive".into(),
            ));
        }
        let spatial = &self.spatial;
        if !(spatial.reference_distance_m > 0.0) {
            return Err(ConfigError::Invalid(
                "reference_distance_m must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&spatial.min_gain) || !(0.0..=1.0).contains(&spatial.rear_damping)
        {
            return Err(ConfigError::Invalid(
                "min_gain and rear_damping must be within 0..=1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.speech.threshold) {
            return Err(ConfigError::Invalid("speech threshold must be within 0..=1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        let config = SessionConfig::from_ron("()").unwrap();
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let config =
            SessionConfig::from_ron("(network: (listen_port: 7001), speech: (hold_ms: 250))")
                .unwrap();
        assert_eq!(config.network.listen_port, 7001);
        assert_eq!(config.network.destination_port, 7000);
        assert_eq!(config.speech.hold(), Duration::from_millis(250));
        assert_eq!(config.audio, AudioConfig::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            SessionConfig::from_ron("(audio: (frame_size: 0))"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            SessionConfig::from_ron("(spatial: (min_gain: 2.0))"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            SessionConfig::from_ron("(network: (send_timeout_ms: 0))"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn frames_must_span_whole_render_ticks() {
        assert!(matches!(
            SessionConfig::from_ron("(audio: (frame_size: 960, render_period: 512))"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            SessionConfig::from_ron("(audio: (frame_size: 480, render_period: 960))"),
            Err(ConfigError::Invalid(_))
        ));
        let config =
            SessionConfig::from_ron("(audio: (frame_size: 1024, render_period: 256))").unwrap();
        assert_eq!(config.audio.frame_size / config.audio.render_period, 4);
    }

    #[test]
    fn malformed_document_is_a_ron_error() {
        assert!(matches!(
            SessionConfig::from_ron("(audio: (sample_rate: \"fast\"))"),
            Err(ConfigError::Ron(_))
        ));
    }

    #[test]
    fn write_and_read_path() {
        let tempfile = tempfile::NamedTempFile::new().unwrap();
        let mut config = SessionConfig::default();
        config.network.destination_host = "192.168.1.20".to_owned();
        config.spatial.rolloff = 2.5;

        config.to_path(tempfile.path()).unwrap();
        let read = SessionConfig::from_path(tempfile.path()).unwrap();
        assert_eq!(config, read);
    }

    #[test]
    fn intervals() {
        let audio = AudioConfig::default();
        assert_eq!(audio.render_interval(), Duration::from_millis(10));
        assert_eq!(audio.frame_interval(), Duration::from_millis(20));
    }
}
