//! Turns a flat mono voice into a directional cue.
//!
//! The perceived angle of the peer is its compass bearing minus the
//! listener's true-north yaw. That angle drives a constant-power stereo pan,
//! sources behind the listener are slightly damped so front and back are
//! distinguishable, and an inverse-distance model attenuates far peers.

use crate::config::SpatialConfig;
use crate::geo::{signed_degrees, BearingDistance};
use crate::orientation::OrientationSample;
use std::f64::consts::FRAC_PI_4;

/// Everything the render tick needs to know about where the peer is.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SpatialParams {
    /// The listener's latest head orientation.
    pub orientation: OrientationSample,
    /// `None` until both our own and the peer's position are known.
    pub target: Option<BearingDistance>,
}

/// Per-channel gains derived from one [SpatialParams] snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialCue {
    /// Perceived source angle in `(-180, 180]`; positive is to the right.
    pub angle_degrees: f64,
    /// Gain applied to every channel for range and rear damping.
    pub level: f32,
    /// Gain for channel 0, `level` included.
    pub left_gain: f32,
    /// Gain for channel 1, `level` included.
    pub right_gain: f32,
}

impl SpatialCue {
    /// Leaves the signal untouched; used while the peer's position is unknown.
    pub const PASSTHROUGH: SpatialCue = SpatialCue {
        angle_degrees: 0.0,
        level: 1.0,
        left_gain: 1.0,
        right_gain: 1.0,
    };
}

/// Applies the orientation/bearing cue to rendered samples.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialEffectApplier {
    reference_distance: f64,
    rolloff: f64,
    min_gain: f64,
    rear_damping: f64,
}

impl Default for SpatialEffectApplier {
    fn default() -> Self {
        Self::new(&SpatialConfig::default())
    }
}

impl SpatialEffectApplier {
    /// Builds an applier from the spatial section of the session config.
    pub fn new(config: &SpatialConfig) -> Self {
        Self {
            reference_distance: config.reference_distance_m.max(f64::EPSILON),
            rolloff: config.rolloff.max(0.0),
            min_gain: config.min_gain.clamp(0.0, 1.0),
            rear_damping: config.rear_damping.clamp(0.0, 1.0),
        }
    }

    /// Computes the cue for a listener orientation and a peer bearing.
    pub fn cue(&self, orientation: &OrientationSample, target: &BearingDistance) -> SpatialCue {
        let angle_degrees = perceived_angle(target.bearing_degrees, orientation.yaw);
        let theta = angle_degrees.to_radians();

        let rear = 1.0 - self.rear_damping * (1.0 - theta.cos()) / 2.0;
        let level = self.distance_gain(target.distance_meters) * rear;

        // constant power: left² + right² == level²
        let pan = (theta.sin() + 1.0) * FRAC_PI_4;

        SpatialCue {
            angle_degrees,
            level: level as f32,
            left_gain: (pan.cos() * level) as f32,
            right_gain: (pan.sin() * level) as f32,
        }
    }

    /// Like [cue](Self::cue) but falls back to [SpatialCue::PASSTHROUGH]
    /// when the peer's bearing is not known yet.
    pub fn cue_for(&self, params: &SpatialParams) -> SpatialCue {
        match &params.target {
            Some(target) => self.cue(&params.orientation, target),
            None => SpatialCue::PASSTHROUGH,
        }
    }

    /// Spatializes a mono block into a `(left, right)` pair.
    pub fn apply(
        &self,
        orientation: &OrientationSample,
        target: &BearingDistance,
        samples: &[f32],
    ) -> (Vec<f32>, Vec<f32>) {
        let cue = self.cue(orientation, target);
        let left = samples.iter().map(|s| s * cue.left_gain).collect();
        let right = samples.iter().map(|s| s * cue.right_gain).collect();
        (left, right)
    }

    /// Applies a cue in place to an output bus whose channels already hold
    /// the same mono signal. Channel 0 is left and channel 1 is right; any
    /// further channels only get the level. Does not allocate.
    pub fn apply_to_bus(cue: &SpatialCue, bus: &mut [&mut [f32]]) {
        match bus {
            [] => {}
            [mono] => scale(mono, cue.level),
            [left, right, rest @ ..] => {
                scale(left, cue.left_gain);
                scale(right, cue.right_gain);
                for channel in rest {
                    scale(channel, cue.level);
                }
            }
        }
    }

    fn distance_gain(&self, distance: f64) -> f64 {
        if distance <= self.reference_distance {
            return 1.0;
        }
        let gain = self.reference_distance
            / (self.reference_distance + self.rolloff * (distance - self.reference_distance));
        gain.max(self.min_gain)
    }
}

/// Where the peer appears relative to the listener's nose, in `(-180, 180]`.
pub fn perceived_angle(bearing_degrees: f64, yaw_degrees: f64) -> f64 {
    signed_degrees(bearing_degrees - yaw_degrees)
}

fn scale(channel: &mut [f32], gain: f32) {
    for sample in channel.iter_mut() {
        *sample *= gain;
    }
}
