//! The true-north orientation tracker.
//!
//! Compass headings and relative device-motion attitudes arrive from
//! independent sensors. Neither alone is enough: the compass is absolute but
//! noisy and only knows about yaw, while headphone motion is smooth but only
//! relative to wherever the device happened to be when it started. The
//! tracker captures an *anchor* (the first motion sample after a reset,
//! paired with the heading reference at that instant) and reports every
//! later sample as a delta against it, with the heading folded into yaw.

use crate::geo::normalize_degrees;
use std::f64::consts::PI;

/// Raw device attitude, in radians, as reported by the motion sensor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MotionAttitude {
    /// Rotation about the vertical axis; the device reports it growing
    /// counter-clockwise.
    pub yaw: f64,
    /// Rotation about the ear-to-ear axis.
    pub pitch: f64,
    /// Rotation about the front-to-back axis.
    pub roll: f64,
}

impl MotionAttitude {
    /// Attitude from yaw, pitch and roll in radians.
    pub fn new(yaw: f64, pitch: f64, roll: f64) -> Self {
        Self { yaw, pitch, roll }
    }
}

/// Listener orientation in degrees, relative to the calibration anchor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OrientationSample {
    /// Turn away from the anchor, clockwise positive, with the anchor's
    /// heading reference folded in. Not wrapped.
    pub yaw: f64,
    /// Change in pitch since the anchor.
    pub pitch: f64,
    /// Change in roll since the anchor.
    pub roll: f64,
}

/// The outcome of feeding one compass reading to the tracker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadingUpdate {
    /// The reading, wrapped into `[0, 360)`.
    pub heading: f64,
    /// Shortest signed step from the previous reading, in `[-180, 180]`.
    pub delta: f64,
    /// Continuous counter-clockwise dial angle, suitable for rotating a map
    /// without a jump when the heading crosses north.
    pub dial: f64,
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    motion: MotionAttitude,
    heading_reference: f64,
}

/// Fuses compass heading and relative motion into a true-north orientation.
///
/// The tracker is a plain state machine; callers funnel every heading,
/// motion and reset event through a single owner (see
/// [SensorFusion](crate::sensor_fusion::SensorFusion)) so that events are
/// applied in one order.
#[derive(Debug, Clone, Default)]
pub struct GeoOrientationTracker {
    heading: Option<f64>,
    dial: f64,
    anchor: Option<Anchor>,
    orientation: OrientationSample,
}

impl GeoOrientationTracker {
    /// A tracker with no heading and no anchor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a compass heading in degrees clockwise from north.
    pub fn on_heading_update(&mut self, heading_degrees: f64) -> HeadingUpdate {
        let heading = normalize_degrees(heading_degrees);
        let delta = match self.heading {
            Some(previous) => shortest_delta(previous, heading),
            None => 0.0,
        };

        match self.heading {
            // The dial turns against the compass, like the map under a
            // heading-up view.
            Some(_) => self.dial -= delta,
            None => self.dial = normalize_degrees(360.0 - heading),
        }
        self.heading = Some(heading);

        HeadingUpdate {
            heading,
            delta,
            dial: self.dial,
        }
    }

    /// Feeds one motion sample. Returns the new orientation, or `None` if
    /// this sample became the anchor.
    pub fn on_motion_sample(&mut self, sample: MotionAttitude) -> Option<OrientationSample> {
        let anchor = match self.anchor {
            Some(anchor) => anchor,
            None => {
                self.anchor = Some(Anchor {
                    motion: sample,
                    heading_reference: self.heading_reference(),
                });
                return None;
            }
        };

        self.orientation = OrientationSample {
            yaw: to_degrees(anchor.motion.yaw - sample.yaw) - anchor.heading_reference,
            pitch: to_degrees(anchor.motion.pitch - sample.pitch),
            roll: to_degrees(anchor.motion.roll - sample.roll),
        };
        Some(self.orientation)
    }

    /// Forgets the anchor; the next motion sample re-anchors. Output falls
    /// back to the zero orientation until then.
    pub fn reset_anchor(&mut self) {
        self.anchor = None;
        self.orientation = OrientationSample::default();
    }

    /// The latest orientation, or all zeros if no anchor exists yet.
    pub fn current_orientation(&self) -> OrientationSample {
        self.orientation
    }

    /// The latest normalized heading, if any compass reading has arrived.
    pub fn heading(&self) -> Option<f64> {
        self.heading
    }

    /// True once a motion sample has been captured as the anchor.
    pub fn is_anchored(&self) -> bool {
        self.anchor.is_some()
    }

    /// The counter-clockwise reading subtracted from motion yaw. Zero when
    /// no heading is known.
    fn heading_reference(&self) -> f64 {
        match self.heading {
            Some(heading) => normalize_degrees(360.0 - heading),
            None => 0.0,
        }
    }
}

/// Signed difference `to - from` folded into `[-180, 180]`.
pub fn shortest_delta(from: f64, to: f64) -> f64 {
    let mut delta = to - from;
    if delta > 180.0 {
        delta -= 360.0;
    } else if delta < -180.0 {
        delta += 360.0;
    }
    delta
}

fn to_degrees(radians: f64) -> f64 {
    radians / PI * 180.0
}
