//! The single serialization point for sensor data.
//!
//! Heading, motion and location arrive from independent services, each
//! through its own typed feed. All feeds share one channel into the
//! [SensorFusion] component, which owns the orientation tracker and both
//! positions, so every event is applied in one order. After each event it
//! publishes the derived values and refreshes the spatial parameters the
//! render tick reads.

use crate::component::{Component, ComponentError};
use crate::geo::{bearing_and_distance, BearingDistance, GeoPosition3D};
use crate::orientation::{GeoOrientationTracker, HeadingUpdate, MotionAttitude, OrientationSample};
use crate::render_slot::SlotWriter;
use crate::spatial::SpatialParams;
use crate::transport::ChannelRole;
use crate::wire::FrameError;

use crossbeam::atomic::AtomicCell;
use log::{debug, warn};
use std::fmt;
use std::net::SocketAddr;
use std::sync::mpsc::Sender;
use std::sync::Arc;

/// The sensor services that can go missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    /// The compass.
    Heading,
    /// Headphone motion.
    Motion,
    /// Location fixes.
    Location,
}

/// One event on the sensor timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorEvent {
    /// Compass heading, degrees clockwise from true north.
    Heading(f64),
    /// A raw headphone attitude.
    Motion(MotionAttitude),
    /// Our own location fix.
    Location(GeoPosition3D),
    /// The peer's location, as stamped on its frames.
    PeerLocation(GeoPosition3D),
    /// Re-anchor the orientation on the next motion sample.
    ResetAnchor,
    /// A sensor will not deliver anything.
    Unavailable(SensorKind),
}

/// Something went wrong that the user should hear about.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureNotice {
    /// The user refused the microphone.
    PermissionDenied,
    /// Microphone trouble other than a denial.
    Capture(String),
    /// A channel could not be set up.
    TransportSetup {
        /// The channel that failed.
        role: ChannelRole,
        /// Which setup step failed.
        step: &'static str,
        /// Why.
        reason: String,
    },
    /// A sensor is missing; the related publications stop.
    SensorUnavailable(SensorKind),
    /// A datagram was not a frame we can play.
    DecodeMismatch {
        /// Where it came from.
        from: SocketAddr,
        /// What was wrong with it.
        error: FrameError,
    },
}

impl fmt::Display for FailureNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureNotice::PermissionDenied => write!(f, "microphone permission denied"),
            FailureNotice::Capture(reason) => write!(f, "capture failed: {reason}"),
            FailureNotice::TransportSetup { role, step, reason } => {
                write!(f, "{role} channel: {step} failed: {reason}")
            }
            FailureNotice::SensorUnavailable(kind) => write!(f, "{kind:?} sensor unavailable"),
            FailureNotice::DecodeMismatch { from, error } => {
                write!(f, "dropped frame from {from}: {error}")
            }
        }
    }
}

/// Everything the core tells the outside world, in one stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Publication {
    /// Our own location.
    Location(GeoPosition3D),
    /// A new compass reading.
    Heading(HeadingUpdate),
    /// The listener's head orientation.
    Orientation(OrientationSample),
    /// Where the peer is relative to us.
    PeerBearing(BearingDistance),
    /// Round-trip time to the broadcast destination.
    Latency(u64),
    /// The peer started or stopped talking.
    Speaking(bool),
    /// Something the user should hear about.
    Failure(FailureNotice),
}

impl fmt::Display for Publication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Publication::Location(position) => write!(f, "location {position}"),
            Publication::Heading(update) => write!(
                f,
                "heading {:.1}° (step {:+.1}°, dial {:.1}°)",
                update.heading, update.delta, update.dial
            ),
            Publication::Orientation(o) => write!(
                f,
                "orientation yaw {:.1}° pitch {:.1}° roll {:.1}°",
                o.yaw, o.pitch, o.roll
            ),
            Publication::PeerBearing(target) => write!(f, "peer at {target}"),
            Publication::Latency(ms) => write!(f, "latency {ms} ms"),
            Publication::Speaking(true) => write!(f, "peer started speaking"),
            Publication::Speaking(false) => write!(f, "peer went quiet"),
            Publication::Failure(notice) => write!(f, "failure: {notice}"),
        }
    }
}

/// Compass input.
#[derive(Debug, Clone)]
pub struct HeadingFeed(Sender<SensorEvent>);

/// Headphone or device motion input.
#[derive(Debug, Clone)]
pub struct MotionFeed(Sender<SensorEvent>);

/// Location input.
#[derive(Debug, Clone)]
pub struct LocationFeed(Sender<SensorEvent>);

fn deliver(events: &Sender<SensorEvent>, event: SensorEvent) {
    if events.send(event).is_err() {
        debug!("sensor event {event:?} dropped, fusion has stopped");
    }
}

impl HeadingFeed {
    pub(crate) fn new(events: Sender<SensorEvent>) -> Self {
        Self(events)
    }

    /// Delivers a compass reading in degrees.
    pub fn heading(&self, degrees: f64) {
        deliver(&self.0, SensorEvent::Heading(degrees));
    }

    /// Reports that no headings will come.
    pub fn unavailable(&self) {
        deliver(&self.0, SensorEvent::Unavailable(SensorKind::Heading));
    }
}

impl MotionFeed {
    pub(crate) fn new(events: Sender<SensorEvent>) -> Self {
        Self(events)
    }

    /// Delivers a raw headphone attitude.
    pub fn attitude(&self, attitude: MotionAttitude) {
        deliver(&self.0, SensorEvent::Motion(attitude));
    }

    /// Reports that no motion will come.
    pub fn unavailable(&self) {
        deliver(&self.0, SensorEvent::Unavailable(SensorKind::Motion));
    }
}

impl LocationFeed {
    pub(crate) fn new(events: Sender<SensorEvent>) -> Self {
        Self(events)
    }

    /// Delivers our own location fix.
    pub fn location(&self, position: GeoPosition3D) {
        deliver(&self.0, SensorEvent::Location(position));
    }

    /// Reports that no fixes will come.
    pub fn unavailable(&self) {
        deliver(&self.0, SensorEvent::Unavailable(SensorKind::Location));
    }
}

/// One handle per sensor stream, all leading into the same fusion thread.
#[derive(Debug, Clone)]
pub struct SensorFeeds {
    /// Compass readings.
    pub heading: HeadingFeed,
    /// Headphone attitudes.
    pub motion: MotionFeed,
    /// Location fixes.
    pub location: LocationFeed,
}

impl SensorFeeds {
    pub(crate) fn new(events: &Sender<SensorEvent>) -> Self {
        Self {
            heading: HeadingFeed::new(events.clone()),
            motion: MotionFeed::new(events.clone()),
            location: LocationFeed::new(events.clone()),
        }
    }
}

/// Owns the orientation tracker and both positions.
pub struct SensorFusion {
    tracker: GeoOrientationTracker,
    own: Option<GeoPosition3D>,
    peer: Option<GeoPosition3D>,
    target: Option<BearingDistance>,
    spatial: SlotWriter<SpatialParams>,
    own_position: Arc<AtomicCell<Option<GeoPosition3D>>>,
}

impl SensorFusion {
    /// `spatial` receives fresh parameters after every event; `own_position`
    /// mirrors our latest fix for whoever stamps outgoing frames.
    pub fn new(
        spatial: SlotWriter<SpatialParams>,
        own_position: Arc<AtomicCell<Option<GeoPosition3D>>>,
    ) -> Self {
        Self {
            tracker: GeoOrientationTracker::new(),
            own: None,
            peer: None,
            target: None,
            spatial,
            own_position,
        }
    }

    fn retarget(&mut self, out: &mut Vec<Publication>) {
        let target = match (&self.own, &self.peer) {
            (Some(own), Some(peer)) => Some(bearing_and_distance(own, peer)),
            _ => None,
        };
        if target != self.target {
            self.target = target;
            if let Some(target) = target {
                out.push(Publication::PeerBearing(target));
            }
        }
    }
}

impl Component for SensorFusion {
    type InData = SensorEvent;
    type OutData = Publication;

    fn convert(&mut self, event: SensorEvent) -> Vec<Publication> {
        let mut out = Vec::with_capacity(2);
        match event {
            SensorEvent::Heading(degrees) => {
                out.push(Publication::Heading(self.tracker.on_heading_update(degrees)));
            }
            SensorEvent::Motion(attitude) => {
                self.tracker.on_motion_sample(attitude);
                out.push(Publication::Orientation(self.tracker.current_orientation()));
            }
            SensorEvent::Location(position) => {
                self.own = Some(position);
                self.own_position.store(Some(position));
                out.push(Publication::Location(position));
                self.retarget(&mut out);
            }
            SensorEvent::PeerLocation(position) => {
                self.peer = Some(position);
                self.retarget(&mut out);
            }
            SensorEvent::ResetAnchor => {
                self.tracker.reset_anchor();
                out.push(Publication::Orientation(self.tracker.current_orientation()));
            }
            SensorEvent::Unavailable(kind) => {
                warn!("{} : {kind:?} sensor unavailable", self.to_string());
                out.push(Publication::Failure(FailureNotice::SensorUnavailable(kind)));
            }
        }

        self.spatial.write(SpatialParams {
            orientation: self.tracker.current_orientation(),
            target: self.target,
        });
        out
    }

    fn finalize(&mut self) -> Result<(), ComponentError> {
        Ok(())
    }
}

impl ToString for SensorFusion {
    fn to_string(&self) -> String {
        "SensorFusion".to_string()
    }
}
