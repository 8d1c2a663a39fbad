//! The "peer is speaking" indicator and stale-frame filtering for the
//! receive path.

use crate::config::SpeechConfig;
use std::time::{Duration, Instant};

/// Turns frame peaks into on/off edges. The indicator switches on with the
/// first loud frame and off once no loud frame arrived for the hold time.
#[derive(Debug, Clone)]
pub struct SpeechDetector {
    threshold: f32,
    hold: Duration,
    last_voice: Option<Instant>,
    speaking: bool,
}

impl SpeechDetector {
    /// A detector using the threshold and hold time from `config`.
    pub fn new(config: &SpeechConfig) -> Self {
        Self {
            threshold: config.threshold,
            hold: config.hold(),
            last_voice: None,
            speaking: false,
        }
    }

    /// Feeds the peak of one received frame. Returns the new state if it
    /// changed.
    pub fn observe(&mut self, peak: f32, now: Instant) -> Option<bool> {
        if peak >= self.threshold {
            self.last_voice = Some(now);
            if !self.speaking {
                self.speaking = true;
                return Some(true);
            }
            return None;
        }
        self.expire(now)
    }

    /// Switches off after the hold time. Returns `Some(false)` on the edge.
    pub fn expire(&mut self, now: Instant) -> Option<bool> {
        let held = self
            .last_voice
            .map_or(false, |last| now.saturating_duration_since(last) < self.hold);
        if self.speaking && !held {
            self.speaking = false;
            return Some(false);
        }
        None
    }

    /// Switches off immediately, e.g. on channel teardown.
    pub fn reset(&mut self) -> Option<bool> {
        self.last_voice = None;
        std::mem::replace(&mut self.speaking, false).then_some(false)
    }

    /// Whether the indicator is currently on.
    pub fn is_speaking(&self) -> bool {
        self.speaking
    }
}

/// How far back a sequence may jump before it counts as a sender restart
/// rather than a late frame.
pub const MAX_REORDER: u32 = 64;

/// What [SequenceFilter::check] made of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Newer than anything accepted so far.
    Next,
    /// The sender started counting again; history was forgotten.
    Restart,
    /// Arrived after a newer frame. Drop it.
    Stale,
}

/// Drops frames that arrive after a newer one. Sequence numbers wrap, so
/// "newer" means ahead by less than half the number space.
///
/// A broadcaster that stops and starts again counts from zero. A frame that
/// is behind the last accepted one but was stamped later, or that is more
/// than [MAX_REORDER] frames behind, is taken as such a restart.
#[derive(Debug, Clone, Default)]
pub struct SequenceFilter {
    last: Option<(u32, u64)>,
}

impl SequenceFilter {
    /// Classifies a frame by its sequence number and sender timestamp, and
    /// remembers it unless it is stale.
    pub fn check(&mut self, sequence: u32, timestamp_ms: u64) -> SequenceCheck {
        let verdict = match self.last {
            None => SequenceCheck::Next,
            Some((last, _)) if (sequence.wrapping_sub(last) as i32) > 0 => SequenceCheck::Next,
            Some((last, last_ms)) => {
                if timestamp_ms > last_ms || last.wrapping_sub(sequence) > MAX_REORDER {
                    SequenceCheck::Restart
                } else {
                    SequenceCheck::Stale
                }
            }
        };
        if verdict != SequenceCheck::Stale {
            self.last = Some((sequence, timestamp_ms));
        }
        verdict
    }

    /// True unless the frame is [stale](SequenceCheck::Stale).
    pub fn accept(&mut self, sequence: u32, timestamp_ms: u64) -> bool {
        self.check(sequence, timestamp_ms) != SequenceCheck::Stale
    }

    /// Forgets the history.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
