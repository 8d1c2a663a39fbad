//! A software audio clock.
//!
//! Stands in for an output device: a thread wakes once per buffer period,
//! runs the [RenderUnit] into a stereo bus and passes the result downstream,
//! typically to a [HoundWriter](crate::hound_writer::HoundWriter).

use crate::config::AudioConfig;
use crate::render::RenderUnit;

use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// One rendered stereo block.
pub type StereoBlock = (Vec<f32>, Vec<f32>);

/// Drives a [RenderUnit] at a fixed buffer period.
pub struct RenderClock {
    running: Arc<AtomicBool>,
    handle: JoinHandle<RenderUnit>,
}

impl RenderClock {
    /// Allocates the unit's resources and starts ticking. Each tick's
    /// output is sent to `output`; the clock stops by itself once nobody
    /// listens any more.
    pub fn start(
        mut unit: RenderUnit,
        audio: &AudioConfig,
        output: Sender<StereoBlock>,
    ) -> std::io::Result<Self> {
        let period = audio.render_interval();
        let frames = audio.render_period;
        let running = Arc::new(AtomicBool::new(true));
        let th_running = running.clone();

        let handle = thread::Builder::new()
            .name("render-clock".to_owned())
            .spawn(move || {
                unit.allocate_resources(frames);
                let mut left = vec![0.0; frames];
                let mut right = vec![0.0; frames];
                let mut next = Instant::now();

                info!("RenderClock : ticking every {period:?}");
                while th_running.load(Ordering::Acquire) {
                    unit.render(&mut [&mut left[..], &mut right[..]]);
                    if output.send((left.clone(), right.clone())).is_err() {
                        warn!("RenderClock : output closed, stopping");
                        break;
                    }

                    next += period;
                    let now = Instant::now();
                    if next > now {
                        spin_sleep::sleep(next - now);
                    } else {
                        next = now;
                    }
                }
                unit.deallocate_resources();
                info!("RenderClock : stopped");
                unit
            })?;

        Ok(Self { running, handle })
    }

    /// Stops ticking and hands the unit back, resources released.
    pub fn stop(self) -> Option<RenderUnit> {
        self.running.store(false, Ordering::Release);
        self.handle.join().ok()
    }
}
