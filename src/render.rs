//! The real-time render tick.
//!
//! [RenderUnit] holds only what one tick needs: the read halves of the audio
//! and spatial slots, a readiness flag and its preallocated working
//! resources. [RenderUnit::render] never locks, allocates or panics; every
//! way it can fail ends in silence.

use crate::render_slot::SlotReader;
use crate::spatial::{SpatialEffectApplier, SpatialParams};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The payload of the shared render buffer: the most recently decoded frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderFrame {
    /// Bumped once per published frame; 0 is the empty initial frame.
    pub generation: u64,
    /// Mono PCM for one frame.
    pub samples: Vec<f32>,
}

#[derive(Debug)]
struct RenderResources {
    scratch: Vec<f32>,
    generation: u64,
    cursor: usize,
}

/// Pulls the freshest frame and writes it, spatialized, into an output bus.
pub struct RenderUnit {
    audio: SlotReader<RenderFrame>,
    spatial: SlotReader<SpatialParams>,
    ready: Arc<AtomicBool>,
    applier: SpatialEffectApplier,
    resources: Option<RenderResources>,
}

impl RenderUnit {
    /// Assembles a unit. It renders silence until
    /// [allocate_resources](Self::allocate_resources) is called and `ready`
    /// is set.
    pub fn new(
        audio: SlotReader<RenderFrame>,
        spatial: SlotReader<SpatialParams>,
        ready: Arc<AtomicBool>,
        applier: SpatialEffectApplier,
    ) -> Self {
        Self {
            audio,
            spatial,
            ready,
            applier,
            resources: None,
        }
    }

    /// Allocates the working buffer for ticks of up to `max_frames` samples.
    /// Call on engine start, off the real-time thread.
    pub fn allocate_resources(&mut self, max_frames: usize) {
        self.resources = Some(RenderResources {
            scratch: vec![0.0; max_frames],
            generation: 0,
            cursor: 0,
        });
    }

    /// Releases the working buffer. Call on engine stop.
    pub fn deallocate_resources(&mut self) {
        self.resources = None;
    }

    /// True once resources exist.
    pub fn has_resources(&self) -> bool {
        self.resources.is_some()
    }

    /// Renders one tick into `bus`, one slice per output channel. Returns how
    /// many samples of real audio were rendered; the rest of every channel is
    /// silence. A frame is only ever played once.
    pub fn render(&mut self, bus: &mut [&mut [f32]]) -> usize {
        let resources = match self.resources.as_mut() {
            Some(resources) if self.ready.load(Ordering::Acquire) => resources,
            _ => {
                silence(bus);
                return 0;
            }
        };

        let frames = bus
            .iter()
            .map(|channel| channel.len())
            .min()
            .unwrap_or(0)
            .min(resources.scratch.len());

        let frame = self.audio.read();
        if frame.generation != resources.generation {
            resources.generation = frame.generation;
            resources.cursor = 0;
        }
        let cursor = resources.cursor.min(frame.samples.len());
        let played = (frame.samples.len() - cursor).min(frames);

        let scratch = &mut resources.scratch[..frames];
        scratch[..played].copy_from_slice(&frame.samples[cursor..cursor + played]);
        scratch[played..].fill(0.0);
        resources.cursor = cursor + played;

        for channel in bus.iter_mut() {
            let (head, tail) = channel.split_at_mut(frames);
            head.copy_from_slice(scratch);
            tail.fill(0.0);
        }

        if played > 0 {
            let cue = self.applier.cue_for(self.spatial.read());
            SpatialEffectApplier::apply_to_bus(&cue, bus);
        }
        played
    }
}

fn silence(bus: &mut [&mut [f32]]) {
    for channel in bus.iter_mut() {
        channel.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::BearingDistance;
    use crate::render_slot::{triple_buffer, SlotWriter};

    struct Rig {
        unit: RenderUnit,
        audio: SlotWriter<RenderFrame>,
        spatial: SlotWriter<SpatialParams>,
        ready: Arc<AtomicBool>,
    }

    fn rig() -> Rig {
        let (audio, audio_reader) = triple_buffer(RenderFrame::default());
        let (spatial, spatial_reader) = triple_buffer(SpatialParams::default());
        let ready = Arc::new(AtomicBool::new(true));
        let unit = RenderUnit::new(
            audio_reader,
            spatial_reader,
            ready.clone(),
            SpatialEffectApplier::default(),
        );
        Rig {
            unit,
            audio,
            spatial,
            ready,
        }
    }

    fn publish(rig: &mut Rig, generation: u64, samples: &[f32]) {
        rig.audio.write(RenderFrame {
            generation,
            samples: samples.to_vec(),
        });
    }

    #[test]
    fn no_resources_renders_silence() {
        let mut rig = rig();
        publish(&mut rig, 1, &[0.5; 4]);
        let (mut left, mut right) = ([1.0; 4], [1.0; 4]);
        assert_eq!(rig.unit.render(&mut [&mut left[..], &mut right[..]]), 0);
        assert_eq!(left, [0.0; 4]);
        assert_eq!(right, [0.0; 4]);

        // and nothing at all to render into is fine too
        assert_eq!(rig.unit.render(&mut []), 0);
    }

    #[test]
    fn not_ready_renders_silence() {
        let mut rig = rig();
        rig.unit.allocate_resources(4);
        rig.ready.store(false, Ordering::Release);
        publish(&mut rig, 1, &[0.5; 4]);
        let mut mono = [1.0; 4];
        assert_eq!(rig.unit.render(&mut [&mut mono[..]]), 0);
        assert_eq!(mono, [0.0; 4]);
    }

    #[test]
    fn mono_is_fanned_out_to_every_channel() {
        let mut rig = rig();
        rig.unit.allocate_resources(4);
        publish(&mut rig, 1, &[0.1, 0.2, 0.3, 0.4]);

        let (mut a, mut b, mut c) = ([0.0; 4], [0.0; 4], [0.0; 4]);
        let rendered = rig.unit.render(&mut [&mut a[..], &mut b[..], &mut c[..]]);
        assert_eq!(rendered, 4);
        assert_eq!(a, [0.1, 0.2, 0.3, 0.4]);
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn frame_is_played_once_across_ticks() {
        let mut rig = rig();
        rig.unit.allocate_resources(4);
        publish(&mut rig, 1, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let mut out = [0.0; 4];
        assert_eq!(rig.unit.render(&mut [&mut out[..]]), 4);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(rig.unit.render(&mut [&mut out[..]]), 2);
        assert_eq!(out, [5.0, 6.0, 0.0, 0.0]);
        assert_eq!(rig.unit.render(&mut [&mut out[..]]), 0);
        assert_eq!(out, [0.0; 4]);

        // a newer frame starts from its beginning
        publish(&mut rig, 2, &[7.0; 3]);
        assert_eq!(rig.unit.render(&mut [&mut out[..]]), 3);
        assert_eq!(out, [7.0, 7.0, 7.0, 0.0]);
    }

    #[test]
    fn bus_longer_than_resources_is_padded() {
        let mut rig = rig();
        rig.unit.allocate_resources(2);
        publish(&mut rig, 1, &[0.5; 8]);
        let mut out = [1.0; 4];
        assert_eq!(rig.unit.render(&mut [&mut out[..]]), 2);
        assert_eq!(out, [0.5, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn spatial_cue_is_applied() {
        let mut rig = rig();
        rig.unit.allocate_resources(4);
        rig.spatial.write(SpatialParams {
            orientation: Default::default(),
            target: Some(BearingDistance {
                bearing_degrees: 90.0,
                distance_meters: 1.0,
            }),
        });
        publish(&mut rig, 1, &[0.5; 4]);

        let (mut left, mut right) = ([0.0; 4], [0.0; 4]);
        rig.unit.render(&mut [&mut left[..], &mut right[..]]);
        assert!(right[0] > left[0]);
        assert!(left[0].abs() < 1e-6);
    }

    #[test]
    fn deallocated_unit_goes_quiet() {
        let mut rig = rig();
        rig.unit.allocate_resources(4);
        assert!(rig.unit.has_resources());
        rig.unit.deallocate_resources();
        publish(&mut rig, 1, &[0.5; 4]);
        let mut out = [1.0; 4];
        assert_eq!(rig.unit.render(&mut [&mut out[..]]), 0);
        assert_eq!(out, [0.0; 4]);
    }
}
