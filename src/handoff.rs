//! The decode-and-handoff step between the subscribe transport and the
//! render tick.
//!
//! Runs on the transport's receive thread, once per datagram. A frame that
//! does not decode, has the wrong size, comes from someone else, or is older
//! than one already handed off is dropped; the render tick never notices.

use crate::render::RenderFrame;
use crate::render_slot::SlotWriter;
use crate::sensor_fusion::{FailureNotice, Publication, SensorEvent};
use crate::speech::{SequenceCheck, SequenceFilter, SpeechDetector};
use crate::transport::ChannelBinding;
use crate::wire::{self, Packet};

use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

struct WriterState {
    slot: SlotWriter<RenderFrame>,
    generation: u64,
}

/// The write side of the shared render buffer. Only the network domain
/// locks this; the render tick holds the lock-free read half.
///
/// Generations keep counting across channel restarts, so the render tick
/// never mistakes a new frame for one it already played.
pub struct RenderWriter {
    state: Mutex<WriterState>,
}

impl RenderWriter {
    /// Takes over the write half of the render slot.
    pub fn new(slot: SlotWriter<RenderFrame>) -> Self {
        Self {
            state: Mutex::new(WriterState {
                slot,
                generation: 0,
            }),
        }
    }

    /// Replaces the shared frame with `samples`. Returns its generation.
    pub fn publish(&self, samples: &[f32]) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.generation += 1;
        let generation = state.generation;
        state.slot.write_with(|frame| {
            frame.generation = generation;
            frame.samples.clear();
            frame.samples.extend_from_slice(samples);
        });
        generation
    }

    /// Replaces the shared frame with an empty one.
    pub fn clear(&self) {
        self.publish(&[]);
    }
}

/// Decodes datagrams and publishes accepted frames for rendering.
pub struct FrameHandoff {
    binding: ChannelBinding,
    frame_size: usize,
    render: Arc<RenderWriter>,
    speech: Arc<Mutex<SpeechDetector>>,
    sequence: SequenceFilter,
    events: Sender<SensorEvent>,
    publications: Sender<Publication>,
}

impl FrameHandoff {
    /// Accepts frames of `frame_size` samples for `binding`, publishing audio
    /// to `render`, peer positions to `events` and speech edges and decode
    /// failures to `publications`.
    pub fn new(
        binding: ChannelBinding,
        frame_size: usize,
        render: Arc<RenderWriter>,
        speech: Arc<Mutex<SpeechDetector>>,
        events: Sender<SensorEvent>,
        publications: Sender<Publication>,
    ) -> Self {
        Self {
            binding,
            frame_size,
            render,
            speech,
            sequence: SequenceFilter::default(),
            events,
            publications,
        }
    }

    /// Handles one inbound datagram.
    pub fn on_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        let frame = match wire::decode(datagram) {
            Ok(Packet::Audio(frame)) => frame,
            Ok(other) => {
                debug!("FrameHandoff : ignoring {other:?} from {from}");
                return;
            }
            Err(error) => return self.mismatch(from, error),
        };
        if let Err(error) = frame.expect_len(self.frame_size) {
            return self.mismatch(from, error);
        }
        if !self.binding.accepts(&frame.sender_id) {
            debug!(
                "FrameHandoff : frame from {:?} is not for this channel",
                frame.sender_id
            );
            return;
        }
        match self.sequence.check(frame.sequence, frame.timestamp_ms) {
            SequenceCheck::Next => {}
            SequenceCheck::Restart => {
                info!(
                    "FrameHandoff : {} restarted at frame {}",
                    frame.sender_id, frame.sequence
                );
            }
            SequenceCheck::Stale => {
                debug!("FrameHandoff : dropping stale frame {}", frame.sequence);
                return;
            }
        }

        if let Some(origin) = frame.origin {
            let _ = self.events.send(SensorEvent::PeerLocation(origin));
        }
        self.render.publish(&frame.samples);

        let edge = self
            .speech
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(frame.peak(), Instant::now());
        if let Some(speaking) = edge {
            let _ = self.publications.send(Publication::Speaking(speaking));
        }
    }

    fn mismatch(&self, from: SocketAddr, error: wire::FrameError) {
        warn!("FrameHandoff : dropping datagram from {from}: {error}");
        let _ = self
            .publications
            .send(Publication::Failure(FailureNotice::DecodeMismatch { from, error }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpeechConfig;
    use crate::geo::GeoPosition3D;
    use crate::render_slot::{triple_buffer, SlotReader};
    use crate::wire::{AudioFrame, FrameError};
    use std::sync::mpsc::{channel, Receiver};

    const FROM: &str = "127.0.0.1:9000";

    struct Rig {
        handoff: FrameHandoff,
        render: SlotReader<RenderFrame>,
        events: Receiver<SensorEvent>,
        publications: Receiver<Publication>,
    }

    fn rig(remote: &str) -> Rig {
        let (writer, render) = triple_buffer(RenderFrame::default());
        let (event_tx, events) = channel();
        let (pub_tx, publications) = channel();
        let handoff = FrameHandoff::new(
            ChannelBinding::subscribe("bob", remote),
            4,
            Arc::new(RenderWriter::new(writer)),
            Arc::new(Mutex::new(SpeechDetector::new(&SpeechConfig::default()))),
            event_tx,
            pub_tx,
        );
        Rig {
            handoff,
            render,
            events,
            publications,
        }
    }

    fn datagram(sender: &str, sequence: u32, samples: Vec<f32>) -> Vec<u8> {
        stamped(sender, sequence, 0, samples)
    }

    fn stamped(sender: &str, sequence: u32, timestamp_ms: u64, samples: Vec<f32>) -> Vec<u8> {
        Packet::Audio(AudioFrame {
            sender_id: sender.to_owned(),
            channel_id: "bob".to_owned(),
            sequence,
            timestamp_ms,
            origin: Some(GeoPosition3D::new(1.0, 2.0, 3.0)),
            samples,
        })
        .encode()
        .unwrap()
    }

    #[test]
    fn accepted_frame_reaches_render_and_fusion() {
        let mut rig = rig("alice");
        rig.handoff
            .on_datagram(&datagram("alice", 1, vec![0.5; 4]), FROM.parse().unwrap());

        let frame = rig.render.read();
        assert_eq!(frame.generation, 1);
        assert_eq!(frame.samples, vec![0.5; 4]);
        assert_eq!(
            rig.events.try_recv(),
            Ok(SensorEvent::PeerLocation(GeoPosition3D::new(1.0, 2.0, 3.0)))
        );
        assert_eq!(rig.publications.try_recv(), Ok(Publication::Speaking(true)));
    }

    #[test]
    fn wrong_size_is_a_decode_mismatch() {
        let mut rig = rig("alice");
        rig.handoff
            .on_datagram(&datagram("alice", 1, vec![0.5; 3]), FROM.parse().unwrap());
        assert_eq!(rig.render.read().generation, 0);
        assert_eq!(
            rig.publications.try_recv(),
            Ok(Publication::Failure(FailureNotice::DecodeMismatch {
                from: FROM.parse().unwrap(),
                error: FrameError::UnexpectedSize {
                    expected: 4,
                    actual: 3
                },
            }))
        );
    }

    #[test]
    fn generations_survive_a_restart() {
        let (writer, mut reader) = triple_buffer(RenderFrame::default());
        let writer = RenderWriter::new(writer);
        assert_eq!(writer.publish(&[0.1]), 1);
        writer.clear();
        assert_eq!(writer.publish(&[0.2]), 3);
        assert_eq!(
            *reader.read(),
            RenderFrame {
                generation: 3,
                samples: vec![0.2]
            }
        );
    }

    #[test]
    fn garbage_is_dropped() {
        let mut rig = rig("");
        rig.handoff.on_datagram(b"\x00\x01\x02", FROM.parse().unwrap());
        assert!(!rig.render.has_update());
        assert!(matches!(
            rig.publications.try_recv(),
            Ok(Publication::Failure(FailureNotice::DecodeMismatch { .. }))
        ));
    }

    #[test]
    fn other_senders_and_stale_frames_are_ignored() {
        let mut rig = rig("alice");
        let from = FROM.parse().unwrap();
        rig.handoff.on_datagram(&datagram("mallory", 1, vec![0.5; 4]), from);
        assert!(!rig.render.has_update());

        rig.handoff.on_datagram(&datagram("alice", 5, vec![0.1; 4]), from);
        rig.handoff.on_datagram(&datagram("alice", 4, vec![0.2; 4]), from);
        let frame = rig.render.read();
        assert_eq!(frame.generation, 1);
        assert_eq!(frame.samples, vec![0.1; 4]);
    }

    #[test]
    fn restarted_sender_is_heard_again() {
        let mut rig = rig("alice");
        let from = FROM.parse().unwrap();
        let start_ms = 1_700_000_000_000;
        for seq in 0..1000 {
            let ts = start_ms + seq as u64 * 20;
            rig.handoff
                .on_datagram(&stamped("alice", seq, ts, vec![0.1; 4]), from);
        }
        assert_eq!(rig.render.read().generation, 1000);

        // alice stops, starts again a minute later and counts from zero
        let restart_ms = start_ms + 1000 * 20 + 60_000;
        for seq in 0..500 {
            let ts = restart_ms + seq as u64 * 20;
            rig.handoff
                .on_datagram(&stamped("alice", seq, ts, vec![0.2; 4]), from);
        }
        let frame = rig.render.read();
        assert_eq!(frame.generation, 1500);
        assert_eq!(frame.samples, vec![0.2; 4]);
    }

    #[test]
    fn restart_without_timestamps_is_still_heard() {
        let mut rig = rig("alice");
        let from = FROM.parse().unwrap();
        for seq in 0..1000 {
            rig.handoff.on_datagram(&datagram("alice", seq, vec![0.1; 4]), from);
        }
        for seq in 0..500 {
            rig.handoff.on_datagram(&datagram("alice", seq, vec![0.2; 4]), from);
        }
        assert_eq!(rig.render.read().generation, 1500);
    }
}
