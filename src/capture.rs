//! Microphone capture.
//!
//! Capture is two-step. First the [PermissionGate] is asked, and it answers
//! whenever it likes on whatever thread it likes. Only on a grant does the
//! [Microphone] tap start; its buffers come in whatever sizes the device
//! prefers, and a [FrameChunker] cuts them into the fixed-size frames the
//! wire carries.

use crossbeam::atomic::AtomicCell;
use log::{info, warn};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Things that end a capture attempt.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The permission gate said no.
    #[error("microphone permission denied")]
    PermissionDenied,

    /// Stop the running capture first.
    #[error("capture is already running")]
    AlreadyStarted,

    /// The device does not run at the session's rate.
    #[error("microphone runs at {actual} Hz, expected {expected} Hz")]
    SampleRate {
        /// The session's rate.
        expected: u32,
        /// The device's rate.
        actual: u32,
    },

    /// A WAV source could not be read.
    #[error("cannot read audio file: {0}")]
    Wav(#[from] hound::Error),

    /// The audio device reported an error.
    #[error("microphone failed: {0}")]
    Device(String),
}

/// Receives one device buffer at a time, on the device's thread.
pub type BufferCallback = Box<dyn FnMut(&[f32]) + Send>;

/// Receives one fixed-size frame at a time.
pub type FrameCallback = Box<dyn FnMut(Vec<f32>) + Send>;

/// Receives the terminal failure of a capture attempt, at most once.
pub type ErrorCallback = Box<dyn FnOnce(CaptureError) + Send>;

/// Asks the user (or a policy) whether the microphone may be used.
pub trait PermissionGate: Send + Sync {
    /// Calls `reply` exactly once with the answer. May reply before
    /// returning or later from another thread.
    fn request(&self, reply: Box<dyn FnOnce(bool) + Send>);
}

/// A source of mono samples.
pub trait Microphone: Send {
    /// Samples per second delivered to the tap.
    fn sample_rate(&self) -> u32;

    /// Starts delivering buffers to `on_buffer`.
    fn start_tap(&mut self, on_buffer: BufferCallback) -> Result<(), CaptureError>;

    /// Stops delivering buffers. Returns once no further callback will run.
    fn stop_tap(&mut self);
}

/// Lifecycle of an [AudioCaptureStream].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Not started.
    Idle,
    /// Waiting for the permission gate to reply.
    AwaitingPermission,
    /// Frames are flowing.
    Running,
    /// Permission was refused.
    Denied,
    /// The microphone would not start.
    Failed,
    /// Stopped by the owner.
    Stopped,
}

/// Collects device buffers of any size into frames of exactly `frame_size`
/// samples.
#[derive(Debug, Clone)]
pub struct FrameChunker {
    frame_size: usize,
    pending: Vec<f32>,
}

impl FrameChunker {
    /// A chunker producing frames of `frame_size` samples (at least one).
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size),
        }
    }

    /// Appends `samples`, calling `emit` for every frame completed.
    pub fn push<F>(&mut self, mut samples: &[f32], mut emit: F)
    where
        F: FnMut(Vec<f32>),
    {
        while !samples.is_empty() {
            let take = (self.frame_size - self.pending.len()).min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.pending.len() == self.frame_size {
                let next = Vec::with_capacity(self.frame_size);
                emit(mem::replace(&mut self.pending, next));
            }
        }
    }

    /// Samples waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

struct CaptureShared {
    state: AtomicCell<CaptureState>,
    // Bumped on every start and stop so a late permission answer for an
    // abandoned attempt is ignored.
    attempt: AtomicU64,
    microphone: Mutex<Box<dyn Microphone>>,
    frame_size: usize,
    sample_rate: u32,
}

/// Requests permission, taps the microphone and hands out fixed-size frames.
pub struct AudioCaptureStream {
    shared: Arc<CaptureShared>,
}

impl AudioCaptureStream {
    /// Wraps `microphone`, expecting `sample_rate` Hz and producing frames of
    /// `frame_size` samples.
    pub fn new(microphone: Box<dyn Microphone>, frame_size: usize, sample_rate: u32) -> Self {
        Self {
            shared: Arc::new(CaptureShared {
                state: AtomicCell::new(CaptureState::Idle),
                attempt: AtomicU64::new(0),
                microphone: Mutex::new(microphone),
                frame_size,
                sample_rate,
            }),
        }
    }

    /// Asks `gate` for permission and, once granted, starts delivering frames
    /// to `on_frame`. Returns immediately. A denial or a device failure is
    /// reported once through `on_error` and ends this attempt.
    pub fn start(
        &self,
        gate: &dyn PermissionGate,
        on_frame: FrameCallback,
        on_error: ErrorCallback,
    ) -> Result<(), CaptureError> {
        let attempt = {
            let _microphone = self.shared.lock_microphone();
            if matches!(
                self.shared.state.load(),
                CaptureState::AwaitingPermission | CaptureState::Running
            ) {
                return Err(CaptureError::AlreadyStarted);
            }
            self.shared.state.store(CaptureState::AwaitingPermission);
            self.shared.attempt.fetch_add(1, Ordering::AcqRel) + 1
        };

        info!("{self} : requesting microphone permission");
        let shared = self.shared.clone();
        gate.request(Box::new(move |granted| {
            shared.on_permission(attempt, granted, on_frame, on_error)
        }));
        Ok(())
    }

    /// Stops the tap, or abandons a pending permission request. Safe to call
    /// at any time.
    pub fn stop(&self) {
        let mut microphone = self.shared.lock_microphone();
        self.shared.attempt.fetch_add(1, Ordering::AcqRel);
        let previous = self.shared.state.swap(CaptureState::Stopped);
        if previous == CaptureState::Running {
            microphone.stop_tap();
            info!("{self} : stopped");
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CaptureState {
        self.shared.state.load()
    }
}

impl CaptureShared {
    fn lock_microphone(&self) -> MutexGuard<'_, Box<dyn Microphone>> {
        self.microphone
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn on_permission(
        &self,
        attempt: u64,
        granted: bool,
        mut on_frame: FrameCallback,
        on_error: ErrorCallback,
    ) {
        let mut microphone = self.lock_microphone();
        if self.attempt.load(Ordering::Acquire) != attempt
            || self.state.load() != CaptureState::AwaitingPermission
        {
            info!("AudioCaptureStream : ignoring permission answer for an abandoned attempt");
            return;
        }

        if !granted {
            warn!("AudioCaptureStream : microphone permission denied");
            self.state.store(CaptureState::Denied);
            on_error(CaptureError::PermissionDenied);
            return;
        }

        let actual = microphone.sample_rate();
        if actual != self.sample_rate {
            self.state.store(CaptureState::Failed);
            on_error(CaptureError::SampleRate {
                expected: self.sample_rate,
                actual,
            });
            return;
        }

        let mut chunker = FrameChunker::new(self.frame_size);
        let tap = Box::new(move |buffer: &[f32]| chunker.push(buffer, &mut on_frame));
        match microphone.start_tap(tap) {
            Ok(()) => {
                info!("AudioCaptureStream : capturing at {actual} Hz");
                self.state.store(CaptureState::Running);
            }
            Err(e) => {
                warn!("AudioCaptureStream : cannot start microphone: {e}");
                self.state.store(CaptureState::Failed);
                on_error(e);
            }
        }
    }
}

impl fmt::Display for AudioCaptureStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AudioCaptureStream")
    }
}

impl Drop for AudioCaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{channel, Sender};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    /// Records the tap so the test can push buffers through it by hand.
    struct ManualMicrophone {
        rate: u32,
        tap: Arc<Mutex<Option<BufferCallback>>>,
    }

    impl Microphone for ManualMicrophone {
        fn sample_rate(&self) -> u32 {
            self.rate
        }

        fn start_tap(&mut self, on_buffer: BufferCallback) -> Result<(), CaptureError> {
            *self.tap.lock().unwrap() = Some(on_buffer);
            Ok(())
        }

        fn stop_tap(&mut self) {
            *self.tap.lock().unwrap() = None;
        }
    }

    struct Answer(bool);

    impl PermissionGate for Answer {
        fn request(&self, reply: Box<dyn FnOnce(bool) + Send>) {
            reply(self.0)
        }
    }

    /// Holds on to the reply so the test decides when to answer.
    #[derive(Default)]
    struct Deferred(Mutex<Option<Box<dyn FnOnce(bool) + Send>>>);

    impl PermissionGate for Deferred {
        fn request(&self, reply: Box<dyn FnOnce(bool) + Send>) {
            *self.0.lock().unwrap() = Some(reply);
        }
    }

    impl Deferred {
        fn answer(&self, granted: bool) {
            let reply = self.0.lock().unwrap().take().unwrap();
            reply(granted);
        }
    }

    fn stream(rate: u32) -> (AudioCaptureStream, Arc<Mutex<Option<BufferCallback>>>) {
        let tap = Arc::new(Mutex::new(None));
        let microphone = ManualMicrophone {
            rate,
            tap: tap.clone(),
        };
        (AudioCaptureStream::new(Box::new(microphone), 4, 48_000), tap)
    }

    fn callbacks() -> (
        FrameCallback,
        ErrorCallback,
        std::sync::mpsc::Receiver<Vec<f32>>,
        std::sync::mpsc::Receiver<CaptureError>,
    ) {
        let (frame_tx, frame_rx): (Sender<Vec<f32>>, _) = channel();
        let (error_tx, error_rx) = channel();
        (
            Box::new(move |frame| {
                let _ = frame_tx.send(frame);
            }),
            Box::new(move |error| {
                let _ = error_tx.send(error);
            }),
            frame_rx,
            error_rx,
        )
    }

    #[test]
    fn chunker_produces_exact_frames() {
        let mut chunker = FrameChunker::new(4);
        let mut frames = Vec::new();
        chunker.push(&[1.0, 2.0, 3.0], |f| frames.push(f));
        assert!(frames.is_empty());
        assert_eq!(chunker.pending(), 3);

        chunker.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0], |f| frames.push(f));
        assert_eq!(
            frames,
            vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]]
        );
        assert_eq!(chunker.pending(), 2);
    }

    #[test]
    fn granted_capture_delivers_frames() {
        let (stream, tap) = stream(48_000);
        let (on_frame, on_error, frames, errors) = callbacks();

        stream.start(&Answer(true), on_frame, on_error).unwrap();
        assert_eq!(stream.state(), CaptureState::Running);

        (tap.lock().unwrap().as_mut().unwrap())(&[0.5_f32; 6][..]);
        assert_eq!(frames.recv_timeout(WAIT).unwrap(), vec![0.5; 4]);
        assert!(frames.try_recv().is_err());
        assert!(errors.try_recv().is_err());

        stream.stop();
        assert_eq!(stream.state(), CaptureState::Stopped);
        assert!(tap.lock().unwrap().is_none());
    }

    #[test]
    fn denial_is_reported_once() {
        let (stream, tap) = stream(48_000);
        let (on_frame, on_error, _frames, errors) = callbacks();

        stream.start(&Answer(false), on_frame, on_error).unwrap();
        assert_eq!(stream.state(), CaptureState::Denied);
        assert!(matches!(
            errors.recv_timeout(WAIT),
            Ok(CaptureError::PermissionDenied)
        ));
        assert!(errors.try_recv().is_err());
        assert!(tap.lock().unwrap().is_none());
    }

    #[test]
    fn stop_while_awaiting_permission() {
        let (stream, tap) = stream(48_000);
        let (on_frame, on_error, _frames, errors) = callbacks();
        let gate = Deferred::default();

        stream.start(&gate, on_frame, on_error).unwrap();
        assert_eq!(stream.state(), CaptureState::AwaitingPermission);
        stream.stop();

        gate.answer(true);
        assert_eq!(stream.state(), CaptureState::Stopped);
        assert!(tap.lock().unwrap().is_none());
        assert!(errors.try_recv().is_err());
    }

    #[test]
    fn second_start_is_refused() {
        let (stream, _tap) = stream(48_000);
        let (on_frame, on_error, _, _) = callbacks();
        stream.start(&Answer(true), on_frame, on_error).unwrap();

        let (on_frame, on_error, _, _) = callbacks();
        assert!(matches!(
            stream.start(&Answer(true), on_frame, on_error),
            Err(CaptureError::AlreadyStarted)
        ));
    }

    #[test]
    fn wrong_sample_rate_fails_the_attempt() {
        let (stream, _tap) = stream(44_100);
        let (on_frame, on_error, _, errors) = callbacks();
        stream.start(&Answer(true), on_frame, on_error).unwrap();
        assert_eq!(stream.state(), CaptureState::Failed);
        assert!(matches!(
            errors.recv_timeout(WAIT),
            Ok(CaptureError::SampleRate {
                expected: 48_000,
                actual: 44_100
            })
        ));
    }
}
