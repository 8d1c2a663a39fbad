//! Stand-in audio devices for running without hardware.
//!
//! [ToneMicrophone] talks in bursts of a sine tone over a faint noise floor,
//! which is enough to exercise the speaking indicator on the far side.
//! [AutoPermission] answers permission requests by itself after a delay.

use crate::capture::{BufferCallback, CaptureError, Microphone, PermissionGate};

use log::{debug, info};
use rand::prelude::*;
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A permission gate with a fixed answer.
#[derive(Debug, Clone)]
pub struct AutoPermission {
    granted: bool,
    delay: Duration,
}

impl AutoPermission {
    /// Always says yes.
    pub fn grant() -> Self {
        Self {
            granted: true,
            delay: Duration::ZERO,
        }
    }

    /// Always says no.
    pub fn deny() -> Self {
        Self {
            granted: false,
            delay: Duration::ZERO,
        }
    }

    /// Answers only after `delay`, like a user reading the prompt.
    pub fn after(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }
}

impl PermissionGate for AutoPermission {
    fn request(&self, reply: Box<dyn FnOnce(bool) + Send>) {
        let AutoPermission { granted, delay } = self.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            info!("AutoPermission : answering {granted}");
            reply(granted);
        });
    }
}

/// Runs `fill` on its own thread once per buffer period and hands every
/// filled buffer to the tap, paced against the wall clock.
pub(crate) struct PacedSource {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PacedSource {
    /// Starts pacing. `fill` returns false once the source is exhausted.
    pub(crate) fn spawn<F>(
        name: &str,
        buffer_size: usize,
        sample_rate: u32,
        mut fill: F,
        mut on_buffer: BufferCallback,
    ) -> Result<Self, CaptureError>
    where
        F: FnMut(&mut [f32]) -> bool + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let period = Duration::from_nanos(
            buffer_size as u64 * 1_000_000_000 / sample_rate.max(1) as u64,
        );
        let th_running = running.clone();
        let th_name = name.to_owned();

        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let mut buffer = vec![0.0; buffer_size.max(1)];
                let mut next = Instant::now();
                while th_running.load(Ordering::Acquire) {
                    if !fill(&mut buffer) {
                        debug!("{th_name} : source exhausted");
                        break;
                    }
                    on_buffer(&buffer);

                    next += period;
                    let now = Instant::now();
                    if next > now {
                        spin_sleep::sleep(next - now);
                    } else {
                        // fell behind; don't try to catch up with a burst
                        next = now;
                    }
                }
            })
            .map_err(|e| CaptureError::Device(e.to_string()))?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PacedSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A microphone that produces a tone in talk bursts.
pub struct ToneMicrophone {
    sample_rate: u32,
    buffer_size: usize,
    frequency: f32,
    amplitude: f32,
    talk: Duration,
    pause: Duration,
    source: Option<PacedSource>,
}

impl ToneMicrophone {
    /// A 440 Hz tone at `sample_rate`, one second on and one second off.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            buffer_size: 256,
            frequency: 440.0,
            amplitude: 0.3,
            talk: Duration::from_secs(1),
            pause: Duration::from_secs(1),
            source: None,
        }
    }

    /// Tone pitch in Hz.
    pub fn frequency(self, frequency: f32) -> Self {
        Self { frequency, ..self }
    }

    /// Peak level, clamped to `[0, 1]`.
    pub fn amplitude(self, amplitude: f32) -> Self {
        Self {
            amplitude: amplitude.clamp(0.0, 1.0),
            ..self
        }
    }

    /// Alternates `talk` of tone with `pause` of near silence. A zero pause
    /// talks continuously.
    pub fn bursts(self, talk: Duration, pause: Duration) -> Self {
        Self {
            talk,
            pause,
            ..self
        }
    }

    /// Samples per device buffer.
    pub fn buffer_size(self, buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            ..self
        }
    }
}

impl Microphone for ToneMicrophone {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start_tap(&mut self, on_buffer: BufferCallback) -> Result<(), CaptureError> {
        if self.source.is_some() {
            return Err(CaptureError::AlreadyStarted);
        }

        let mut voice = BurstVoice {
            step: TAU * self.frequency / self.sample_rate as f32,
            phase: 0.0,
            amplitude: self.amplitude,
            talk_samples: duration_to_samples(self.talk, self.sample_rate),
            cycle_samples: duration_to_samples(self.talk + self.pause, self.sample_rate),
            position: 0,
            rng: StdRng::from_entropy(),
        };
        self.source = Some(PacedSource::spawn(
            "ToneMicrophone",
            self.buffer_size,
            self.sample_rate,
            move |buffer| {
                voice.fill(buffer);
                true
            },
            on_buffer,
        )?);
        Ok(())
    }

    fn stop_tap(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.stop();
        }
    }
}

const NOISE_FLOOR: f32 = 0.001;

struct BurstVoice {
    step: f32,
    phase: f32,
    amplitude: f32,
    talk_samples: u64,
    cycle_samples: u64,
    position: u64,
    rng: StdRng,
}

impl BurstVoice {
    fn fill(&mut self, buffer: &mut [f32]) {
        for sample in buffer.iter_mut() {
            let talking = self.cycle_samples <= self.talk_samples
                || self.position % self.cycle_samples < self.talk_samples;
            let noise = self.rng.gen_range(-NOISE_FLOOR..NOISE_FLOOR);
            *sample = if talking {
                self.phase.sin() * self.amplitude + noise
            } else {
                noise
            };
            self.phase = (self.phase + self.step) % TAU;
            self.position += 1;
        }
    }
}

fn duration_to_samples(duration: Duration, sample_rate: u32) -> u64 {
    (duration.as_micros() * sample_rate as u128 / 1_000_000) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn auto_permission_answers() {
        let (tx, rx) = channel();
        AutoPermission::grant()
            .after(Duration::from_millis(10))
            .request(Box::new(move |granted| tx.send(granted).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(true));

        let (tx, rx) = channel();
        AutoPermission::deny().request(Box::new(move |granted| tx.send(granted).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(false));
    }

    #[test]
    fn voice_alternates_between_tone_and_silence() {
        let mut voice = BurstVoice {
            step: TAU * 1000.0 / 48_000.0,
            phase: 0.0,
            amplitude: 0.5,
            talk_samples: 480,
            cycle_samples: 960,
            position: 0,
            rng: StdRng::seed_from_u64(7),
        };
        let mut buffer = vec![0.0; 960];
        voice.fill(&mut buffer);

        let peak = |s: &[f32]| s.iter().fold(0.0_f32, |p, x| p.max(x.abs()));
        assert!(peak(&buffer[..480]) > 0.4);
        assert!(peak(&buffer[480..]) <= NOISE_FLOOR);
    }

    #[test]
    fn tone_microphone_delivers_paced_buffers() {
        let mut microphone = ToneMicrophone::new(48_000)
            .buffer_size(480)
            .bursts(Duration::from_secs(1), Duration::ZERO);
        let (tx, rx) = channel();
        microphone
            .start_tap(Box::new(move |buffer: &[f32]| {
                let _ = tx.send(buffer.len());
            }))
            .unwrap();
        assert!(matches!(
            microphone.start_tap(Box::new(|_: &[f32]| {})),
            Err(CaptureError::AlreadyStarted)
        ));

        let started = Instant::now();
        for _ in 0..5 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(480));
        }
        // five 10 ms buffers, the first one immediately
        assert!(started.elapsed() >= Duration::from_millis(35));

        microphone.stop_tap();
        while rx.try_recv().is_ok() {}
        thread::sleep(Duration::from_millis(30));
        assert!(rx.try_recv().is_err());
    }
}
