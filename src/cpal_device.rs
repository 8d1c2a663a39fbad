//! Real audio devices through cpal.
//!
//! [CpalMicrophone] taps the default input device and [CpalSpeaker] runs a
//! [RenderUnit] from the default output device's data callback. A cpal
//! stream may not leave the thread that built it, so each one lives on a
//! dedicated thread that builds it, plays it and drops it when told to stop.

use crate::capture::{BufferCallback, CaptureError, Microphone};
use crate::config::{AudioConfig, MAX_FRAME_SAMPLES};
use crate::render::RenderUnit;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BufferSize, FromSample, Sample, SampleFormat, SampleRate, SizedSample, StreamConfig,
    SupportedBufferSize, SupportedStreamConfig,
};
use log::{info, warn};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// Things that keep an audio device from running.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The host has no default device of this direction.
    #[error("no default {0} device")]
    NoDevice(&'static str),

    /// The device would not report its preferred configuration.
    #[error("cannot query device configuration: {0}")]
    Config(#[from] cpal::DefaultStreamConfigError),

    /// The device refused the stream configuration.
    #[error("cannot open stream: {0}")]
    Build(#[from] cpal::BuildStreamError),

    /// The stream was built but would not start.
    #[error("cannot start stream: {0}")]
    Play(#[from] cpal::PlayStreamError),

    /// The device's native sample format is not one we convert.
    #[error("unsupported sample format {0}")]
    Format(SampleFormat),

    /// The stream's thread could not be spawned.
    #[error("cannot start device thread: {0}")]
    Thread(#[from] std::io::Error),

    /// The stream's thread died before reporting back.
    #[error("device thread exited before the stream started")]
    Exited,
}

/// Owns the thread a cpal stream lives on.
struct StreamThread {
    stop: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    /// Runs `build` on a new thread and starts the stream it returns. Waits
    /// until the stream plays or fails.
    fn spawn<F>(name: &str, build: F) -> Result<Self, DeviceError>
    where
        F: FnOnce() -> Result<cpal::Stream, DeviceError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), DeviceError>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new().name(name.to_owned()).spawn(move || {
            let started = build().and_then(|stream| {
                stream.play()?;
                Ok(stream)
            });
            match started {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // either a stop request or the owner going away
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop: stop_tx,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(DeviceError::Exited)
            }
        }
    }

    fn stop(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The system's default input device, mixed down to mono.
pub struct CpalMicrophone {
    config: SupportedStreamConfig,
    stream: Option<StreamThread>,
}

impl CpalMicrophone {
    /// Looks up the default input device and its preferred configuration.
    pub fn default_input() -> Result<Self, DeviceError> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or(DeviceError::NoDevice("input"))?;
        let config = device.default_input_config()?;
        info!(
            "CpalMicrophone : {} at {} Hz, {} channel(s), {}",
            device.name().unwrap_or_else(|_| "unnamed device".to_owned()),
            config.sample_rate().0,
            config.channels(),
            config.sample_format()
        );
        Ok(Self {
            config,
            stream: None,
        })
    }
}

impl Microphone for CpalMicrophone {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate().0
    }

    fn start_tap(&mut self, on_buffer: BufferCallback) -> Result<(), CaptureError> {
        if self.stream.is_some() {
            return Err(CaptureError::AlreadyStarted);
        }
        let config = self.config.clone();
        let stream = StreamThread::spawn("cpal-input", move || {
            let device = cpal::default_host()
                .default_input_device()
                .ok_or(DeviceError::NoDevice("input"))?;
            let stream_config = config.config();
            match config.sample_format() {
                SampleFormat::F32 => build_input::<f32>(&device, &stream_config, on_buffer),
                SampleFormat::I16 => build_input::<i16>(&device, &stream_config, on_buffer),
                SampleFormat::U16 => build_input::<u16>(&device, &stream_config, on_buffer),
                SampleFormat::I32 => build_input::<i32>(&device, &stream_config, on_buffer),
                other => Err(DeviceError::Format(other)),
            }
        })
        .map_err(|e| CaptureError::Device(e.to_string()))?;

        self.stream = Some(stream);
        Ok(())
    }

    fn stop_tap(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            info!("CpalMicrophone : stopped");
        }
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut on_buffer: BufferCallback,
) -> Result<cpal::Stream, DeviceError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let mut mono = Vec::with_capacity(MAX_FRAME_SAMPLES);
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            downmix(data, channels, &mut mono);
            on_buffer(&mono);
        },
        |err| warn!("CpalMicrophone : stream error: {err}"),
        None,
    )?;
    Ok(stream)
}

/// Averages interleaved frames of `channels` samples into `mono`.
fn downmix<T>(interleaved: &[T], channels: usize, mono: &mut Vec<f32>)
where
    T: Sample,
    f32: FromSample<T>,
{
    let channels = channels.max(1);
    mono.clear();
    mono.extend(interleaved.chunks_exact(channels).map(|frame| {
        frame.iter().map(|&s| s.to_sample::<f32>()).sum::<f32>() / channels as f32
    }));
}

/// Plays a [RenderUnit] through the system's default output device.
pub struct CpalSpeaker {
    stream: StreamThread,
}

impl CpalSpeaker {
    /// Opens the default output device at the session's sample rate and
    /// starts rendering `unit` from its callback. Asks for a device buffer of
    /// one render period when the device allows it.
    pub fn start(mut unit: RenderUnit, audio: &AudioConfig) -> Result<Self, DeviceError> {
        let sample_rate = audio.sample_rate;
        let period = audio.render_period as u32;

        let stream = StreamThread::spawn("cpal-output", move || {
            let device = cpal::default_host()
                .default_output_device()
                .ok_or(DeviceError::NoDevice("output"))?;
            let preferred = device.default_output_config()?;

            let buffer_size = match preferred.buffer_size() {
                SupportedBufferSize::Range { min, max } if (*min..=*max).contains(&period) => {
                    BufferSize::Fixed(period)
                }
                _ => {
                    warn!("CpalSpeaker : device cannot use {period}-sample buffers");
                    BufferSize::Default
                }
            };
            let config = StreamConfig {
                channels: preferred.channels(),
                sample_rate: SampleRate(sample_rate),
                buffer_size,
            };
            info!(
                "CpalSpeaker : {} at {sample_rate} Hz, {} channel(s), {}",
                device.name().unwrap_or_else(|_| "unnamed device".to_owned()),
                config.channels,
                preferred.sample_format()
            );

            unit.allocate_resources(MAX_FRAME_SAMPLES);
            match preferred.sample_format() {
                SampleFormat::F32 => build_output::<f32>(&device, &config, unit),
                SampleFormat::I16 => build_output::<i16>(&device, &config, unit),
                SampleFormat::U16 => build_output::<u16>(&device, &config, unit),
                SampleFormat::I32 => build_output::<i32>(&device, &config, unit),
                other => Err(DeviceError::Format(other)),
            }
        })?;

        Ok(Self { stream })
    }

    /// Stops playback and releases the device.
    pub fn stop(mut self) {
        self.stream.stop();
        info!("CpalSpeaker : stopped");
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut unit: RenderUnit,
) -> Result<cpal::Stream, DeviceError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut planar = [vec![0.0; MAX_FRAME_SAMPLES], vec![0.0; MAX_FRAME_SAMPLES]];
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            render_interleaved(&mut unit, &mut planar, data, channels);
        },
        |err| warn!("CpalSpeaker : stream error: {err}"),
        None,
    )?;
    Ok(stream)
}

/// Renders into an interleaved device buffer. Channel 0 gets the left signal
/// and channel 1 the right; a mono device gets a single-channel bus and any
/// channels past the second stay silent.
fn render_interleaved<T>(
    unit: &mut RenderUnit,
    planar: &mut [Vec<f32>; 2],
    data: &mut [T],
    channels: usize,
) where
    T: Sample + FromSample<f32>,
{
    let channels = channels.max(1);
    let block = planar[0].len().max(1);
    let [left, right] = planar;

    for chunk in data.chunks_mut(channels * block) {
        let frames = chunk.len() / channels;
        if channels == 1 {
            unit.render(&mut [&mut left[..frames]]);
        } else {
            unit.render(&mut [&mut left[..frames], &mut right[..frames]]);
        }

        for (i, frame) in chunk.chunks_exact_mut(channels).enumerate() {
            for (c, sample) in frame.iter_mut().enumerate() {
                let value = match c {
                    0 => left[i],
                    1 => right[i],
                    _ => 0.0,
                };
                *sample = T::from_sample(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::BearingDistance;
    use crate::orientation::OrientationSample;
    use crate::render::RenderFrame;
    use crate::render_slot::{triple_buffer, SlotWriter};
    use crate::spatial::{SpatialEffectApplier, SpatialParams};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn unit() -> (RenderUnit, SlotWriter<RenderFrame>, SlotWriter<SpatialParams>) {
        let (audio, audio_reader) = triple_buffer(RenderFrame::default());
        let (spatial, spatial_reader) = triple_buffer(SpatialParams::default());
        let mut unit = RenderUnit::new(
            audio_reader,
            spatial_reader,
            Arc::new(AtomicBool::new(true)),
            SpatialEffectApplier::default(),
        );
        unit.allocate_resources(16);
        (unit, audio, spatial)
    }

    #[test]
    fn stereo_input_is_averaged() {
        let mut mono = Vec::new();
        downmix(&[0.5_f32, -0.5, 1.0, 0.0, 0.25, 0.25], 2, &mut mono);
        assert_eq!(mono, vec![0.0, 0.5, 0.25]);

        // a trailing partial frame is ignored
        downmix(&[0.2_f32, 0.4, 0.6], 2, &mut mono);
        assert_eq!(mono.len(), 1);
        assert!((mono[0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn integer_input_is_scaled() {
        let mut mono = Vec::new();
        downmix(&[i16::MIN, 0], 1, &mut mono);
        assert_eq!(mono, vec![-1.0, 0.0]);
    }

    #[test]
    fn output_is_interleaved_left_right() {
        let (mut unit, mut audio, mut spatial) = unit();
        audio.write(RenderFrame {
            generation: 1,
            samples: vec![0.5; 4],
        });
        // peer due east, hard right
        let params = SpatialParams {
            orientation: OrientationSample::default(),
            target: Some(BearingDistance {
                bearing_degrees: 90.0,
                distance_meters: 1.0,
            }),
        };
        spatial.write(params);
        let right = 0.5 * SpatialEffectApplier::default().cue_for(&params).right_gain;

        let mut planar = [vec![0.0; 16], vec![0.0; 16]];
        let mut data = vec![1.0_f32; 4 * 3];
        render_interleaved(&mut unit, &mut planar, &mut data, 3);

        for frame in data.chunks_exact(3) {
            assert!(frame[0].abs() < 1e-6, "{frame:?}");
            assert!((frame[1] - right).abs() < 1e-6, "{frame:?}");
            assert_eq!(frame[2], 0.0);
        }
    }

    #[test]
    fn device_buffers_larger_than_scratch_are_rendered_in_blocks() {
        let (mut unit, mut audio, _spatial) = unit();
        audio.write(RenderFrame {
            generation: 1,
            samples: (1..=6).map(|i| i as f32 / 10.0).collect(),
        });

        let mut planar = [vec![0.0; 4], vec![0.0; 4]];
        let mut data = vec![9.0_f32; 8];
        render_interleaved(&mut unit, &mut planar, &mut data, 1);

        let expected: Vec<f32> = (1..=6).map(|i| i as f32 / 10.0).chain([0.0, 0.0]).collect();
        assert_eq!(data, expected);
    }

    #[test]
    fn failed_build_is_reported_and_joined() {
        let result = StreamThread::spawn("cpal-test", || Err(DeviceError::NoDevice("output")));
        assert!(matches!(result, Err(DeviceError::NoDevice("output"))));
    }
}
