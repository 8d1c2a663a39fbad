//! A microphone that plays back a WAV file in real time.

use crate::capture::{BufferCallback, CaptureError, Microphone};
use crate::dummy_microphone::PacedSource;

use hound::{SampleFormat, WavReader};
use log::info;
use std::path::Path;

/// Reads a whole WAV file up front and feeds it to the tap at its own
/// sample rate. Multi-channel files are mixed down to mono.
pub struct WavMicrophone {
    samples: Vec<f32>,
    sample_rate: u32,
    buffer_size: usize,
    looping: bool,
    source: Option<PacedSource>,
}

impl WavMicrophone {
    /// Loads `path`. Integer formats are scaled into `[-1, 1]`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let mut reader = WavReader::open(path.as_ref())?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
            SampleFormat::Int => {
                let scale = (1_i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|s| s as f32 / scale))
                    .collect::<Result<_, _>>()?
            }
        };
        let samples = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect::<Vec<_>>();

        info!(
            "WavMicrophone : loaded {} samples at {} Hz from {}",
            samples.len(),
            spec.sample_rate,
            path.as_ref().display()
        );

        Ok(Self {
            samples,
            sample_rate: spec.sample_rate,
            buffer_size: 256,
            looping: false,
            source: None,
        })
    }

    /// Starts over at the beginning instead of going quiet at the end.
    pub fn looping(self, looping: bool) -> Self {
        Self { looping, ..self }
    }

    /// Samples per device buffer.
    pub fn buffer_size(self, buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            ..self
        }
    }

    /// Length of the loaded recording in samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True for a recording with no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Microphone for WavMicrophone {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start_tap(&mut self, on_buffer: BufferCallback) -> Result<(), CaptureError> {
        if self.source.is_some() {
            return Err(CaptureError::AlreadyStarted);
        }
        if self.samples.is_empty() {
            return Err(CaptureError::Device("recording is empty".to_owned()));
        }

        let samples = self.samples.clone();
        let looping = self.looping;
        let mut position = 0;
        self.source = Some(PacedSource::spawn(
            "WavMicrophone",
            self.buffer_size,
            self.sample_rate,
            move |buffer| {
                if position >= samples.len() {
                    if !looping {
                        return false;
                    }
                    position = 0;
                }
                for slot in buffer.iter_mut() {
                    *slot = match samples.get(position) {
                        Some(&sample) => sample,
                        None if looping => {
                            position = 0;
                            samples[0]
                        }
                        None => 0.0,
                    };
                    position += 1;
                }
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

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};
    use std::sync::mpsc::channel;
    use std::time::Duration;

    fn write_wav(spec: WavSpec, samples: &[i32]) -> tempfile::NamedTempFile {
        let file = tempfile::Builder::new().suffix(".wav").tempfile().unwrap();
        let mut writer = WavWriter::create(file.path(), spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        file
    }

    #[test]
    fn stereo_int_file_is_mixed_to_mono() {
        let spec = WavSpec {
            channels: 2,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let file = write_wav(spec, &[16_384, 0, -32_768, -32_768]);
        let microphone = WavMicrophone::open(file.path()).unwrap();
        assert_eq!(microphone.sample_rate(), 8_000);
        assert_eq!(microphone.samples, vec![0.25, -1.0]);
    }

    #[test]
    fn plays_once_then_goes_quiet() {
        let spec = WavSpec {
            channels: 1,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let file = write_wav(spec, &vec![8_192; 1_000]);
        let mut microphone = WavMicrophone::open(file.path()).unwrap().buffer_size(480);
        assert_eq!(microphone.len(), 1_000);

        let (tx, rx) = channel();
        microphone
            .start_tap(Box::new(move |buffer: &[f32]| {
                let _ = tx.send(buffer.to_vec());
            }))
            .unwrap();

        let wait = Duration::from_secs(2);
        let buffers: Vec<Vec<f32>> = (0..3).map(|_| rx.recv_timeout(wait).unwrap()).collect();
        assert!(buffers[0].iter().all(|&s| s == 0.25));
        // the last buffer is padded with silence
        assert_eq!(buffers[2][39], 0.25);
        assert_eq!(buffers[2][40], 0.0);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        microphone.stop_tap();
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(matches!(
            WavMicrophone::open("/definitely/not/here.wav"),
            Err(CaptureError::Wav(_))
        ));
    }
}
