//! A wrapper for the hound library that writes the rendered stereo output
//! to a WAV file.

use crate::component::{Component, ComponentError};
use crate::render_clock::StereoBlock;

use hound::{SampleFormat, WavSpec, WavWriter};
use log::info;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failures while writing the output file.
#[derive(Debug, Error)]
pub enum WavError {
    /// hound could not write.
    #[error("wav error: {0}")]
    Hound(#[from] hound::Error),

    /// Blocks arrived after the file was closed.
    #[error("writer already finalized")]
    Finalized,
}

/// Spec of the files HoundWriter produces: stereo 32-bit float.
pub fn stereo_spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    }
}

/// A Component that appends every rendered block to a WAV file. Each
/// conversion reports how many stereo frames were written.
pub struct HoundWriter {
    path: PathBuf,
    writer: Option<WavWriter<BufWriter<File>>>,
}

impl HoundWriter {
    /// Creates (or truncates) the file at `path`.
    pub fn create(path: impl AsRef<Path>, sample_rate: u32) -> Result<Self, WavError> {
        let writer = WavWriter::create(path.as_ref(), stereo_spec(sample_rate))?;
        info!("HoundWriter : writing to {}", path.as_ref().display());
        Ok(Self {
            path: path.as_ref().to_owned(),
            writer: Some(writer),
        })
    }

    fn append(&mut self, (left, right): StereoBlock) -> Result<usize, WavError> {
        let writer = self.writer.as_mut().ok_or(WavError::Finalized)?;

        // interleave the two streams
        let mut frames = 0;
        for (l, r) in std::iter::zip(left, right) {
            writer.write_sample(l)?;
            writer.write_sample(r)?;
            frames += 1;
        }

        // flush after each block so the header stays valid if we are killed
        writer.flush()?;
        Ok(frames)
    }
}

impl Component for HoundWriter {
    type InData = StereoBlock;
    type OutData = Result<usize, WavError>;

    fn convert(&mut self, input: StereoBlock) -> Vec<Result<usize, WavError>> {
        vec![self.append(input)]
    }

    /// Finishes the file. This happens when the WavWriter is dropped too,
    /// but calling this gives us controlled error checking.
    fn finalize(&mut self) -> Result<(), ComponentError> {
        let writer = self.writer.take().ok_or(WavError::Finalized)?;
        writer.finalize().map_err(WavError::from)?;
        info!("HoundWriter : finished {}", self.path.display());
        Ok(())
    }
}

impl ToString for HoundWriter {
    fn to_string(&self) -> String {
        "HoundWriter".to_string()
    }
}
