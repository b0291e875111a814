//! RIFF/WAVE output via `hound`. The container carries whatever the capture
//! settings say; no resampling or format conversion happens here.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::pcm::{Pcm, SampleWidth};

/// Spec for the output container, taken straight from the capture settings.
pub fn spec_for(channels: u16, sample_rate: u32, width: SampleWidth) -> hound::WavSpec {
    hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: width.bits(),
        sample_format: hound::SampleFormat::Int,
    }
}

/// Incremental WAV writer that finalizes the RIFF header on `finalize`.
pub struct WavSink {
    writer: hound::WavWriter<BufWriter<File>>,
    path: PathBuf,
}

impl WavSink {
    pub fn create(path: &Path, spec: hound::WavSpec) -> Result<Self> {
        let writer = hound::WavWriter::create(path, spec)
            .with_context(|| format!("failed to create WAV file '{}'", path.display()))?;
        Ok(Self {
            writer,
            path: path.to_path_buf(),
        })
    }

    pub fn write(&mut self, payload: &Pcm) -> Result<()> {
        match payload {
            Pcm::Sixteen(samples) => {
                for &sample in samples {
                    self.writer
                        .write_sample(sample)
                        .with_context(|| self.write_error())?;
                }
            }
            Pcm::Eight(samples) => {
                for &sample in samples {
                    self.writer
                        .write_sample(sample)
                        .with_context(|| self.write_error())?;
                }
            }
        }
        Ok(())
    }

    pub fn finalize(self) -> Result<()> {
        let path = self.path;
        self.writer
            .finalize()
            .with_context(|| format!("failed to finalize WAV file '{}'", path.display()))
    }

    fn write_error(&self) -> String {
        format!("failed to write samples to '{}'", self.path.display())
    }
}

/// Create, fill, and finalize in one step; this is the whole happy path for
/// a capture session.
pub fn write_wav(path: &Path, spec: hound::WavSpec, payload: &Pcm) -> Result<()> {
    let mut sink = WavSink::create(path, spec)?;
    sink.write(payload)?;
    sink.finalize()
}
