//! One capture session end to end: build the source and gate from the CLI
//! config, run the bounded capture, and land the payload in a WAV container.

use std::{
    env, fs,
    io::Write,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::capture::{self, CaptureMetrics};
use crate::config::{AppConfig, SourceKind};
use crate::transport::{ByteSource, SerialSource, UdpSource};
use crate::wav;

/// Path to the temp log file we rotate between runs.
pub fn log_file_path() -> PathBuf {
    env::temp_dir().join("wavetap.log")
}

/// Write debug messages to a temp file so diagnostics never mix with the
/// capture summary on stdout.
pub fn log_debug(msg: &str) {
    use std::fs::OpenOptions;

    let log_path = log_file_path();
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(log_path) {
        let _ = writeln!(file, "[{timestamp}] {msg}");
    }
}

/// Remove the log file if it grows past 5 MB between runs.
pub fn init_debug_log_file() {
    let log_path = log_file_path();
    if let Ok(metadata) = fs::metadata(&log_path) {
        const MAX_BYTES: u64 = 5 * 1024 * 1024;
        if metadata.len() > MAX_BYTES {
            let _ = fs::remove_file(&log_path);
        }
    }
}

/// Everything one run produced, printable as text or JSON.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub source: String,
    pub output: PathBuf,
    pub raw_output: Option<PathBuf>,
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_width_bytes: u16,
    pub dc_offset: String,
    pub gate: String,
    pub requested_seconds: f64,
    pub written_seconds: f64,
    pub samples_written: usize,
    pub trailing_bytes_dropped: usize,
    pub metrics: CaptureMetrics,
}

impl SessionSummary {
    pub fn render(&self) -> String {
        let mut lines = vec![format!("Capture complete: {}", self.output.display())];
        lines.push(format!("  source: {}", self.source));
        lines.push(format!(
            "  format: {} Hz, {} channel(s), {}-bit, dc_offset={}, gate={}",
            self.sample_rate,
            self.channels,
            self.sample_width_bytes * 8,
            self.dc_offset,
            self.gate
        ));
        lines.push(format!(
            "  audio:  {:.2}s of {:.0}s requested ({} samples)",
            self.written_seconds, self.requested_seconds, self.samples_written
        ));
        lines.push(format!(
            "  chunks: {} received, {} accepted, {} rejected, {} dropped",
            self.metrics.chunks_received,
            self.metrics.chunks_accepted,
            self.metrics.chunks_rejected,
            self.metrics.chunks_dropped
        ));
        lines.push(format!("  stop:   {}", self.metrics.stop_reason.label()));
        if let Some(raw) = &self.raw_output {
            lines.push(format!("  raw:    {}", raw.display()));
        }
        if self.trailing_bytes_dropped > 0 {
            lines.push(format!(
                "  note:   {} trailing byte(s) did not fill a sample and were dropped",
                self.trailing_bytes_dropped
            ));
        }
        lines.join("\n")
    }

    /// A run that came back noticeably shorter than requested deserves a
    /// visible warning rather than a silent short file.
    pub fn shortfall_warning(&self) -> Option<String> {
        let shortfall = self.requested_seconds - self.written_seconds;
        if shortfall > 0.25 {
            Some(format!(
                "captured only {:.2}s of {:.0}s requested (stopped: {})",
                self.written_seconds,
                self.requested_seconds,
                self.metrics.stop_reason.label()
            ))
        } else {
            None
        }
    }
}

/// Open the transport named by the CLI.
pub fn build_source(config: &AppConfig) -> Result<Box<dyn ByteSource>> {
    match config.source {
        SourceKind::Udp => Ok(Box::new(UdpSource::bind(
            config.listen_ip,
            config.listen_port,
        )?)),
        SourceKind::Serial => {
            let path = config
                .serial_port
                .as_deref()
                .ok_or_else(|| anyhow!("--serial-port is required with --source serial"))?;
            Ok(Box::new(SerialSource::open(path, config.baud)?))
        }
    }
}

/// Run one capture and write the outputs.
pub fn run_session(config: &AppConfig) -> Result<SessionSummary> {
    let decoder = config.decoder()?;
    let capture_cfg = config.capture_config();
    let mut gate = config.build_gate();
    let source = build_source(config)?;
    let source_name = source.describe();

    log_debug(&format!("capture starting on {source_name}"));
    log_debug(&format!(
        "format: {} Hz, {} ch, {} byte(s)/sample, dc_offset={}, gate={}",
        config.sample_rate, config.channels, config.sample_width, config.dc_offset, config.gate
    ));

    let result = capture::run_capture(source, gate.as_deref_mut(), &decoder, &capture_cfg)?;
    log_debug(&format!(
        "capture stopped: {} ({} bytes in {} ms)",
        result.metrics.stop_reason.label(),
        result.metrics.bytes_captured,
        result.metrics.capture_ms
    ));

    if let Some(raw_path) = &config.raw_out {
        fs::write(raw_path, &result.bytes)
            .with_context(|| format!("failed to write raw dump '{}'", raw_path.display()))?;
    }

    let (payload, trailing_bytes_dropped) = decoder.finalize(&result.bytes);
    let spec = wav::spec_for(config.channels, config.sample_rate, decoder.width());
    wav::write_wav(&config.output, spec, &payload)?;
    log_debug(&format!(
        "wrote {} samples to '{}'",
        payload.len(),
        config.output.display()
    ));

    let samples_written = payload.len();
    let frames = samples_written / usize::from(config.channels.max(1));
    let written_seconds = frames as f64 / f64::from(config.sample_rate);

    Ok(SessionSummary {
        source: source_name,
        output: config.output.clone(),
        raw_output: config.raw_out.clone(),
        sample_rate: config.sample_rate,
        channels: config.channels,
        sample_width_bytes: config.sample_width,
        dc_offset: config.dc_offset.to_string(),
        gate: config.gate.to_string(),
        requested_seconds: config.seconds as f64,
        written_seconds,
        samples_written,
        trailing_bytes_dropped,
        metrics: result.metrics,
    })
}
