//! Command-line parsing and validation helpers.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, ValueEnum};

use crate::capture::CaptureConfig;
use crate::gate::{self, ChunkGate, GateKind};
use crate::pcm::{DcOffset, SampleDecoder, SampleWidth};

const DEFAULT_LISTEN_PORT: u16 = 1234;
const DEFAULT_BAUD: u32 = 115_200;
const DEFAULT_SECONDS: u64 = 5;
const DEFAULT_SAMPLE_RATE: u32 = 44_100;
const DEFAULT_GATE_THRESHOLD_DB: f32 = -50.0;
const DEFAULT_ADC_BITS: u8 = 12;
const DEFAULT_GATE_MIN_IN_RANGE: f32 = 0.9;
const DEFAULT_CHUNK_BYTES: usize = 4_096;
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_POLL_MS: u64 = 100;
const DEFAULT_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_METER_WINDOW_MS: u64 = 3_000;

const MIN_CAPTURE_SECONDS: u64 = 1;
const MAX_CAPTURE_SECONDS: u64 = 600;
pub const MIN_METER_WINDOW_MS: u64 = 500;
pub const MAX_METER_WINDOW_MS: u64 = 30_000;

/// Transport the capture loop reads from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum SourceKind {
    /// Bound UDP socket receiving datagrams from the board.
    Udp,
    /// Serial port talking to the board's USB CDC endpoint.
    Serial,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Udp => write!(f, "udp"),
            SourceKind::Serial => write!(f, "serial"),
        }
    }
}

fn parse_dc_offset(value: &str) -> Result<DcOffset, String> {
    DcOffset::from_str(value)
}

/// CLI options. Validated values feed the capture pipeline directly.
#[derive(Debug, Parser, Clone)]
#[command(
    about = "Capture PCM audio streamed over UDP or serial and write it to WAV",
    author,
    version
)]
pub struct AppConfig {
    /// Transport to capture from
    #[arg(long, value_enum, default_value_t = SourceKind::Udp)]
    pub source: SourceKind,

    /// Local address the UDP listener binds
    #[arg(long = "listen-ip", default_value = "0.0.0.0")]
    pub listen_ip: IpAddr,

    /// Local port the UDP listener binds (0 lets the OS pick)
    #[arg(long = "listen-port", default_value_t = DEFAULT_LISTEN_PORT)]
    pub listen_port: u16,

    /// Serial device path, e.g. /dev/ttyACM0 (required with --source serial)
    #[arg(long = "serial-port")]
    pub serial_port: Option<String>,

    /// Serial baud rate
    #[arg(long, default_value_t = DEFAULT_BAUD)]
    pub baud: u32,

    /// Capture duration in seconds
    #[arg(long, default_value_t = DEFAULT_SECONDS)]
    pub seconds: u64,

    /// Frame rate stamped into the WAV header (Hz)
    #[arg(long = "sample-rate", default_value_t = DEFAULT_SAMPLE_RATE)]
    pub sample_rate: u32,

    /// Channel count stamped into the WAV header
    #[arg(long, default_value_t = 1)]
    pub channels: u16,

    /// Bytes per sample on the wire (1 or 2)
    #[arg(long = "sample-width", default_value_t = 2)]
    pub sample_width: u16,

    /// DC offset handling: 'none', 'auto', or a fixed code such as 2048
    #[arg(long = "dc-offset", default_value = "none", value_parser = parse_dc_offset)]
    pub dc_offset: DcOffset,

    /// Chunk gate applied before accumulation
    #[arg(long, value_enum, default_value_t = GateKind::None)]
    pub gate: GateKind,

    /// RMS threshold for the energy gate (dBFS)
    #[arg(long = "gate-threshold-db", default_value_t = DEFAULT_GATE_THRESHOLD_DB)]
    pub gate_threshold_db: f32,

    /// ADC resolution assumed by the range gate (bits)
    #[arg(long = "adc-bits", default_value_t = DEFAULT_ADC_BITS)]
    pub adc_bits: u8,

    /// Fraction of decoded samples the range gate requires in band
    #[arg(long = "gate-min-in-range", default_value_t = DEFAULT_GATE_MIN_IN_RANGE)]
    pub gate_min_in_range: f32,

    /// Largest chunk pulled from the transport per read (bytes)
    #[arg(long = "chunk-bytes", default_value_t = DEFAULT_CHUNK_BYTES)]
    pub chunk_bytes: usize,

    /// Quiet window after which the source counts as idle (milliseconds)
    #[arg(long = "idle-timeout-ms", default_value_t = DEFAULT_IDLE_TIMEOUT_MS)]
    pub idle_timeout_ms: u64,

    /// Queue poll interval for the capture loop (milliseconds)
    #[arg(long = "poll-ms", default_value_t = DEFAULT_POLL_MS)]
    pub poll_ms: u64,

    /// Queue depth between the pump thread and the capture loop
    #[arg(long = "channel-capacity", default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    pub channel_capacity: usize,

    /// Output WAV path
    #[arg(long, short = 'o', default_value = "capture.wav")]
    pub output: PathBuf,

    /// Also dump the raw accumulated bytes to this path
    #[arg(long = "raw-out")]
    pub raw_out: Option<PathBuf>,

    /// Print the session summary as JSON instead of text
    #[arg(long = "emit-json")]
    pub emit_json: bool,

    /// Print detected serial ports and exit
    #[arg(long = "list-ports", default_value_t = false)]
    pub list_ports: bool,

    /// Render an environment report and exit
    #[arg(long)]
    pub doctor: bool,

    /// Sample line levels, suggest a gate threshold, and exit
    #[arg(long)]
    pub meter: bool,

    /// Sampling window for each meter phase (milliseconds)
    #[arg(long = "meter-window-ms", default_value_t = DEFAULT_METER_WINDOW_MS)]
    pub meter_window_ms: u64,
}

impl AppConfig {
    /// Parse CLI arguments and validate them right away.
    pub fn parse_args() -> Result<Self> {
        let mut config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    /// Check CLI values before any socket or file is touched.
    pub fn validate(&mut self) -> Result<()> {
        if !(MIN_CAPTURE_SECONDS..=MAX_CAPTURE_SECONDS).contains(&self.seconds) {
            bail!(
                "--seconds must be between {MIN_CAPTURE_SECONDS} and {MAX_CAPTURE_SECONDS}, got {}",
                self.seconds
            );
        }
        if !(8_000..=96_000).contains(&self.sample_rate) {
            bail!(
                "--sample-rate must be between 8000 and 96000 Hz, got {}",
                self.sample_rate
            );
        }
        if !(1..=2).contains(&self.channels) {
            bail!("--channels must be 1 or 2, got {}", self.channels);
        }
        if SampleWidth::from_bytes(self.sample_width).is_none() {
            bail!("--sample-width must be 1 or 2, got {}", self.sample_width);
        }
        if !(64..=65_536).contains(&self.chunk_bytes) {
            bail!(
                "--chunk-bytes must be between 64 and 65536, got {}",
                self.chunk_bytes
            );
        }
        if !(100..=60_000).contains(&self.idle_timeout_ms) {
            bail!(
                "--idle-timeout-ms must be between 100 and 60000, got {}",
                self.idle_timeout_ms
            );
        }
        if !(5..=1_000).contains(&self.poll_ms) {
            bail!("--poll-ms must be between 5 and 1000, got {}", self.poll_ms);
        }
        if self.poll_ms > self.idle_timeout_ms {
            bail!(
                "--poll-ms ({}) cannot exceed --idle-timeout-ms ({})",
                self.poll_ms,
                self.idle_timeout_ms
            );
        }
        if !(8..=1_024).contains(&self.channel_capacity) {
            bail!(
                "--channel-capacity must be between 8 and 1024, got {}",
                self.channel_capacity
            );
        }
        if !(-120.0..=0.0).contains(&self.gate_threshold_db) {
            bail!(
                "--gate-threshold-db must be between -120.0 and 0.0 dB, got {}",
                self.gate_threshold_db
            );
        }
        if !(8..=16).contains(&self.adc_bits) {
            bail!("--adc-bits must be between 8 and 16, got {}", self.adc_bits);
        }
        if !(0.05..=1.0).contains(&self.gate_min_in_range) {
            bail!(
                "--gate-min-in-range must be between 0.05 and 1.0, got {}",
                self.gate_min_in_range
            );
        }
        if !(1_200..=3_000_000).contains(&self.baud) {
            bail!("--baud must be between 1200 and 3000000, got {}", self.baud);
        }
        if self.source == SourceKind::Serial {
            match &self.serial_port {
                Some(path) if !path.trim().is_empty() => {}
                _ => bail!("--serial-port is required with --source serial"),
            }
        }
        if !(MIN_METER_WINDOW_MS..=MAX_METER_WINDOW_MS).contains(&self.meter_window_ms) {
            bail!(
                "--meter-window-ms must be between {MIN_METER_WINDOW_MS} and {MAX_METER_WINDOW_MS}, got {}",
                self.meter_window_ms
            );
        }

        ensure_parent_exists(&self.output, "--output")?;
        if let Some(raw) = &self.raw_out {
            ensure_parent_exists(raw, "--raw-out")?;
        }

        Ok(())
    }

    /// Width of one wire sample; `validate` has already bounded the flag.
    pub fn wire_sample_width(&self) -> Result<SampleWidth> {
        SampleWidth::from_bytes(self.sample_width)
            .ok_or_else(|| anyhow!("--sample-width must be 1 or 2, got {}", self.sample_width))
    }

    /// Bytes one full-length capture produces at the configured format.
    pub fn expected_bytes(&self) -> usize {
        self.seconds as usize
            * self.sample_rate as usize
            * usize::from(self.channels)
            * usize::from(self.sample_width.clamp(1, 2))
    }

    /// Snapshot for the capture loop. The byte cap equals a full-length
    /// capture, so an over-eager source ends the run exactly when the
    /// requested amount of audio is in hand.
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            duration_ms: self.seconds.saturating_mul(1_000),
            idle_timeout_ms: self.idle_timeout_ms,
            chunk_bytes: self.chunk_bytes,
            channel_capacity: self.channel_capacity,
            poll_ms: self.poll_ms,
            max_bytes: self.expected_bytes().max(1),
        }
    }

    pub fn decoder(&self) -> Result<SampleDecoder> {
        Ok(SampleDecoder::new(self.wire_sample_width()?, self.dc_offset))
    }

    pub fn build_gate(&self) -> Option<Box<dyn ChunkGate>> {
        gate::build_gate(
            self.gate,
            self.gate_threshold_db,
            self.adc_bits,
            self.gate_min_in_range,
        )
    }
}

fn ensure_parent_exists(path: &Path, flag: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            bail!("{flag} directory '{}' does not exist", parent.display());
        }
    }
    Ok(())
}
