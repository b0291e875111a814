//! Sample decoding helpers shared by the gate, the meter, and the WAV stage.

use std::fmt;
use std::str::FromStr;

/// Level reported for an empty buffer, low enough to sit below any real line.
pub const SILENCE_FLOOR_DB: f32 = -100.0;

/// Midpoint of the unsigned 8-bit wire format.
const U8_MIDPOINT: i32 = 128;

/// Width of one sample on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleWidth {
    /// Unsigned 8-bit PCM, one byte per sample.
    Eight,
    /// Little-endian 16-bit words, two bytes per sample.
    Sixteen,
}

impl SampleWidth {
    pub fn from_bytes(bytes: u16) -> Option<Self> {
        match bytes {
            1 => Some(SampleWidth::Eight),
            2 => Some(SampleWidth::Sixteen),
            _ => None,
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            SampleWidth::Eight => 1,
            SampleWidth::Sixteen => 2,
        }
    }

    pub fn bits(self) -> u16 {
        (self.bytes() * 8) as u16
    }
}

/// How the DC component of the incoming stream is handled before the payload
/// goes into the container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DcOffset {
    /// Leave 16-bit words untouched; 8-bit samples still shift by the format
    /// midpoint because the container stores them signed.
    None,
    /// Subtract the mean of the whole capture, computed at the end of the run.
    Auto,
    /// Subtract a fixed code, e.g. 2048 for a 12-bit ADC centered mid-scale.
    Fixed(i32),
}

impl FromStr for DcOffset {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "none" => Ok(DcOffset::None),
            "auto" => Ok(DcOffset::Auto),
            _ => trimmed
                .parse::<i32>()
                .map(DcOffset::Fixed)
                .map_err(|_| format!("expected 'none', 'auto', or an integer, got '{trimmed}'")),
        }
    }
}

impl fmt::Display for DcOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DcOffset::None => write!(f, "none"),
            DcOffset::Auto => write!(f, "auto"),
            DcOffset::Fixed(value) => write!(f, "{value}"),
        }
    }
}

/// Decoded payload ready for the WAV writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Pcm {
    Eight(Vec<i8>),
    Sixteen(Vec<i16>),
}

impl Pcm {
    pub fn len(&self) -> usize {
        match self {
            Pcm::Eight(samples) => samples.len(),
            Pcm::Sixteen(samples) => samples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reinterpret a little-endian byte stream as 16-bit words. Trailing bytes
/// that do not form a full word are ignored; the caller accounts for them.
pub fn decode_words_le(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Mean code of a word stream, used for automatic offset removal.
pub fn mean_word(words: &[u16]) -> i32 {
    if words.is_empty() {
        return 0;
    }
    let total: i64 = words.iter().map(|&w| i64::from(w)).sum();
    (total / words.len() as i64) as i32
}

fn mean_byte(bytes: &[u8]) -> i32 {
    if bytes.is_empty() {
        return 0;
    }
    let total: i64 = bytes.iter().map(|&b| i64::from(b)).sum();
    (total / bytes.len() as i64) as i32
}

/// Shift raw codes by `offset` and clamp into the signed 16-bit range.
pub fn center_words(words: &[u16], offset: i32) -> Vec<i16> {
    words
        .iter()
        .map(|&w| (i32::from(w) - offset).clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16)
        .collect()
}

fn center_bytes(bytes: &[u8], offset: i32) -> Vec<i8> {
    bytes
        .iter()
        .map(|&b| (i32::from(b) - offset).clamp(i32::from(i8::MIN), i32::from(i8::MAX)) as i8)
        .collect()
}

/// RMS level of a signed 16-bit buffer in dBFS.
pub fn rms_db(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return SILENCE_FLOOR_DB;
    }
    let energy: f64 = samples
        .iter()
        .map(|&s| {
            let normalized = f64::from(s) / f64::from(i16::MAX);
            normalized * normalized
        })
        .sum::<f64>()
        / samples.len() as f64;
    let rms = energy.sqrt().max(1e-9);
    (20.0 * rms.log10()) as f32
}

/// Peak level of a signed 16-bit buffer in dBFS.
pub fn peak_db(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return SILENCE_FLOOR_DB;
    }
    let peak = samples
        .iter()
        .map(|&s| (f64::from(s) / f64::from(i16::MAX)).abs())
        .fold(0.0_f64, f64::max)
        .max(1e-9);
    (20.0 * peak.log10()) as f32
}

/// Turns captured bytes into samples according to the configured width and
/// offset mode. One instance serves both the per-chunk gate view and the
/// end-of-run payload.
#[derive(Debug, Clone, Copy)]
pub struct SampleDecoder {
    width: SampleWidth,
    dc_offset: DcOffset,
}

impl SampleDecoder {
    pub fn new(width: SampleWidth, dc_offset: DcOffset) -> Self {
        Self { width, dc_offset }
    }

    pub fn width(&self) -> SampleWidth {
        self.width
    }

    pub fn dc_offset(&self) -> DcOffset {
        self.dc_offset
    }

    /// Signed view of one chunk for gating and metering. `Auto` uses the
    /// chunk mean here; the final payload recomputes it over the whole run.
    pub fn gate_view(&self, chunk: &[u8]) -> Vec<i16> {
        match self.width {
            SampleWidth::Sixteen => {
                let words = decode_words_le(chunk);
                match self.dc_offset {
                    DcOffset::None => words.iter().map(|&w| w as i16).collect(),
                    DcOffset::Auto => center_words(&words, mean_word(&words)),
                    DcOffset::Fixed(offset) => center_words(&words, offset),
                }
            }
            SampleWidth::Eight => {
                let offset = match self.dc_offset {
                    DcOffset::None => U8_MIDPOINT,
                    DcOffset::Auto => mean_byte(chunk),
                    DcOffset::Fixed(offset) => offset,
                };
                // Widen to 16 bits so level math is comparable across widths.
                chunk
                    .iter()
                    .map(|&b| {
                        let centered = (i32::from(b) - offset)
                            .clamp(i32::from(i8::MIN), i32::from(i8::MAX));
                        (centered as i16) << 8
                    })
                    .collect()
            }
        }
    }

    /// Convert the accumulated capture into container samples. Returns the
    /// payload and the count of trailing bytes dropped for not filling a
    /// whole sample.
    pub fn finalize(&self, bytes: &[u8]) -> (Pcm, usize) {
        match self.width {
            SampleWidth::Sixteen => {
                let trailing = bytes.len() % 2;
                let words = decode_words_le(bytes);
                let samples = match self.dc_offset {
                    DcOffset::None => words.iter().map(|&w| w as i16).collect(),
                    DcOffset::Auto => center_words(&words, mean_word(&words)),
                    DcOffset::Fixed(offset) => center_words(&words, offset),
                };
                (Pcm::Sixteen(samples), trailing)
            }
            SampleWidth::Eight => {
                let offset = match self.dc_offset {
                    DcOffset::None => U8_MIDPOINT,
                    DcOffset::Auto => mean_byte(bytes),
                    DcOffset::Fixed(offset) => offset,
                };
                (Pcm::Eight(center_bytes(bytes, offset)), 0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_little_endian_words() {
        let bytes = [0x01, 0x00, 0x00, 0x08, 0xFF, 0x0F];
        assert_eq!(decode_words_le(&bytes), vec![0x0001, 0x0800, 0x0FFF]);
    }

    #[test]
    fn drops_trailing_byte_when_finalizing_words() {
        let decoder = SampleDecoder::new(SampleWidth::Sixteen, DcOffset::None);
        let (pcm, trailing) = decoder.finalize(&[0x00, 0x08, 0xAB]);
        assert_eq!(pcm, Pcm::Sixteen(vec![0x0800]));
        assert_eq!(trailing, 1);
    }

    #[test]
    fn none_offset_reinterprets_words_bit_for_bit() {
        let decoder = SampleDecoder::new(SampleWidth::Sixteen, DcOffset::None);
        let (pcm, _) = decoder.finalize(&[0xFF, 0xFF, 0x00, 0x80]);
        assert_eq!(pcm, Pcm::Sixteen(vec![-1, i16::MIN]));
    }

    #[test]
    fn fixed_offset_centers_adc_codes() {
        let words: Vec<u8> = [2048u16, 2049, 2047]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        let decoder = SampleDecoder::new(SampleWidth::Sixteen, DcOffset::Fixed(2048));
        let (pcm, _) = decoder.finalize(&words);
        assert_eq!(pcm, Pcm::Sixteen(vec![0, 1, -1]));
    }

    #[test]
    fn auto_offset_removes_mean() {
        let words: Vec<u8> = [1000u16, 1002, 998, 1000]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        let decoder = SampleDecoder::new(SampleWidth::Sixteen, DcOffset::Auto);
        let (pcm, _) = decoder.finalize(&words);
        assert_eq!(pcm, Pcm::Sixteen(vec![0, 2, -2, 0]));
    }

    #[test]
    fn eight_bit_none_uses_format_midpoint() {
        let decoder = SampleDecoder::new(SampleWidth::Eight, DcOffset::None);
        let (pcm, trailing) = decoder.finalize(&[128, 129, 127, 0, 255]);
        assert_eq!(pcm, Pcm::Eight(vec![0, 1, -1, -128, 127]));
        assert_eq!(trailing, 0);
    }

    #[test]
    fn rms_db_is_zero_for_full_scale() {
        let samples = vec![i16::MAX; 64];
        assert!(rms_db(&samples).abs() < 0.01);
    }

    #[test]
    fn peak_db_tracks_largest_sample() {
        let samples = vec![i16::MAX / 2, -100, 50];
        let expected = 20.0 * 0.5_f32.log10();
        assert!((peak_db(&samples) - expected).abs() < 0.1);
    }

    #[test]
    fn empty_buffers_report_the_floor() {
        assert_eq!(rms_db(&[]), SILENCE_FLOOR_DB);
        assert_eq!(peak_db(&[]), SILENCE_FLOOR_DB);
    }

    #[test]
    fn dc_offset_parses_all_forms() {
        assert_eq!("none".parse::<DcOffset>().unwrap(), DcOffset::None);
        assert_eq!("AUTO".parse::<DcOffset>().unwrap(), DcOffset::Auto);
        assert_eq!("2048".parse::<DcOffset>().unwrap(), DcOffset::Fixed(2048));
        assert!("midway".parse::<DcOffset>().is_err());
    }

    #[test]
    fn sample_width_round_trips_byte_counts() {
        assert_eq!(SampleWidth::from_bytes(1), Some(SampleWidth::Eight));
        assert_eq!(SampleWidth::from_bytes(2), Some(SampleWidth::Sixteen));
        assert_eq!(SampleWidth::from_bytes(3), None);
        assert_eq!(SampleWidth::Sixteen.bits(), 16);
    }

    #[test]
    fn gate_view_widens_eight_bit_samples() {
        let decoder = SampleDecoder::new(SampleWidth::Eight, DcOffset::None);
        let view = decoder.gate_view(&[128, 255, 0]);
        assert_eq!(view, vec![0, 127 << 8, -128 << 8]);
    }
}
