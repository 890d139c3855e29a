//! Binary payload formats used by the analyzer and the oscilloscope.
//!
//! The analyzer returns traces as REAL,32 with normal byte order (big-endian
//! IEEE 754 singles). The oscilloscope returns RPBinary, two bytes per point,
//! MSB first, as raw ADC counts that must be scaled with the waveform
//! preamble.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("binary block of {len} bytes is not a multiple of {width}")]
    Misaligned { len: usize, width: usize },
}

/// Decode a big-endian REAL,32 block.
pub fn decode_real32_be(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    let width = std::mem::size_of::<f32>();
    if bytes.len() % width != 0 {
        return Err(CodecError::Misaligned {
            len: bytes.len(),
            width,
        });
    }
    Ok(bytes
        .chunks_exact(width)
        .map(|b| f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

pub fn encode_real32_be(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

/// Decode an RPBinary block of unsigned 16-bit ADC counts, MSB first.
pub fn decode_rpbinary16(bytes: &[u8]) -> Result<Vec<u16>, CodecError> {
    let width = std::mem::size_of::<u16>();
    if bytes.len() % width != 0 {
        return Err(CodecError::Misaligned {
            len: bytes.len(),
            width,
        });
    }
    Ok(bytes
        .chunks_exact(width)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .collect())
}

pub fn encode_rpbinary16(counts: &[u16]) -> Vec<u8> {
    counts.iter().flat_map(|c| c.to_be_bytes()).collect()
}

/// The `WFMOUTPRE` values needed to turn ADC counts into volts and point
/// indices into seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveformPreamble {
    /// Volts per ADC count.
    pub y_mult: f64,
    /// Volts added after scaling.
    pub y_zero: f64,
    /// ADC counts subtracted before scaling.
    pub y_offset: f64,
    /// Seconds between points.
    pub x_incr: f64,
    /// Time of the first point.
    pub x_zero: f64,
}

impl WaveformPreamble {
    pub fn to_volts(&self, raw: u16) -> f64 {
        (f64::from(raw) - self.y_offset) * self.y_mult + self.y_zero
    }

    /// Inverse of [`WaveformPreamble::to_volts`], saturating at the ADC
    /// limits the way a clipped channel does.
    pub fn to_counts(&self, volts: f64) -> u16 {
        let counts = (volts - self.y_zero) / self.y_mult + self.y_offset;
        counts.round().clamp(0.0, f64::from(u16::MAX)) as u16
    }

    pub fn scale(&self, raw: &[u16]) -> Waveform {
        let voltage = raw.iter().map(|&r| self.to_volts(r)).collect();
        let time = (0..raw.len())
            .map(|i| self.x_zero + i as f64 * self.x_incr)
            .collect();
        Waveform { time, voltage }
    }
}

/// One acquired record: time axis in seconds, voltage in volts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Waveform {
    pub time: Vec<f64>,
    pub voltage: Vec<f64>,
}

impl Waveform {
    /// Mean voltage over the record, `None` for an empty record.
    pub fn mean_voltage(&self) -> Option<f64> {
        if self.voltage.is_empty() {
            return None;
        }
        Some(self.voltage.iter().sum::<f64>() / self.voltage.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn real32_trace_is_big_endian() {
        // -20.0f32 is 0xC1A00000
        let bytes = [0xC1, 0xA0, 0x00, 0x00, 0x3F, 0x80, 0x00, 0x00];
        assert_eq!(decode_real32_be(&bytes).unwrap(), vec![-20.0, 1.0]);
    }

    #[test]
    fn real32_rejects_truncated_blocks() {
        assert_eq!(
            decode_real32_be(&[0xC1, 0xA0, 0x00]),
            Err(CodecError::Misaligned { len: 3, width: 4 })
        );
    }

    #[test]
    fn rpbinary_is_msb_first() {
        let bytes = [0x80, 0x00, 0x00, 0x01];
        assert_eq!(decode_rpbinary16(&bytes).unwrap(), vec![32768, 1]);
        assert!(decode_rpbinary16(&[0x80]).is_err());
    }

    #[test]
    fn preamble_scales_counts_to_volts() {
        let preamble = WaveformPreamble {
            y_mult: 15.625e-6,
            y_zero: 0.0,
            y_offset: 32768.0,
            x_incr: 1e-6,
            x_zero: -5e-6,
        };
        let waveform = preamble.scale(&[32768, 32768 + 6400, 32768 - 6400]);
        assert_abs_diff_eq!(waveform.voltage[0], 0.0);
        assert_abs_diff_eq!(waveform.voltage[1], 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(waveform.voltage[2], -0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(waveform.time[2], -3e-6, epsilon = 1e-15);
        assert_abs_diff_eq!(waveform.mean_voltage().unwrap(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn counts_saturate_at_the_adc_limits() {
        let preamble = WaveformPreamble {
            y_mult: 1e-3,
            y_zero: 0.0,
            y_offset: 32768.0,
            x_incr: 1e-6,
            x_zero: 0.0,
        };
        assert_eq!(preamble.to_counts(1e3), u16::MAX);
        assert_eq!(preamble.to_counts(-1e3), 0);
        assert_eq!(preamble.to_counts(0.0), 32768);
    }

    #[test]
    fn empty_waveform_has_no_mean() {
        assert_eq!(Waveform::default().mean_voltage(), None);
    }
}
