use serde::{Deserialize, Serialize};

/// Frequency in Hertz.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Hertz(pub f64);

impl std::fmt::Display for Hertz {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hz = self.0;
        if hz.abs() >= 1e9 {
            write!(f, "{:.3} GHz", hz / 1e9)
        } else if hz.abs() >= 1e6 {
            write!(f, "{:.2} MHz", hz / 1e6)
        } else if hz.abs() >= 1e3 {
            write!(f, "{:.2} kHz", hz / 1e3)
        } else {
            write!(f, "{hz} Hz")
        }
    }
}

impl Hertz {
    pub fn khz(khz: f64) -> Self {
        Self(khz * 1e3)
    }

    pub fn mhz(mhz: f64) -> Self {
        Self(mhz * 1e6)
    }

    pub fn ghz(ghz: f64) -> Self {
        Self(ghz * 1e9)
    }

    pub const fn as_hz(self) -> f64 {
        self.0
    }
}

impl From<f64> for Hertz {
    fn from(hz: f64) -> Self {
        Self(hz)
    }
}

impl From<Hertz> for f64 {
    fn from(hz: Hertz) -> Self {
        hz.0
    }
}

/// Ratio in Decibels (dB).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Decibels(pub f64);

impl std::fmt::Display for Decibels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2} dB", self.0)
    }
}

impl Decibels {
    /// Convert decibels to a linear amplitude ratio.
    /// For voltage/amplitude: linear = 10^(dB/20)
    pub fn to_linear(self) -> f64 {
        10.0_f64.powf(self.0 / 20.0)
    }

    /// Convert a linear amplitude ratio (e.g. |S21|) to decibels.
    /// For voltage/amplitude: dB = 20 * log10(linear)
    pub fn from_linear(linear: f64) -> Self {
        Self(20.0 * linear.log10())
    }

    pub const fn as_db(self) -> f64 {
        self.0
    }
}

impl From<f64> for Decibels {
    fn from(db: f64) -> Self {
        Self(db)
    }
}

impl From<Decibels> for f64 {
    fn from(db: Decibels) -> Self {
        db.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn hertz_display_picks_a_readable_unit() {
        assert_eq!(Hertz::ghz(1.5).to_string(), "1.500 GHz");
        assert_eq!(Hertz::mhz(250.0).to_string(), "250.00 MHz");
        assert_eq!(Hertz::khz(10.0).to_string(), "10.00 kHz");
        assert_eq!(Hertz(50.0).to_string(), "50 Hz");
    }

    #[test]
    fn decibels_linear_conversions() {
        assert_abs_diff_eq!(Decibels::from_linear(0.1).as_db(), -20.0, epsilon = 1e-12);
        assert_abs_diff_eq!(Decibels(-6.0).to_linear(), 0.501_187, epsilon = 1e-6);
    }
}
