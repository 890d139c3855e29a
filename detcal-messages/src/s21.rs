use thiserror::Error;

/// A frequency-indexed S21 magnitude curve for one cable/attenuator path.
///
/// Frequencies are strictly ascending and there is exactly one magnitude per
/// frequency. The table is read-only once built.
#[derive(Debug, Clone, PartialEq)]
pub struct S21Table {
    frequencies: Vec<f64>,
    magnitudes_db: Vec<f64>,
}

impl S21Table {
    pub fn new(frequencies: Vec<f64>, magnitudes_db: Vec<f64>) -> Result<Self, S21TableError> {
        if frequencies.is_empty() {
            return Err(S21TableError::Empty);
        }
        if frequencies.len() != magnitudes_db.len() {
            return Err(S21TableError::LengthMismatch {
                frequencies: frequencies.len(),
                magnitudes: magnitudes_db.len(),
            });
        }
        if let Some(i) = frequencies
            .iter()
            .chain(magnitudes_db.iter())
            .position(|v| !v.is_finite())
        {
            return Err(S21TableError::NotFinite(i % frequencies.len()));
        }
        if let Some(i) = frequencies.windows(2).position(|w| w[1] <= w[0]) {
            return Err(S21TableError::NotAscending(i + 1));
        }
        Ok(Self {
            frequencies,
            magnitudes_db,
        })
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn magnitudes_db(&self) -> &[f64] {
        &self.magnitudes_db
    }

    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty()
    }

    /// Lowest and highest tabulated frequency.
    pub fn frequency_range(&self) -> (f64, f64) {
        (self.frequencies[0], self.frequencies[self.frequencies.len() - 1])
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum S21TableError {
    #[error("S21 table has no points")]
    Empty,

    #[error("S21 table has {frequencies} frequencies but {magnitudes} magnitudes")]
    LengthMismatch { frequencies: usize, magnitudes: usize },

    #[error("S21 table entry {0} is not a finite number")]
    NotFinite(usize),

    #[error("S21 table frequencies must be strictly ascending (entry {0})")]
    NotAscending(usize),
}
