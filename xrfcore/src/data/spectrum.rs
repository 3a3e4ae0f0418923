use std::fmt;
use std::fmt::{Display, Formatter};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpectrumError {
    #[error("spectrum length mismatch: expected {expected} channels, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("channel range [{left}, {right}] is out of bounds for a spectrum of {len} channels")]
    RangeOutOfBounds { left: usize, right: usize, len: usize },
}

/// Represents a fixed-length MCA spectrum, one count value per detector channel.
///
/// The channel axis is implicit: channel `i` maps to energy
/// `energy_offset + i * energy_slope` under the detector calibration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<f64>", into = "Vec<f64>")]
pub struct Spectrum {
    counts: DVector<f64>,
}

impl Spectrum {
    /// Constructs a new `Spectrum` from per-channel counts.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use xrfcore::data::spectrum::Spectrum;
    /// let spectrum = Spectrum::new(vec![1.0, 2.0, 3.0]);
    /// assert_eq!(spectrum.len(), 3);
    /// assert_eq!(spectrum.counts(), &[1.0, 2.0, 3.0]);
    /// ```
    pub fn new(counts: Vec<f64>) -> Self {
        Spectrum { counts: DVector::from_vec(counts) }
    }

    /// Constructs an empty (all zero) spectrum with `n_channels` channels.
    pub fn zeros(n_channels: usize) -> Self {
        Spectrum { counts: DVector::zeros(n_channels) }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn counts(&self) -> &[f64] {
        self.counts.as_slice()
    }

    pub fn total(&self) -> f64 {
        self.counts.sum()
    }

    /// Sums the counts over the inclusive channel interval `[left, right]`.
    ///
    /// An interval with `left > right` is empty and sums to zero. An interval reaching
    /// past the last channel is an error.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use xrfcore::data::spectrum::Spectrum;
    /// let spectrum = Spectrum::new(vec![1.0; 10]);
    /// assert_eq!(spectrum.sum_range(2, 5).unwrap(), 4.0);
    /// assert_eq!(spectrum.sum_range(5, 4).unwrap(), 0.0);
    /// assert!(spectrum.sum_range(8, 10).is_err());
    /// ```
    pub fn sum_range(&self, left: usize, right: usize) -> Result<f64, SpectrumError> {
        if left > right {
            return Ok(0.0);
        }
        if right >= self.len() {
            return Err(SpectrumError::RangeOutOfBounds { left, right, len: self.len() });
        }
        Ok(self.counts.as_slice()[left..=right].iter().sum())
    }

    /// Adds `other` channel by channel into this spectrum.
    ///
    /// Spectra of different lengths are never merged: on a length mismatch `self` is left
    /// untouched and an error is returned.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use xrfcore::data::spectrum::Spectrum;
    /// let mut acc = Spectrum::new(vec![1.0, 1.0, 1.0]);
    /// acc.add(&Spectrum::new(vec![2.0, 2.0, 2.0])).unwrap();
    /// assert_eq!(acc.counts(), &[3.0, 3.0, 3.0]);
    /// assert!(acc.add(&Spectrum::new(vec![1.0, 1.0])).is_err());
    /// ```
    pub fn add(&mut self, other: &Spectrum) -> Result<(), SpectrumError> {
        if self.len() != other.len() {
            return Err(SpectrumError::LengthMismatch { expected: self.len(), actual: other.len() });
        }
        self.counts += &other.counts;
        Ok(())
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.counts.data.into()
    }
}

impl From<Vec<f64>> for Spectrum {
    fn from(counts: Vec<f64>) -> Self {
        Spectrum::new(counts)
    }
}

impl From<Spectrum> for Vec<f64> {
    fn from(spectrum: Spectrum) -> Self {
        spectrum.into_vec()
    }
}

impl Display for Spectrum {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "Spectrum(channels: {}, total: {})", self.len(), self.total())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_range_inclusive() {
        let spectrum = Spectrum::new((0..10).map(|i| i as f64).collect());
        assert_eq!(spectrum.sum_range(0, 0).unwrap(), 0.0);
        assert_eq!(spectrum.sum_range(1, 3).unwrap(), 6.0);
        assert_eq!(spectrum.sum_range(0, 9).unwrap(), 45.0);
    }

    #[test]
    fn test_sum_range_out_of_bounds() {
        let spectrum = Spectrum::zeros(4);
        assert_eq!(
            spectrum.sum_range(2, 4),
            Err(SpectrumError::RangeOutOfBounds { left: 2, right: 4, len: 4 })
        );
    }

    #[test]
    fn test_add_accumulates_in_place() {
        let mut acc = Spectrum::new(vec![1.0, 1.0, 1.0]);
        acc.add(&Spectrum::new(vec![2.0, 2.0, 2.0])).unwrap();
        assert_eq!(acc.counts(), &[3.0, 3.0, 3.0]);

        // order of accumulation does not matter
        let mut other = Spectrum::new(vec![2.0, 2.0, 2.0]);
        other.add(&Spectrum::new(vec![1.0, 1.0, 1.0])).unwrap();
        assert_eq!(acc, other);
    }

    #[test]
    fn test_add_rejects_length_mismatch() {
        let mut acc = Spectrum::new(vec![1.0, 2.0, 3.0]);
        let err = acc.add(&Spectrum::new(vec![1.0, 1.0])).unwrap_err();
        assert_eq!(err, SpectrumError::LengthMismatch { expected: 3, actual: 2 });
        // untouched
        assert_eq!(acc.counts(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_serde_as_plain_list() {
        let spectrum = Spectrum::new(vec![5.0, 0.0, 2.5]);
        let json = serde_json::to_string(&spectrum).unwrap();
        assert_eq!(json, "[5.0,0.0,2.5]");
        let back: Spectrum = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spectrum);
    }
}
