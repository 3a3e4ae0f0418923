use rand::distributions::Distribution;
use rand::Rng;
use statrs::distribution::{Continuous, Normal, Poisson};
use thiserror::Error;

use crate::data::element::ElementSpecification;
use crate::data::spectrum::Spectrum;
use crate::fitting::parameters::Calibration;

// FWHM = 2 * sqrt(2 * ln 2) * sigma
const FWHM_TO_SIGMA: f64 = 2.354_820_045;

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("invalid distribution parameters: {0}")]
    Distribution(String),
}

/// Generates synthetic MCA spectra: one Gaussian line per element on a flat background, with
/// counting noise on top.
///
/// The ROI width of each element is taken as the FWHM of its line.
#[derive(Clone, Debug)]
pub struct SpectrumSimulator {
    pub calibration: Calibration,
    pub n_channels: usize,
    /// Expected counts under each element line.
    pub peak_area: f64,
    /// Expected counts per channel without any line.
    pub background: f64,
}

impl SpectrumSimulator {
    pub fn new(calibration: Calibration, n_channels: usize, peak_area: f64, background: f64) -> Self {
        SpectrumSimulator { calibration, n_channels, peak_area, background }
    }

    /// Noise free expectation value of every channel.
    pub fn expected(&self, elements: &ElementSpecification) -> Result<Spectrum, SimulationError> {
        let mut counts = vec![self.background; self.n_channels];

        for element in elements.iter() {
            let sigma = element.width / 1000.0 / FWHM_TO_SIGMA;
            let line = Normal::new(element.center, sigma).map_err(|e| SimulationError::Distribution(e.to_string()))?;
            for (channel, value) in counts.iter_mut().enumerate() {
                let energy = self.calibration.energy(channel);
                *value += self.peak_area * line.pdf(energy) * self.calibration.energy_slope.abs();
            }
        }
        Ok(Spectrum::new(counts))
    }

    /// Draws one noisy spectrum with Poisson counting noise on every channel.
    pub fn sample<R: Rng + ?Sized>(&self, elements: &ElementSpecification, rng: &mut R) -> Result<Spectrum, SimulationError> {
        let expected = self.expected(elements)?.into_vec();
        let mut counts = Vec::with_capacity(expected.len());

        for lambda in expected {
            if lambda <= 0.0 {
                counts.push(0.0);
                continue;
            }
            let noise = Poisson::new(lambda).map_err(|e| SimulationError::Distribution(e.to_string()))?;
            let count: f64 = noise.sample(rng);
            counts.push(count);
        }
        Ok(Spectrum::new(counts))
    }
}
