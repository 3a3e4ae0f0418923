use std::collections::BTreeMap;
use std::fmt;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::spectrum::SpectrumError;

pub const ENERGY_OFFSET: &str = "energy_offset";
pub const ENERGY_SLOPE: &str = "energy_slope";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("fit parameter {0:?} is not defined for this model")]
    MissingParameter(String),
    #[error("spectrum has {len} channels, at least 2 are required for roi extraction")]
    SpectrumTooShort { len: usize },
    #[error(transparent)]
    Spectrum(#[from] SpectrumError),
    #[error("failed to build fit thread pool: {0}")]
    ThreadPool(String),
}

/// A single named scalar fit parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitParameter {
    pub name: String,
    pub value: f64,
}

/// Named parameter set of a fitting model, e.g. the detector energy calibration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FitParameters {
    params: BTreeMap<String, FitParameter>,
}

impl FitParameters {
    pub fn new() -> Self {
        FitParameters::default()
    }

    /// Inserts or replaces the parameter `name`.
    pub fn set(&mut self, name: &str, value: f64) {
        self.params.insert(name.to_string(), FitParameter { name: name.to_string(), value });
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.params.get(name).map(|p| p.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    fn required(&self, name: &str) -> Result<f64, FitError> {
        self.value(name).ok_or_else(|| FitError::MissingParameter(name.to_string()))
    }
}

/// Linear energy calibration of an MCA: `energy(channel) = energy_offset + channel * energy_slope`, in keV.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub energy_offset: f64,
    pub energy_slope: f64,
}

impl Calibration {
    pub fn new(energy_offset: f64, energy_slope: f64) -> Self {
        Calibration { energy_offset, energy_slope }
    }

    /// Reads `energy_offset` and `energy_slope` from a parameter set.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use xrfcore::fitting::parameters::{Calibration, FitParameters};
    /// let mut params = FitParameters::new();
    /// params.set("energy_offset", 0.0);
    /// assert!(Calibration::from_parameters(&params).is_err());
    /// params.set("energy_slope", 0.01);
    /// assert_eq!(Calibration::from_parameters(&params).unwrap(), Calibration::new(0.0, 0.01));
    /// ```
    pub fn from_parameters(params: &FitParameters) -> Result<Self, FitError> {
        Ok(Calibration {
            energy_offset: params.required(ENERGY_OFFSET)?,
            energy_slope: params.required(ENERGY_SLOPE)?,
        })
    }

    /// Unclamped channel index of `energy` (keV); float to int conversion saturates and NaN maps to 0.
    pub fn channel(&self, energy: f64) -> i64 {
        ((energy - self.energy_offset) / self.energy_slope).floor() as i64
    }

    pub fn energy(&self, channel: usize) -> f64 {
        self.energy_offset + channel as f64 * self.energy_slope
    }
}

impl Display for Calibration {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Calibration(offset: {} keV, slope: {} keV/ch)", self.energy_offset, self.energy_slope)
    }
}

/// A fitting model as far as the streaming pipeline needs it: its parameter set.
pub trait FitModel: Send + Sync {
    fn fit_parameters(&self) -> &FitParameters;

    fn calibration(&self) -> Result<Calibration, FitError> {
        Calibration::from_parameters(self.fit_parameters())
    }
}

/// A model that carries nothing but its parameter set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibratedModel {
    params: FitParameters,
}

impl CalibratedModel {
    pub fn new(params: FitParameters) -> Self {
        CalibratedModel { params }
    }

    pub fn from_calibration(calibration: Calibration) -> Self {
        let mut params = FitParameters::new();
        params.set(ENERGY_OFFSET, calibration.energy_offset);
        params.set(ENERGY_SLOPE, calibration.energy_slope);
        CalibratedModel { params }
    }
}

impl FitModel for CalibratedModel {
    fn fit_parameters(&self) -> &FitParameters {
        &self.params
    }
}
