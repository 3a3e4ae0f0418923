use std::collections::BTreeMap;

use crate::data::element::ElementSpecification;
use crate::data::spectrum::Spectrum;
use crate::fitting::parameters::{FitError, FitModel};

/// Fitted intensity per element name.
pub type Counts = BTreeMap<String, f64>;

/// A routine reducing one spectrum to per-element intensities.
///
/// ROI summation is the routine the streaming pipeline runs; model based fits plug in behind the
/// same interface.
pub trait FitRoutine: Send + Sync {
    fn name(&self) -> &'static str;

    fn fit_spectra(
        &self,
        model: &dyn FitModel,
        spectrum: &Spectrum,
        elements: &ElementSpecification,
    ) -> Result<Counts, FitError>;
}
