use std::collections::BTreeMap;
use std::fmt;
use std::fmt::{Display, Formatter};

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::data::element::{ElementEntry, ElementSpecification};
use crate::data::spectrum::Spectrum;
use crate::fitting::parameters::{Calibration, FitError, FitModel};
use crate::fitting::routine::{Counts, FitRoutine};

/// Inclusive channel interval of one element's region of interest.
///
/// `left > right` denotes an empty interval, which only degenerate inputs produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoiBounds {
    pub left: i64,
    pub right: i64,
}

impl RoiBounds {
    /// Computes the clamped ROI of `element` for a spectrum of `n_channels` channels.
    ///
    /// The clamps are applied in this order, each one seeing the result of the previous:
    /// 1. `right >= n` becomes `n - 2`
    /// 2. `left > right` becomes `right - 1`
    /// 3. `left < 0` becomes `1`
    /// 4. `right < 0` becomes `n - 2`
    ///
    /// # Example
    ///
    /// ```rust
    /// # use xrfcore::data::element::ElementEntry;
    /// # use xrfcore::fitting::parameters::Calibration;
    /// # use xrfcore::fitting::roi::RoiBounds;
    /// let cal = Calibration::new(0.0, 0.01);
    /// let fe = ElementEntry::new("Fe", 6.405, 200.0).unwrap();
    /// assert_eq!(RoiBounds::compute(&fe, &cal, 2048), RoiBounds { left: 630, right: 650 });
    /// // the right edge is pulled back inside a short spectrum
    /// assert_eq!(RoiBounds::compute(&fe, &cal, 640), RoiBounds { left: 630, right: 638 });
    /// ```
    pub fn compute(element: &ElementEntry, calibration: &Calibration, n_channels: usize) -> Self {
        let n = n_channels as i64;
        let mut left = calibration.channel(element.low_energy());
        let mut right = calibration.channel(element.high_energy());

        if right >= n {
            right = n - 2;
        }
        if left > right {
            left = right.saturating_sub(1);
        }
        if left < 0 {
            left = 1;
        }
        if right < 0 {
            right = n - 2;
        }
        RoiBounds { left, right }
    }

    pub fn is_empty(&self) -> bool {
        self.left > self.right
    }

    pub fn width(&self) -> usize {
        if self.is_empty() { 0 } else { (self.right - self.left + 1) as usize }
    }

    /// Sums `spectrum` over the interval; an empty interval sums to zero.
    pub fn sum(&self, spectrum: &Spectrum) -> Result<f64, FitError> {
        if self.is_empty() {
            return Ok(0.0);
        }
        Ok(spectrum.sum_range(self.left as usize, self.right as usize)?)
    }
}

impl Display for RoiBounds {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.left, self.right)
    }
}

/// Region of interest fit: the intensity of an element is the plain sum of the channels
/// under its emission line.
#[derive(Clone, Copy, Debug, Default)]
pub struct RoiFitRoutine;

impl RoiFitRoutine {
    pub fn new() -> Self {
        RoiFitRoutine
    }

    /// The clamped bounds used for every element, for diagnostics.
    ///
    /// Rejects the same spectrum lengths the fit does.
    pub fn roi_bounds(
        &self,
        model: &dyn FitModel,
        n_channels: usize,
        elements: &ElementSpecification,
    ) -> Result<BTreeMap<String, RoiBounds>, FitError> {
        if n_channels < 2 {
            return Err(FitError::SpectrumTooShort { len: n_channels });
        }
        let calibration = model.calibration()?;
        Ok(elements
            .iter()
            .map(|element| (element.name.clone(), RoiBounds::compute(element, &calibration, n_channels)))
            .collect())
    }

    /// Fits many spectra in parallel with the same model and catalogue, preserving input order.
    ///
    /// # Arguments
    ///
    /// * `model` - Model supplying the energy calibration
    /// * `spectra` - Spectra to reduce
    /// * `elements` - Elements to quantify
    /// * `num_threads` - Number of threads to use
    pub fn fit_spectra_batch(
        &self,
        model: &dyn FitModel,
        spectra: &[Spectrum],
        elements: &ElementSpecification,
        num_threads: usize,
    ) -> Result<Vec<Counts>, FitError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| FitError::ThreadPool(e.to_string()))?;

        pool.install(|| {
            spectra
                .par_iter()
                .map(|spectrum| self.fit_spectra(model, spectrum, elements))
                .collect()
        })
    }
}

impl FitRoutine for RoiFitRoutine {
    fn name(&self) -> &'static str {
        "roi"
    }

    fn fit_spectra(
        &self,
        model: &dyn FitModel,
        spectrum: &Spectrum,
        elements: &ElementSpecification,
    ) -> Result<Counts, FitError> {
        if spectrum.len() < 2 {
            return Err(FitError::SpectrumTooShort { len: spectrum.len() });
        }
        let calibration = model.calibration()?;

        let mut counts = Counts::new();
        for element in elements.iter() {
            let bounds = RoiBounds::compute(element, &calibration, spectrum.len());
            counts.insert(element.name.clone(), bounds.sum(spectrum)?);
        }
        Ok(counts)
    }
}

/// Reduces `spectrum` to per-element ROI sums.
///
/// # Example
///
/// ```rust
/// # use xrfcore::data::element::{ElementEntry, ElementSpecification};
/// # use xrfcore::data::spectrum::Spectrum;
/// # use xrfcore::fitting::parameters::{CalibratedModel, Calibration};
/// # use xrfcore::fitting::roi::extract;
/// let model = CalibratedModel::from_calibration(Calibration::new(0.0, 1.0));
/// // ROI [2.5, 5.5] keV covers channels 2..=5
/// let elements = ElementSpecification::new(vec![ElementEntry::new("Ca", 4.0, 3000.0).unwrap()]).unwrap();
/// let counts = extract(&model, &Spectrum::new(vec![1.0; 10]), &elements).unwrap();
/// assert_eq!(counts["Ca"], 4.0);
/// ```
pub fn extract(model: &dyn FitModel, spectrum: &Spectrum, elements: &ElementSpecification) -> Result<Counts, FitError> {
    RoiFitRoutine.fit_spectra(model, spectrum, elements)
}
