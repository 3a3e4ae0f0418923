use std::fmt;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::data::element::ElementSpecification;
use crate::data::spectrum::Spectrum;
use crate::fitting::parameters::{FitError, FitModel};
use crate::fitting::roi::RoiFitRoutine;
use crate::fitting::routine::{Counts, FitRoutine};

/// Detector channel identifier.
pub type DetectorId = u32;

/// Whether tile `(row, col)` is the last tile of a raster whose bounds are reported as
/// `(height, width)`.
///
/// This coordinate match is the only completion signal of a scan.
///
/// # Example
///
/// ```rust
/// # use xrfcore::stream::block::is_final_tile;
/// assert!(is_final_tile(3, 7, 3, 7));
/// assert!(!is_final_tile(3, 6, 3, 7));
/// assert!(!is_final_tile(7, 3, 3, 7));
/// ```
pub fn is_final_tile(row: usize, col: usize, height: usize, width: usize) -> bool {
    row == height && col == width
}

/// Everything needed to reduce the accumulated spectrum of one detector: the model carrying the
/// energy calibration, the elements to fit and the routine to run.
///
/// Shared read-only between all deliveries of a detector.
#[derive(Clone)]
pub struct FitContext {
    pub model: Arc<dyn FitModel>,
    pub elements: Arc<ElementSpecification>,
    pub routine: Arc<dyn FitRoutine>,
}

impl FitContext {
    pub fn new(model: Arc<dyn FitModel>, elements: Arc<ElementSpecification>) -> Self {
        FitContext { model, elements, routine: Arc::new(RoiFitRoutine) }
    }

    pub fn with_routine(mut self, routine: Arc<dyn FitRoutine>) -> Self {
        self.routine = routine;
        self
    }

    pub fn fit(&self, spectrum: &Spectrum) -> Result<Counts, FitError> {
        self.routine.fit_spectra(self.model.as_ref(), spectrum, &self.elements)
    }
}

impl fmt::Debug for FitContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FitContext")
            .field("routine", &self.routine.name())
            .field("elements", &self.elements.len())
            .finish()
    }
}

/// The accumulating record of one detector over a raster scan.
///
/// `row`/`col` hold the last merged tile; `tiles` counts the deliveries merged so far.
#[derive(Debug)]
pub struct StreamBlock {
    pub row: usize,
    pub col: usize,
    pub height: usize,
    pub width: usize,
    pub detector_id: DetectorId,
    pub spectrum: Spectrum,
    pub fit_context: FitContext,
    pub tiles: usize,
}

impl StreamBlock {
    pub fn new(
        row: usize,
        col: usize,
        height: usize,
        width: usize,
        detector_id: DetectorId,
        spectrum: Spectrum,
        fit_context: FitContext,
    ) -> Self {
        StreamBlock { row, col, height, width, detector_id, spectrum, fit_context, tiles: 1 }
    }

    pub fn is_complete(&self) -> bool {
        is_final_tile(self.row, self.col, self.height, self.width)
    }

    /// Runs the block's fit routine over the accumulated spectrum.
    pub fn fit(&self) -> Result<Counts, FitError> {
        self.fit_context.fit(&self.spectrum)
    }
}

impl Display for StreamBlock {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StreamBlock(detector: {}, tile: ({}, {}) of ({}, {}), tiles: {}, {})",
            self.detector_id, self.row, self.col, self.height, self.width, self.tiles, self.spectrum
        )
    }
}
