//! Synthetic raster driver.
//!
//! Walks a raster tile by tile and, for every detector, feeds a simulated spectrum into the stream
//! accumulator, the way an acquisition driver would.

use std::collections::BTreeMap;

use itertools::iproduct;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use xrfcore::simulation::spectrum::{SimulationError, SpectrumSimulator};
use xrfcore::stream::accumulator::StreamAccumulator;
use xrfcore::stream::block::{DetectorId, FitContext};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RasterSummary {
    pub deliveries: usize,
    pub rejected: usize,
}

/// A `rows` x `cols` raster read out by several detectors.
///
/// The raster reports its bounds as the last row and column index, so the delivery of tile
/// `(rows - 1, cols - 1)` completes a detector's scan.
pub struct SyntheticRaster {
    pub rows: usize,
    pub cols: usize,
    pub simulator: SpectrumSimulator,
    contexts: BTreeMap<DetectorId, FitContext>,
    rng: StdRng,
}

impl SyntheticRaster {
    pub fn new(rows: usize, cols: usize, simulator: SpectrumSimulator, seed: u64) -> Self {
        SyntheticRaster { rows, cols, simulator, contexts: BTreeMap::new(), rng: StdRng::seed_from_u64(seed) }
    }

    /// Adds a detector reading out the raster with its own fit context.
    pub fn with_detector(mut self, detector_id: DetectorId, context: FitContext) -> Self {
        self.contexts.insert(detector_id, context);
        self
    }

    pub fn detectors(&self) -> impl Iterator<Item = &DetectorId> {
        self.contexts.keys()
    }

    /// Bounds as reported to the accumulator.
    pub fn bounds(&self) -> (usize, usize) {
        (self.rows.saturating_sub(1), self.cols.saturating_sub(1))
    }

    /// Runs one full scan. Deliveries the accumulator rejects are counted and skipped.
    pub fn scan(&mut self, accumulator: &StreamAccumulator) -> Result<RasterSummary, SimulationError> {
        let (height, width) = self.bounds();
        let detectors: Vec<DetectorId> = self.contexts.keys().copied().collect();
        let mut summary = RasterSummary::default();

        for (row, col, detector_id) in iproduct!(0..self.rows, 0..self.cols, detectors) {
            let context = &self.contexts[&detector_id];
            let spectrum = self.simulator.sample(&context.elements, &mut self.rng)?;
            summary.deliveries += 1;
            if accumulator
                .on_spectrum_delivered(row, col, height, width, detector_id, spectrum, context.clone())
                .is_err()
            {
                summary.rejected += 1;
            }
        }
        debug!("Raster {}x{} delivered: {:?}", self.rows, self.cols, summary);
        info!(
            "Scan of {} tiles finished on {} detector(s)",
            self.rows * self.cols,
            self.contexts.len()
        );
        Ok(summary)
    }
}
