use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::data::spectrum::Spectrum;
use crate::stream::block::{is_final_tile, DetectorId, FitContext, StreamBlock};

/// Consumer of completed stream records.
pub type CompletionCallback = Box<dyn Fn(StreamBlock) + Send + Sync>;

const DEFAULT_SHARDS: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("detector {detector_id}: cannot merge a spectrum of {actual} channels into a record of {expected} channels")]
    SpectrumLengthMismatch { detector_id: DetectorId, expected: usize, actual: usize },
    #[error("detector {detector_id}: scan bounds changed from {expected:?} to {actual:?} while accumulating")]
    GeometryMismatch { detector_id: DetectorId, expected: (usize, usize), actual: (usize, usize) },
    #[error("detector {detector_id}: final tile ({row}, {col}) arrived before any other tile of the scan")]
    UnexpectedFinalTile { detector_id: DetectorId, row: usize, col: usize },
}

/// Accumulates the spectra streamed for each detector into one integrated record per scan.
///
/// The first delivery for a detector opens a record, every further delivery is summed into it and
/// the delivery of the final tile closes it. Closed records leave the table and are handed to the
/// completion callback, or dropped when none is registered.
///
/// The table is sharded by detector id: deliveries for one detector are serialized, different
/// detectors can be fed from different threads.
pub struct StreamAccumulator {
    shards: Vec<Mutex<HashMap<DetectorId, StreamBlock>>>,
    on_complete: Option<CompletionCallback>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(num_shards: usize) -> Self {
        StreamAccumulator {
            shards: (0..num_shards.max(1)).map(|_| Mutex::new(HashMap::new())).collect(),
            on_complete: None,
        }
    }

    /// Registers the consumer of completed records.
    pub fn with_completion_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(StreamBlock) + Send + Sync + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Replaces the consumer of completed records, e.g. once the publisher is up.
    pub fn set_completion_callback(&mut self, callback: CompletionCallback) {
        self.on_complete = Some(callback);
    }

    fn shard(&self, detector_id: DetectorId) -> MutexGuard<'_, HashMap<DetectorId, StreamBlock>> {
        self.shards[detector_id as usize % self.shards.len()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Merges one delivered spectrum into the record of `detector_id`.
    ///
    /// Returns the finished record when this delivery is the final tile of the scan. A protocol
    /// violation drops the affected record and is returned as an error; other detectors are not
    /// touched.
    ///
    /// A scan must open with a tile other than the final one: a final tile for a detector with no
    /// open record is rejected with [`StreamError::UnexpectedFinalTile`] and nothing is stored.
    /// Single-tile rasters therefore never complete.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use std::sync::Arc;
    /// # use xrfcore::data::element::ElementSpecification;
    /// # use xrfcore::data::spectrum::Spectrum;
    /// # use xrfcore::fitting::parameters::{CalibratedModel, Calibration};
    /// # use xrfcore::stream::accumulator::StreamAccumulator;
    /// # use xrfcore::stream::block::FitContext;
    /// let context = FitContext::new(
    ///     Arc::new(CalibratedModel::from_calibration(Calibration::new(0.0, 0.01))),
    ///     Arc::new(ElementSpecification::default_k_lines()),
    /// );
    /// let acc = StreamAccumulator::new();
    /// assert!(acc.deliver(0, 0, 0, 1, 7, Spectrum::new(vec![1.0, 1.0, 1.0]), context.clone()).unwrap().is_none());
    /// let block = acc.deliver(0, 1, 0, 1, 7, Spectrum::new(vec![2.0, 2.0, 2.0]), context).unwrap().unwrap();
    /// assert_eq!(block.spectrum.counts(), &[3.0, 3.0, 3.0]);
    /// assert_eq!(acc.residual(), 0);
    /// ```
    #[allow(clippy::too_many_arguments)]
    pub fn deliver(
        &self,
        row: usize,
        col: usize,
        height: usize,
        width: usize,
        detector_id: DetectorId,
        spectrum: Spectrum,
        fit_context: FitContext,
    ) -> Result<Option<StreamBlock>, StreamError> {
        let mut table = self.shard(detector_id);

        match table.entry(detector_id) {
            Entry::Vacant(slot) => {
                if is_final_tile(row, col, height, width) {
                    return Err(StreamError::UnexpectedFinalTile { detector_id, row, col });
                }
                slot.insert(StreamBlock::new(row, col, height, width, detector_id, spectrum, fit_context));
                Ok(None)
            }
            Entry::Occupied(mut slot) => {
                let block = slot.get_mut();
                if (block.height, block.width) != (height, width) {
                    let expected = (block.height, block.width);
                    slot.remove();
                    return Err(StreamError::GeometryMismatch { detector_id, expected, actual: (height, width) });
                }
                if block.spectrum.add(&spectrum).is_err() {
                    let expected = block.spectrum.len();
                    slot.remove();
                    return Err(StreamError::SpectrumLengthMismatch { detector_id, expected, actual: spectrum.len() });
                }
                block.row = row;
                block.col = col;
                block.tiles += 1;

                if is_final_tile(row, col, height, width) {
                    Ok(Some(slot.remove()))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Callback entry point of the raster driver: accumulates and routes a completed record to the
    /// registered consumer.
    #[allow(clippy::too_many_arguments)]
    pub fn on_spectrum_delivered(
        &self,
        row: usize,
        col: usize,
        height: usize,
        width: usize,
        detector_id: DetectorId,
        spectrum: Spectrum,
        fit_context: FitContext,
    ) -> Result<(), StreamError> {
        match self.deliver(row, col, height, width, detector_id, spectrum, fit_context) {
            Ok(Some(block)) => {
                debug!("Scan complete: {}", block);
                match &self.on_complete {
                    Some(callback) => callback(block),
                    None => debug!("No completion consumer registered, dropping record of detector {}", detector_id),
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                error!("Dropping stream record: {}", e);
                Err(e)
            }
        }
    }

    /// Number of records currently accumulating.
    pub fn residual(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn active_detectors(&self) -> Vec<DetectorId> {
        let mut ids: Vec<DetectorId> = self
            .shards
            .iter()
            .flat_map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).keys().copied().collect::<Vec<_>>())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Discards every record still accumulating and returns how many there were.
    ///
    /// A non-zero result means at least one scan never delivered its final tile.
    pub fn shutdown(&self) -> usize {
        let mut detectors = Vec::new();
        for shard in &self.shards {
            let mut table = shard.lock().unwrap_or_else(PoisonError::into_inner);
            detectors.extend(table.drain().map(|(id, block)| (id, block.tiles)));
        }
        if !detectors.is_empty() {
            detectors.sort_unstable();
            warn!(
                "Discarding {} incomplete stream record(s) at shutdown (detector, tiles): {:?}",
                detectors.len(),
                detectors
            );
        }
        detectors.len()
    }
}

impl Default for StreamAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StreamAccumulator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::data::element::{ElementEntry, ElementSpecification};
    use crate::fitting::parameters::{CalibratedModel, Calibration};

    fn context() -> FitContext {
        FitContext::new(
            Arc::new(CalibratedModel::from_calibration(Calibration::new(0.0, 1.0))),
            Arc::new(ElementSpecification::new(vec![ElementEntry::new("Fe", 2.0, 2000.0).unwrap()]).unwrap()),
        )
    }

    fn spectrum(value: f64, len: usize) -> Spectrum {
        Spectrum::new(vec![value; len])
    }

    fn collecting() -> (StreamAccumulator, Arc<Mutex<Vec<StreamBlock>>>) {
        let done = Arc::new(Mutex::new(Vec::new()));
        let sink = done.clone();
        let acc = StreamAccumulator::new().with_completion_callback(move |block| sink.lock().unwrap().push(block));
        (acc, done)
    }

    // raster bounds are the last row/col indices
    fn run_scan(acc: &StreamAccumulator, detector_id: DetectorId, rows: usize, cols: usize, value: f64) {
        for row in 0..rows {
            for col in 0..cols {
                acc.on_spectrum_delivered(row, col, rows - 1, cols - 1, detector_id, spectrum(value, 4), context())
                    .unwrap();
            }
        }
    }

    #[test]
    fn test_two_deliveries_merge() {
        let acc = StreamAccumulator::new();
        assert!(acc.deliver(0, 0, 0, 1, 1, Spectrum::new(vec![1.0, 1.0, 1.0]), context()).unwrap().is_none());
        assert_eq!(acc.residual(), 1);
        let block = acc.deliver(0, 1, 0, 1, 1, Spectrum::new(vec![2.0, 2.0, 2.0]), context()).unwrap().unwrap();
        assert_eq!(block.spectrum.counts(), &[3.0, 3.0, 3.0]);
        assert_eq!(block.tiles, 2);
        assert!(block.is_complete());
    }

    #[test]
    fn test_completes_exactly_once_at_final_tile() {
        let (acc, done) = collecting();
        for (row, col) in [(0, 0), (0, 1), (0, 2), (1, 0), (1, 1)] {
            acc.on_spectrum_delivered(row, col, 1, 2, 4, spectrum(1.0, 4), context()).unwrap();
            assert!(done.lock().unwrap().is_empty());
        }
        acc.on_spectrum_delivered(1, 2, 1, 2, 4, spectrum(1.0, 4), context()).unwrap();
        assert_eq!(done.lock().unwrap().len(), 1);
        assert_eq!(done.lock().unwrap()[0].spectrum.counts(), &[6.0; 4]);
        assert_eq!(acc.residual(), 0);

        // the next delivery opens a fresh record
        acc.on_spectrum_delivered(0, 0, 1, 2, 4, spectrum(1.0, 4), context()).unwrap();
        assert_eq!(acc.residual(), 1);
        acc.on_spectrum_delivered(1, 2, 1, 2, 4, spectrum(1.0, 4), context()).unwrap();
        let done = done.lock().unwrap();
        assert_eq!(done.len(), 2);
        assert_eq!(done[1].spectrum.counts(), &[2.0; 4]);
        assert_eq!(done[1].tiles, 2);
    }

    #[test]
    fn test_detectors_do_not_cross_talk() {
        let (acc, done) = collecting();
        for (row, col) in [(0, 0), (0, 1), (1, 0)] {
            acc.on_spectrum_delivered(row, col, 1, 1, 1, spectrum(1.0, 4), context()).unwrap();
            acc.on_spectrum_delivered(row, col, 1, 1, 2, spectrum(10.0, 4), context()).unwrap();
        }
        acc.on_spectrum_delivered(1, 1, 1, 1, 2, spectrum(10.0, 4), context()).unwrap();
        {
            let done = done.lock().unwrap();
            assert_eq!(done.len(), 1);
            assert_eq!(done[0].detector_id, 2);
            assert_eq!(done[0].spectrum.counts(), &[40.0; 4]);
        }
        assert_eq!(acc.active_detectors(), vec![1]);

        acc.on_spectrum_delivered(1, 1, 1, 1, 1, spectrum(1.0, 4), context()).unwrap();
        let done = done.lock().unwrap();
        assert_eq!(done[1].detector_id, 1);
        assert_eq!(done[1].spectrum.counts(), &[4.0; 4]);
    }

    #[test]
    fn test_length_mismatch_drops_record() {
        let acc = StreamAccumulator::new();
        acc.deliver(0, 0, 1, 1, 9, spectrum(1.0, 4), context()).unwrap();
        acc.deliver(0, 0, 1, 1, 3, spectrum(1.0, 4), context()).unwrap();
        let err = acc.deliver(0, 1, 1, 1, 9, spectrum(1.0, 5), context()).unwrap_err();
        assert_eq!(err, StreamError::SpectrumLengthMismatch { detector_id: 9, expected: 4, actual: 5 });
        assert_eq!(acc.active_detectors(), vec![3]);
    }

    #[test]
    fn test_geometry_change_drops_record() {
        let acc = StreamAccumulator::new();
        acc.deliver(0, 0, 1, 1, 2, spectrum(1.0, 4), context()).unwrap();
        let err = acc.deliver(0, 1, 3, 3, 2, spectrum(1.0, 4), context()).unwrap_err();
        assert_eq!(err, StreamError::GeometryMismatch { detector_id: 2, expected: (1, 1), actual: (3, 3) });
        assert_eq!(acc.residual(), 0);
    }

    #[test]
    fn test_final_tile_for_unseen_detector_is_rejected() {
        let (acc, done) = collecting();
        let err = acc.on_spectrum_delivered(1, 1, 1, 1, 5, spectrum(1.0, 4), context()).unwrap_err();
        assert_eq!(err, StreamError::UnexpectedFinalTile { detector_id: 5, row: 1, col: 1 });
        assert_eq!(acc.residual(), 0);
        assert!(done.lock().unwrap().is_empty());
    }

    #[test]
    fn test_callback_registered_after_construction() {
        let mut acc = StreamAccumulator::new();
        acc.deliver(0, 0, 0, 1, 3, spectrum(1.0, 4), context()).unwrap();

        let done = Arc::new(Mutex::new(Vec::new()));
        let sink = done.clone();
        acc.set_completion_callback(Box::new(move |block: StreamBlock| sink.lock().unwrap().push(block.detector_id)));
        acc.on_spectrum_delivered(0, 1, 0, 1, 3, spectrum(1.0, 4), context()).unwrap();

        assert_eq!(*done.lock().unwrap(), vec![3]);
    }

    #[test]
    fn test_completed_record_dropped_without_consumer() {
        let acc = StreamAccumulator::new();
        run_scan(&acc, 1, 2, 2, 1.0);
        assert_eq!(acc.residual(), 0);
    }

    #[test]
    fn test_shutdown_reports_residual() {
        let acc = StreamAccumulator::new();
        acc.deliver(0, 0, 4, 4, 1, spectrum(1.0, 4), context()).unwrap();
        acc.deliver(0, 0, 4, 4, 17, spectrum(1.0, 4), context()).unwrap();
        assert_eq!(acc.active_detectors(), vec![1, 17]);
        assert_eq!(acc.shutdown(), 2);
        assert_eq!(acc.residual(), 0);
        assert_eq!(acc.shutdown(), 0);
    }

    #[test]
    fn test_parallel_detectors() {
        let completed = Arc::new(AtomicUsize::new(0));
        let counter = completed.clone();
        let acc = StreamAccumulator::with_shards(4).with_completion_callback(move |block| {
            assert_eq!(block.spectrum.counts(), &[12.0; 4]);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::scope(|scope| {
            for detector_id in 0..8 {
                let acc = &acc;
                scope.spawn(move || run_scan(acc, detector_id, 3, 4, 1.0));
            }
        });

        assert_eq!(completed.load(Ordering::SeqCst), 8);
        assert_eq!(acc.residual(), 0);
    }
}
