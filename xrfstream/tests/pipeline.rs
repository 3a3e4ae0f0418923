use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use xrfcore::data::element::{ElementEntry, ElementSpecification};
use xrfcore::data::spectrum::Spectrum;
use xrfcore::fitting::parameters::{CalibratedModel, Calibration};
use xrfcore::fitting::roi::{extract, RoiBounds, RoiFitRoutine};
use xrfcore::stream::accumulator::StreamAccumulator;
use xrfcore::stream::block::{FitContext, StreamBlock};
use xrfstream::config::StreamerConfig;
use xrfstream::publisher::{PublishStats, PublisherHandle, SpectraNetStreamer};
use xrfstream::serializer::{decode_counts, PayloadFormat};
use xrfstream::transport::{Transport, TransportError, ZmqTransport};

type Sent = Arc<Mutex<Vec<Vec<u8>>>>;

/// Fails every send whose attempt index is odd.
struct FlakyTransport {
    sent: Sent,
    attempts: AtomicU64,
}

impl Transport for FlakyTransport {
    fn send(&self, _topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
            return Err(TransportError::Send("connection reset".to_string()));
        }
        self.sent.lock().unwrap().push(payload.to_vec());
        Ok(())
    }

    fn endpoint(&self) -> &str {
        "inproc://flaky"
    }
}

fn unit_context() -> FitContext {
    // [1.5, 3.5] keV on 1 keV per channel -> channels 1..=3
    FitContext::new(
        Arc::new(CalibratedModel::from_calibration(Calibration::new(0.0, 1.0))),
        Arc::new(ElementSpecification::new(vec![ElementEntry::new("Fe", 2.5, 2000.0).unwrap()]).unwrap()),
    )
}

#[test]
fn two_by_two_raster_end_to_end() {
    let done = Arc::new(Mutex::new(Vec::<StreamBlock>::new()));
    let sink = done.clone();
    let acc = StreamAccumulator::new().with_completion_callback(move |block| sink.lock().unwrap().push(block));

    // 2 x 2 raster, bounds reported as the last row/col index
    let tiles = [(0, 0), (0, 1), (1, 0), (1, 1)];
    for (i, (row, col)) in tiles.iter().enumerate() {
        acc.on_spectrum_delivered(*row, *col, 1, 1, 0, Spectrum::new(vec![5.0; 5]), unit_context()).unwrap();
        assert_eq!(done.lock().unwrap().len(), if i < 3 { 0 } else { 1 });
    }

    let done = done.lock().unwrap();
    let block = &done[0];
    assert_eq!(block.spectrum.counts(), &[20.0; 5]);
    assert_eq!(block.tiles, 4);

    let context = unit_context();
    let bounds = RoiFitRoutine.roi_bounds(context.model.as_ref(), block.spectrum.len(), &context.elements).unwrap();
    assert_eq!(bounds["Fe"], RoiBounds { left: 1, right: 3 });
    let counts = extract(context.model.as_ref(), &block.spectrum, &context.elements).unwrap();
    assert_eq!(counts["Fe"], 60.0);
}

#[test]
fn publish_failure_does_not_block_later_records() {
    let sent = Sent::default();
    let transport = FlakyTransport { sent: sent.clone(), attempts: AtomicU64::new(0) };
    let streamer = SpectraNetStreamer::new(Some(Box::new(transport)), &StreamerConfig::default()).unwrap();
    let publisher = PublisherHandle::spawn(streamer, 32).unwrap();

    let sink = publisher.sink();
    let acc = StreamAccumulator::new().with_completion_callback(move |block| {
        assert!(sink.submit(block));
    });

    for detector_id in 0..4 {
        for (row, col) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
            acc.on_spectrum_delivered(row, col, 1, 1, detector_id, Spectrum::new(vec![5.0; 5]), unit_context())
                .unwrap();
        }
    }
    drop(acc);

    let stats = publisher.shutdown(Duration::from_secs(5)).unwrap();
    assert_eq!(stats, PublishStats { published: 2, failed: 2, dropped: 0 });

    let sent = sent.lock().unwrap();
    let detectors: Vec<u32> = sent
        .iter()
        .map(|bytes| decode_counts(bytes, PayloadFormat::Bincode).unwrap())
        .inspect(|payload| assert_eq!(payload.counts["Fe"], 60.0))
        .map(|payload| payload.detector_id)
        .collect();
    assert_eq!(detectors, vec![0, 2]);
}

#[test]
fn counts_reach_a_zmq_subscriber() {
    let transport = ZmqTransport::bind("tcp://127.0.0.1:*", 0, 1000).unwrap();
    let endpoint = transport.endpoint().to_string();
    let config = StreamerConfig { format: PayloadFormat::Json, ..Default::default() };
    let publisher = PublisherHandle::spawn(SpectraNetStreamer::new(Some(Box::new(transport)), &config).unwrap(), 8).unwrap();

    let ctx = zmq::Context::new();
    let sub = ctx.socket(zmq::SUB).unwrap();
    sub.connect(&endpoint).unwrap();
    sub.set_subscribe(b"XRF-Counts").unwrap();
    sub.set_rcvtimeo(2000).unwrap();
    // slow joiner
    std::thread::sleep(Duration::from_millis(200));

    let acc = StreamAccumulator::new();
    acc.deliver(0, 0, 0, 1, 6, Spectrum::new(vec![1.0; 5]), unit_context()).unwrap();
    let block = acc.deliver(0, 1, 0, 1, 6, Spectrum::new(vec![2.0; 5]), unit_context()).unwrap().unwrap();
    assert!(publisher.submit(block));

    let frames = sub.recv_multipart(0).unwrap();
    assert_eq!(frames[0], b"XRF-Counts".to_vec());
    let payload = decode_counts(&frames[1], PayloadFormat::Json).unwrap();
    assert_eq!(payload.detector_id, 6);
    assert_eq!(payload.counts["Fe"], 9.0);

    assert!(publisher.shutdown(Duration::from_secs(5)).is_some());
}
