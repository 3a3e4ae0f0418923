//! Publishing of finished stream records.
//!
//! `SpectraNetStreamer` fits a finished record and sends its counts on the pub/sub transport.
//! `PublisherHandle` runs a streamer on a dedicated thread behind a bounded queue, so the
//! accumulator never waits on the network.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use xrfcore::fitting::parameters::FitError;
use xrfcore::stream::block::{DetectorId, StreamBlock};

use crate::config::{ConfigError, StreamerConfig};
use crate::serializer::{CountsSerializer, SerializeError};
use crate::transport::{Transport, TransportError};

/// What a published message carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadMode {
    Counts,
    /// Integrated spectrum per record; no encoder exists yet.
    Spectra,
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("payload mode {0:?} has no encoder")]
    UnsupportedMode(PayloadMode),
    #[error("fit of detector {detector_id} failed: {source}")]
    Fit {
        detector_id: DetectorId,
        #[source]
        source: FitError,
    },
    #[error(transparent)]
    Serialize(#[from] SerializeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to start publisher thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub published: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl fmt::Display for PublishStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "published: {}, failed: {}, dropped: {}", self.published, self.failed, self.dropped)
    }
}

/// Sends the counts of finished records on a topic of the pub/sub transport.
///
/// Without a transport every `publish` is a no-op that just consumes the record.
pub struct SpectraNetStreamer {
    transport: Option<Box<dyn Transport>>,
    serializer: CountsSerializer,
    mode: PayloadMode,
    topic: String,
    published: AtomicU64,
    failed: AtomicU64,
}

impl SpectraNetStreamer {
    pub fn new(transport: Option<Box<dyn Transport>>, config: &StreamerConfig) -> Result<Self, PublishError> {
        config.validate()?;
        Ok(SpectraNetStreamer {
            transport,
            serializer: CountsSerializer::new(config.format),
            mode: config.payload_mode()?,
            topic: config.topic.clone(),
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    pub fn is_bound(&self) -> bool {
        self.transport.is_some()
    }

    /// Publishes one finished record, at most once.
    ///
    /// Failures are logged and returned but never retried; the record is consumed either way.
    pub fn publish(&self, block: StreamBlock) -> Result<(), PublishError> {
        let Some(transport) = &self.transport else {
            debug!("No transport bound, discarding record of detector {}", block.detector_id);
            return Ok(());
        };

        let result = self.encode(&block).and_then(|payload| Ok(transport.send(&self.topic, &payload)?));
        match &result {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                debug!("Published counts of detector {} on {}", block.detector_id, self.topic);
            }
            Err(PublishError::UnsupportedMode(mode)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!("Refusing to publish detector {}: payload mode {:?} has no encoder", block.detector_id, mode);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Error sending record of detector {}: {}", block.detector_id, e);
            }
        }
        result
    }

    fn encode(&self, block: &StreamBlock) -> Result<Vec<u8>, PublishError> {
        match self.mode {
            PayloadMode::Counts => {
                let counts = block
                    .fit()
                    .map_err(|source| PublishError::Fit { detector_id: block.detector_id, source })?;
                Ok(self.serializer.encode_counts(block, counts)?)
            }
            PayloadMode::Spectra => Err(PublishError::UnsupportedMode(PayloadMode::Spectra)),
        }
    }

    pub fn stats(&self) -> PublishStats {
        PublishStats {
            published: self.published.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: 0,
        }
    }
}

enum Message {
    Record(StreamBlock),
    Shutdown,
}

// how long a dropped handle waits to queue the stop message
const DROP_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(100);

/// Producer side of the publisher queue; cheap to clone into completion callbacks.
#[derive(Clone)]
pub struct PublishSink {
    sender: Sender<Message>,
    dropped: Arc<AtomicU64>,
    /// Set by the worker once it stops taking records.
    closed: Arc<RwLock<bool>>,
}

impl PublishSink {
    /// Queues a finished record without blocking. Returns `false` if the record was dropped
    /// because the queue is full or the sender thread is gone.
    ///
    /// Every record is either published by the worker or counted as dropped.
    pub fn submit(&self, block: StreamBlock) -> bool {
        // held across the send so the worker cannot close and drain in between
        let closed = self.closed.read().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Publisher has shut down, dropping record of detector {}", block.detector_id);
            return false;
        }
        match self.sender.try_send(Message::Record(block)) {
            Ok(()) => true,
            Err(TrySendError::Full(Message::Record(block))) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Publisher queue full, dropping record of detector {}", block.detector_id);
                false
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Publisher has shut down, dropping record");
                false
            }
        }
    }
}

/// A `SpectraNetStreamer` running on its own thread behind a bounded queue.
pub struct PublisherHandle {
    sink: PublishSink,
    done: Receiver<PublishStats>,
    worker: Option<JoinHandle<()>>,
}

impl PublisherHandle {
    pub fn spawn(streamer: SpectraNetStreamer, capacity: usize) -> Result<Self, PublishError> {
        let (sender, receiver) = bounded::<Message>(capacity.max(1));
        let (done_tx, done) = bounded::<PublishStats>(1);
        let dropped = Arc::new(AtomicU64::new(0));
        let closed = Arc::new(RwLock::new(false));

        let worker_dropped = dropped.clone();
        let worker_closed = closed.clone();
        let worker = std::thread::Builder::new().name("xrf-publisher".to_string()).spawn(move || {
            info!("Publisher worker started");
            while let Ok(message) = receiver.recv() {
                match message {
                    // errors are logged by publish
                    Message::Record(block) => {
                        let _ = streamer.publish(block);
                    }
                    Message::Shutdown => break,
                }
            }

            // records queued behind the stop message are not published
            *worker_closed.write().unwrap_or_else(PoisonError::into_inner) = true;
            let mut leftover = 0;
            for message in receiver.try_iter() {
                if let Message::Record(block) = message {
                    warn!("Publisher stopping, dropping record of detector {}", block.detector_id);
                    leftover += 1;
                }
            }
            worker_dropped.fetch_add(leftover, Ordering::Relaxed);

            let stats = streamer.stats();
            // closes the transport
            drop(streamer);
            info!("Publisher worker shutting down ({})", stats);
            let _ = done_tx.send(stats);
        })?;

        Ok(PublisherHandle {
            sink: PublishSink { sender, dropped, closed },
            done,
            worker: Some(worker),
        })
    }

    pub fn sink(&self) -> PublishSink {
        self.sink.clone()
    }

    pub fn submit(&self, block: StreamBlock) -> bool {
        self.sink.submit(block)
    }

    /// Number of records waiting in the queue.
    pub fn pending(&self) -> usize {
        self.sink.sender.len()
    }

    /// Publishes everything already queued, then stops the worker.
    ///
    /// Waits at most `timeout`; if the worker has not finished by then it is abandoned along with
    /// the records still queued, and `None` is returned.
    pub fn shutdown(mut self, timeout: Duration) -> Option<PublishStats> {
        let deadline = Instant::now() + timeout;

        if self.sink.sender.send_deadline(Message::Shutdown, deadline).is_err() {
            warn!("Could not queue publisher shutdown within {:?}", timeout);
        }

        match self.done.recv_deadline(deadline) {
            Ok(mut stats) => {
                if let Some(worker) = self.worker.take() {
                    if let Err(e) = worker.join() {
                        warn!("Publisher worker panicked: {:?}", e);
                    }
                }
                stats.dropped = self.sink.dropped.load(Ordering::Relaxed);
                Some(stats)
            }
            Err(_) => {
                warn!(
                    "Publisher did not finish within {:?}, abandoning {} queued record(s)",
                    timeout,
                    self.pending()
                );
                // detach
                self.worker.take();
                None
            }
        }
    }
}

impl Drop for PublisherHandle {
    fn drop(&mut self) {
        // dropped without shutdown; outstanding sinks would keep the worker alive
        if self.worker.take().is_some()
            && self.sink.sender.send_timeout(Message::Shutdown, DROP_SHUTDOWN_TIMEOUT).is_err()
        {
            warn!("Could not stop publisher worker of a dropped handle");
        }
    }
}
