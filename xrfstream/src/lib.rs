// src/lib.rs
pub mod config;
pub mod serializer;
pub mod transport;
pub mod publisher;
pub mod source;

// Re-export commonly used types
pub use config::StreamerConfig;
pub use publisher::{PayloadMode, PublishSink, PublisherHandle, SpectraNetStreamer};
pub use serializer::{decode_counts, CountsPayload, PayloadFormat};
pub use transport::{Transport, ZmqTransport};
