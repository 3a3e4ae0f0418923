//! Pub/sub transport for finished records.
//!
//! `ZmqTransport` owns a bound ZeroMQ PUB socket for the lifetime of the publisher. The socket is
//! opened once and closed when the transport is dropped.

use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("ZMQ socket error: {0}")]
    Socket(#[from] zmq::Error),
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: zmq::Error,
    },
    #[error("send failed: {0}")]
    Send(String),
}

/// A topic addressed, fire-and-forget message sink.
///
/// `send` delivers the topic and the payload as one logical message.
pub trait Transport: Send {
    fn send(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    fn endpoint(&self) -> &str;
}

/// ZeroMQ PUB socket bound to a single endpoint.
pub struct ZmqTransport {
    // declared before the context so it is closed first
    socket: zmq::Socket,
    _context: zmq::Context,
    endpoint: String,
}

impl ZmqTransport {
    /// Binds a PUB socket at `endpoint`, e.g. `tcp://*:43434`.
    ///
    /// `linger_ms` bounds how long pending messages may delay closing the socket, `send_hwm` is the
    /// number of queued messages after which ZeroMQ drops instead of queuing.
    pub fn bind(endpoint: &str, linger_ms: i32, send_hwm: i32) -> Result<Self, TransportError> {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::PUB)?;
        socket.set_linger(linger_ms)?;
        socket.set_sndhwm(send_hwm)?;
        socket.bind(endpoint).map_err(|source| TransportError::Bind { endpoint: endpoint.to_string(), source })?;

        // resolves wildcard ports
        let endpoint = match socket.get_last_endpoint()? {
            Ok(resolved) => resolved,
            Err(_) => endpoint.to_string(),
        };
        info!("Publishing on {}", endpoint);

        Ok(ZmqTransport { socket, _context: context, endpoint })
    }
}

impl Transport for ZmqTransport {
    fn send(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.socket
            .send(topic.as_bytes(), zmq::SNDMORE | zmq::DONTWAIT)
            .map_err(|e| TransportError::Send(format!("topic frame: {e}")))?;
        self.socket
            .send(payload, zmq::DONTWAIT)
            .map_err(|e| TransportError::Send(format!("payload frame: {e}")))?;
        Ok(())
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Drop for ZmqTransport {
    fn drop(&mut self) {
        info!("Closing publisher socket {}", self.endpoint);
    }
}
