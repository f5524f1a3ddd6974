//! Downstream consumer seam.
//!
//! A sort engine's worker hands every merged element to one
//! [`StreamConsumer`] on the worker's own thread; implementations must not
//! block indefinitely and must be internally thread-safe if shared. A
//! consumer error is fatal to the engine that called it.

use crossbeam_channel::Sender;
use thiserror::Error;

use crate::buffer::{eos_sentinel, BufferError};

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("downstream channel closed")]
    Closed,
    #[error("malformed record: {0}")]
    Malformed(#[from] BufferError),
    #[error("{0}")]
    Other(String),
}

/// Receives the globally ordered output of one sort engine.
pub trait StreamConsumer: Send {
    fn consume(&mut self, bytes: Vec<u8>) -> Result<(), ConsumerError>;
    /// Called exactly once, after every channel's sentinel has been merged.
    fn end_of_stream(&mut self, mbid: u64) -> Result<(), ConsumerError>;
}

/// Forwards the merged stream into a crossbeam channel; end-of-stream is
/// delivered as the standard 32-byte sentinel so the receiving stage sees
/// one uniform byte stream.
pub struct ChannelConsumer {
    tx: Sender<Vec<u8>>,
}

impl ChannelConsumer {
    pub fn new(tx: Sender<Vec<u8>>) -> Self {
        Self { tx }
    }
}

impl StreamConsumer for ChannelConsumer {
    fn consume(&mut self, bytes: Vec<u8>) -> Result<(), ConsumerError> {
        self.tx.send(bytes).map_err(|_| ConsumerError::Closed)
    }

    fn end_of_stream(&mut self, mbid: u64) -> Result<(), ConsumerError> {
        self.tx.send(eos_sentinel(mbid)).map_err(|_| ConsumerError::Closed)
    }
}

/// Discards everything. Used when a stream kind has no downstream stage
/// wired (e.g. monitoring during a local replay).
pub struct NullConsumer;

impl StreamConsumer for NullConsumer {
    fn consume(&mut self, _bytes: Vec<u8>) -> Result<(), ConsumerError> {
        Ok(())
    }

    fn end_of_stream(&mut self, _mbid: u64) -> Result<(), ConsumerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::DaqBuffer;

    #[test]
    fn test_channel_consumer_forwards_and_seals() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut c = ChannelConsumer::new(tx);
        c.consume(vec![1, 2, 3]).unwrap();
        c.end_of_stream(42).unwrap();
        assert_eq!(rx.recv().unwrap(), vec![1, 2, 3]);
        let eos = DaqBuffer::parse(rx.recv().unwrap()).unwrap();
        assert!(eos.is_eos());
        assert_eq!(eos.mbid(), 42);
    }

    #[test]
    fn test_channel_consumer_reports_closed() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        drop(rx);
        let mut c = ChannelConsumer::new(tx);
        assert!(matches!(c.consume(vec![0]), Err(ConsumerError::Closed)));
    }
}
