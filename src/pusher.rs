//! # Push-Based Event Source
//!
//! The applier consumes a lazy sequence of [`BatchOrError`] values. When the
//! upstream is push-based (a subscription, a test driving batches by hand),
//! [`push_source`] bridges the two worlds: the producer pushes batches into
//! a bounded channel, the consumer hands the iterator half to
//! `Applier::follow`.
//!
//! Dropping (or [`PushSource::close`]-ing) the producer ends the sequence,
//! which `follow` treats as a clean end of stream.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

use crate::error::{Error, Result};
use crate::types::{BatchOrError, BlockBatch, SourceError};

/// Producer half: pushes batches (or a terminal error) into the sequence.
pub struct PushSource {
    tx: SyncSender<BatchOrError>,
}

/// Consumer half: an iterator of [`BatchOrError`] for `Applier::follow`.
pub struct BatchIter {
    rx: Receiver<BatchOrError>,
}

/// Creates a bounded push source with room for `capacity` in-flight batches.
/// `push` blocks while the channel is full, which backpressures the
/// producer onto the applier's commit rate.
pub fn push_source(capacity: usize) -> (PushSource, BatchIter) {
    let (tx, rx) = sync_channel(capacity);
    (PushSource { tx }, BatchIter { rx })
}

impl PushSource {
    /// Enqueues a batch. Fails with [`Error::Cancelled`] if the consumer is
    /// gone.
    pub fn push(&self, batch: BlockBatch) -> Result<()> {
        self.tx.send(Ok(batch)).map_err(|_| Error::Cancelled)
    }

    /// Enqueues an upstream failure. The applier surfaces it and stops.
    pub fn fail(&self, err: SourceError) -> Result<()> {
        self.tx.send(Err(err)).map_err(|_| Error::Cancelled)
    }

    /// Ends the sequence. Dropping the source has the same effect.
    pub fn close(self) {}
}

impl Iterator for BatchIter {
    type Item = BatchOrError;

    fn next(&mut self) -> Option<BatchOrError> {
        self.rx.recv().ok()
    }
}
