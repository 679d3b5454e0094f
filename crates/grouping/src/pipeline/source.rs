//! Upstream record sources.

use crate::Record;
use crossbeam::channel::Receiver;
use std::{convert::Infallible, error::Error as StdError};

/// A pull-based source of records.
pub trait RecordSource: Send {
    type Error: StdError + Send + Sync + 'static;

    /// Returns the next record, or `None` once the source is exhausted.
    fn next(&mut self) -> Result<Option<Record>, Self::Error>;

    /// Names of the fields produced by this source, if known in advance.
    fn schema(&self) -> Option<&[String]> {
        None
    }

    /// Rewinds the source to its first record.  Returns `false` if the
    /// source cannot be replayed.
    fn reset(&mut self) -> bool {
        false
    }
}

impl<S> RecordSource for Box<S>
where
    S: RecordSource + ?Sized,
{
    type Error = S::Error;

    fn next(&mut self) -> Result<Option<Record>, Self::Error> {
        (**self).next()
    }

    fn schema(&self) -> Option<&[String]> {
        (**self).schema()
    }

    fn reset(&mut self) -> bool {
        (**self).reset()
    }
}

/// A replayable in-memory source.
#[derive(Clone, Debug, Default)]
pub struct VecSource {
    records: Vec<Record>,
    position: usize,
    schema: Option<Vec<String>>,
}

impl VecSource {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            position: 0,
            schema: None,
        }
    }

    /// Declares the fields produced by this source.
    pub fn with_schema<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.schema = Some(fields.into_iter().map(Into::into).collect());
        self
    }
}

impl FromIterator<Record> for VecSource {
    fn from_iter<T: IntoIterator<Item = Record>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl RecordSource for VecSource {
    type Error = Infallible;

    fn next(&mut self) -> Result<Option<Record>, Self::Error> {
        let record = self.records.get(self.position).cloned();
        if record.is_some() {
            self.position += 1;
        }
        Ok(record)
    }

    fn schema(&self) -> Option<&[String]> {
        self.schema.as_deref()
    }

    fn reset(&mut self) -> bool {
        self.position = 0;
        true
    }
}

/// Pulls records from a channel shared with other consumers.
///
/// Several replicas holding clones of the same receiver split the stream
/// between them: each record is consumed by exactly one replica.  The
/// source is exhausted once all senders are dropped and the channel is
/// empty.
#[derive(Clone, Debug)]
pub struct ChannelSource {
    receiver: Receiver<Record>,
}

impl ChannelSource {
    pub fn new(receiver: Receiver<Record>) -> Self {
        Self { receiver }
    }
}

impl RecordSource for ChannelSource {
    type Error = Infallible;

    fn next(&mut self) -> Result<Option<Record>, Self::Error> {
        Ok(self.receiver.recv().ok())
    }
}
