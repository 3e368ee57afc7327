//! Queue snapshots and the sinks they are written to.
//!
//! A snapshot image is one format-version byte followed by the bincode
//! encoding of the ordered message sequence. Nothing outside the image is
//! needed to decode it.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::fsm::FsmSnapshot;
use crate::message::Message;
use crate::queue::Queue;

const IMAGE_VERSION: u8 = 1;

/// Destination for a snapshot image.
///
/// Whoever persists into a sink finishes it with exactly one of [`close`]
/// (image is complete) or [`cancel`] (image must be discarded).
///
/// [`close`]: SnapshotSink::close
/// [`cancel`]: SnapshotSink::cancel
pub trait SnapshotSink: Write + Send {
    fn id(&self) -> &str;
    fn cancel(&mut self) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Open,
    Closed,
    Cancelled,
}

/// In-memory sink. The bytes are only handed out once the sink is closed.
#[derive(Debug)]
pub struct BufferSink {
    id: String,
    buf: Vec<u8>,
    state: SinkState,
}

impl BufferSink {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            buf: Vec::new(),
            state: SinkState::Open,
        }
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    /// The finished image, or `None` if the sink was not closed.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        (self.state == SinkState::Closed).then_some(self.buf)
    }

    fn finish(&mut self, next: SinkState) -> io::Result<()> {
        if self.state != SinkState::Open {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("snapshot sink {} already finished", self.id),
            ));
        }
        self.state = next;
        if next == SinkState::Cancelled {
            self.buf.clear();
        }
        Ok(())
    }
}

impl Write for BufferSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.state != SinkState::Open {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("snapshot sink {} is not writable", self.id),
            ));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SnapshotSink for BufferSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn cancel(&mut self) -> io::Result<()> {
        self.finish(SinkState::Cancelled)
    }

    fn close(&mut self) -> io::Result<()> {
        self.finish(SinkState::Closed)
    }
}

/// Point-in-time copy of a queue, owned by the snapshot until released.
pub struct QueueSnapshot<T> {
    queue: Queue<T>,
    released: bool,
}

impl<T> QueueSnapshot<T> {
    pub fn new(queue: Queue<T>) -> Self {
        Self {
            queue,
            released: false,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T: Serialize> QueueSnapshot<T> {
    /// Writes the image to `sink`, then closes it; on any failure the sink is
    /// cancelled instead and the failure returned.
    pub fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<()> {
        if let Err(err) = encode_image(&self.queue, &mut *sink) {
            if let Err(cancel_err) = sink.cancel() {
                tracing::warn!(sink = sink.id(), error = %cancel_err, "failed to cancel snapshot sink");
            }
            return Err(err);
        }
        sink.close().map_err(Error::SnapshotIo)
    }
}

impl<T> QueueSnapshot<T> {
    /// Nothing external is held, so this only marks the snapshot spent.
    pub fn release(&mut self) {
        self.released = true;
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl<T: Serialize + Send + Sync + 'static> FsmSnapshot for QueueSnapshot<T> {
    fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<()> {
        QueueSnapshot::persist(self, sink)
    }

    fn release(&mut self) {
        QueueSnapshot::release(self)
    }
}

/// Writes the versioned image of `queue` to `writer`.
pub fn encode_image<T: Serialize, W: Write>(queue: &Queue<T>, mut writer: W) -> Result<()> {
    writer.write_all(&[IMAGE_VERSION]).map_err(Error::SnapshotIo)?;
    queue
        .with_messages(|messages| bincode::serialize_into(&mut writer, messages))
        .map_err(|err| match *err {
            bincode::ErrorKind::Io(io) => Error::SnapshotIo(io),
            other => Error::Serialization(Box::new(other)),
        })?;
    writer.flush().map_err(Error::SnapshotIo)
}

/// Reads a queue back from an image written by [`encode_image`].
pub fn decode_image<T: DeserializeOwned, R: Read>(mut reader: R) -> Result<Queue<T>> {
    let mut version = [0u8; 1];
    reader
        .read_exact(&mut version)
        .map_err(|err| Error::decode(format!("missing snapshot header: {err}")))?;
    if version[0] != IMAGE_VERSION {
        return Err(Error::Decode(format!(
            "unsupported snapshot version {}",
            version[0]
        )));
    }
    let messages: VecDeque<Message<T>> =
        bincode::deserialize_from(reader).map_err(Error::decode)?;
    Ok(messages.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Comment;

    /// Sink that fails every write and records how it was finished.
    struct BrokenSink {
        cancelled: usize,
        closed: usize,
    }

    impl Write for BrokenSink {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "disk gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SnapshotSink for BrokenSink {
        fn id(&self) -> &str {
            "broken"
        }

        fn cancel(&mut self) -> io::Result<()> {
            self.cancelled += 1;
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            self.closed += 1;
            Ok(())
        }
    }

    fn sample_queue() -> Queue<Comment> {
        [
            Comment::new("Alice", "Hello, World!"),
            Comment::new("Bob", "second"),
            Comment::new("Carol", "third"),
        ]
        .into_iter()
        .map(Message::new)
        .collect()
    }

    #[test]
    fn persist_closes_the_sink_and_restores_in_order() {
        let snapshot = QueueSnapshot::new(sample_queue());
        let mut sink = BufferSink::new("1-10");
        snapshot.persist(&mut sink).unwrap();
        assert_eq!(sink.state(), SinkState::Closed);

        let bytes = sink.into_bytes().unwrap();
        let restored: Queue<Comment> = decode_image(bytes.as_slice()).unwrap();
        assert_eq!(restored.messages(), sample_queue().messages());
    }

    #[test]
    fn failed_write_cancels_and_never_closes() {
        let snapshot = QueueSnapshot::new(sample_queue());
        let mut sink = BrokenSink {
            cancelled: 0,
            closed: 0,
        };
        let err = snapshot.persist(&mut sink).unwrap_err();
        assert!(matches!(err, Error::SnapshotIo(_)));
        assert_eq!((sink.cancelled, sink.closed), (1, 0));
    }

    #[test]
    fn cancelled_sink_yields_no_image() {
        let mut sink = BufferSink::new("x");
        sink.write_all(b"partial").unwrap();
        sink.cancel().unwrap();
        assert!(sink.close().is_err());
        assert!(sink.into_bytes().is_none());
    }

    #[test]
    fn release_is_safe_without_persisting() {
        let mut snapshot = QueueSnapshot::new(Queue::<Comment>::new());
        snapshot.release();
        assert!(snapshot.is_released());
        snapshot.release();
    }

    #[test]
    fn decode_rejects_unknown_version_and_truncation() {
        let err = decode_image::<Comment, _>(&[9u8, 0, 0][..]).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));

        let mut sink = BufferSink::new("t");
        QueueSnapshot::new(sample_queue()).persist(&mut sink).unwrap();
        let bytes = sink.into_bytes().unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(matches!(decode_image::<Comment, _>(truncated), Err(Error::Decode(_))));

        assert!(matches!(decode_image::<Comment, _>(&[0u8; 0][..]), Err(Error::Decode(_))));
    }
}
