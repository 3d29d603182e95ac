use std::any::Any;
use std::fmt;
use std::io::{self, Read};

use futures::channel::oneshot;

use crate::types::{DataSource, Priority, TypeTag};

/// A fetched, not yet decoded value, such as [`Bytes`](bytes::Bytes) or a [`ByteStream`].
pub struct Data {
    value: Box<dyn Any + Send>,
    tag: TypeTag,
}

impl Data {
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self {
            value: Box::new(value),
            tag: TypeTag::of::<T>(),
        }
    }

    /// The runtime type of the value.
    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.value.downcast_mut()
    }

    pub fn downcast<T: Any>(self) -> Result<T, Self> {
        let tag = self.tag;
        self.value
            .downcast()
            .map(|value| *value)
            .map_err(|value| Self { value, tag })
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Data").field("tag", &self.tag).finish()
    }
}

/// A stream of encoded bytes that can be rewound to its start.
///
/// Everything read from the underlying reader is buffered, so rewinding never touches the
/// source again.
pub struct ByteStream {
    inner: Box<dyn Read + Send>,
    buffer: Vec<u8>,
    position: usize,
}

impl ByteStream {
    pub fn new(reader: impl Read + Send + 'static) -> Self {
        Self {
            inner: Box::new(reader),
            buffer: Vec::new(),
            position: 0,
        }
    }

    /// Moves back to the first byte of the stream.
    pub fn rewind(&mut self) {
        self.position = 0;
    }
}

impl Read for ByteStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position < self.buffer.len() {
            let buffered = &self.buffer[self.position..];
            let n = buffered.len().min(buf.len());
            buf[..n].copy_from_slice(&buffered[..n]);
            self.position += n;
            return Ok(n);
        }

        let n = self.inner.read(buf)?;
        self.buffer.extend_from_slice(&buf[..n]);
        self.position += n;
        Ok(n)
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStream")
            .field("buffered", &self.buffer.len())
            .field("position", &self.position)
            .finish()
    }
}

/// Resets a piece of [`Data`] so it can be read again by the next decoder.
pub trait DataRewinder: Send + Sync {
    fn rewind(&self, data: &mut Data) -> anyhow::Result<()>;
}

/// Used for data that is not consumed by reading it, such as [`Bytes`](bytes::Bytes).
#[derive(Debug, Default)]
pub struct NoopRewinder;

impl DataRewinder for NoopRewinder {
    fn rewind(&self, _data: &mut Data) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ByteStreamRewinder;

impl DataRewinder for ByteStreamRewinder {
    fn rewind(&self, data: &mut Data) -> anyhow::Result<()> {
        let tag = data.tag();
        let stream = data
            .downcast_mut::<ByteStream>()
            .ok_or_else(|| anyhow::anyhow!("expected a byte stream, got {tag}"))?;
        stream.rewind();
        Ok(())
    }
}

/// The result of a [`DataFetcher`].
pub type FetchResult = anyhow::Result<Data>;

/// Receives the outcome of a [`DataFetcher::load_data`] call.
///
/// Both methods consume the callback, so it resolves at most once.
pub struct DataCallback {
    sender: oneshot::Sender<FetchResult>,
}

impl DataCallback {
    pub fn channel() -> (Self, oneshot::Receiver<FetchResult>) {
        let (sender, receiver) = oneshot::channel();
        (Self { sender }, receiver)
    }

    pub fn on_data_ready(self, data: Data) {
        // The receiver is gone if the load was cancelled.
        let _ = self.sender.send(Ok(data));
    }

    pub fn on_load_failed(self, error: anyhow::Error) {
        let _ = self.sender.send(Err(error));
    }
}

/// Fetches the data of a single model, possibly asynchronously.
pub trait DataFetcher: Send + Sync {
    /// Starts loading, and resolves `callback` once done.
    ///
    /// The callback may be resolved inline, or later from any thread.
    fn load_data(&self, priority: Priority, callback: DataCallback);

    /// Releases resources held by the fetcher. Called once the data is no longer needed.
    fn cleanup(&self) {}

    /// Aborts an in-progress load. A best-effort signal, the callback may still be resolved.
    fn cancel(&self) {}

    /// The type of [`Data`] produced by this fetcher.
    fn data_tag(&self) -> TypeTag;

    fn data_source(&self) -> DataSource;
}
