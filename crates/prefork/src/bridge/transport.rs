//! Socket transport for parent-worker IPC.
//!
//! Every permanent unit owns one Unix stream socket pair for job dispatch. The pool
//! owns a second, pool-wide pair as the result channel: the parent keeps the read
//! end and every permanent worker inherits the write end across fork.
//!
//! Both ends start life as blocking `std` sockets so they survive fork untouched;
//! each side converts its own end to a tokio stream inside its own runtime.

use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::Encoder;

use super::codec::CompletionCodec;
use super::protocol::CompletionRecord;

/// Parent-side job channel of a unit. Boxed so tests can substitute in-memory pipes.
pub type JobChannel = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// Parent-side read half of the result channel.
pub type ResultStream = Box<dyn AsyncRead + Send + Unpin>;

/// Create the `(parent, child)` socket pair for one unit.
pub fn unit_socket_pair() -> io::Result<(StdUnixStream, StdUnixStream)> {
    let (parent, child) = StdUnixStream::pair()?;
    tracing::trace!(
        parent_fd = parent.as_raw_fd(),
        child_fd = child.as_raw_fd(),
        "Created unit socket pair"
    );
    Ok((parent, child))
}

/// Register a std socket with the current tokio runtime.
pub fn into_async(stream: StdUnixStream) -> io::Result<UnixStream> {
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}

/// Pool-wide result channel.
pub struct ResultChannel {
    reader: StdUnixStream,
    writer: ResultWriter,
}

impl ResultChannel {
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = StdUnixStream::pair()?;
        tracing::debug!(
            reader_fd = reader.as_raw_fd(),
            writer_fd = writer.as_raw_fd(),
            "Created result channel"
        );
        Ok(Self {
            reader,
            writer: ResultWriter::new(writer),
        })
    }

    /// Write end handed to the spawner, inherited by every permanent worker.
    pub fn writer(&self) -> ResultWriter {
        self.writer.clone()
    }

    /// Convert the read end for the parent's event loop.
    pub fn into_reader(self) -> io::Result<ResultStream> {
        Ok(Box::new(into_async(self.reader)?))
    }
}

/// Where a worker reports finished jobs.
pub trait CompletionSink {
    fn send(&mut self, record: CompletionRecord) -> io::Result<()>;
}

/// Blocking writer for completion records, used from inside worker processes.
///
/// Each record is a single 512-byte write so concurrent workers do not interleave.
#[derive(Clone)]
pub struct ResultWriter {
    stream: Arc<StdUnixStream>,
}

impl ResultWriter {
    pub fn new(stream: StdUnixStream) -> Self {
        Self {
            stream: Arc::new(stream),
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl CompletionSink for ResultWriter {
    fn send(&mut self, record: CompletionRecord) -> io::Result<()> {
        let mut buf = BytesMut::new();
        CompletionCodec::new().encode(record, &mut buf)?;
        let mut stream: &StdUnixStream = &self.stream;
        stream.write_all(&buf)?;
        stream.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::CompletionCodec;
    use crate::bridge::protocol::RECORD_SIZE;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    #[tokio::test]
    async fn result_channel_delivers_records() {
        let channel = ResultChannel::new().unwrap();
        let mut writer = channel.writer();
        let reader = channel.into_reader().unwrap();

        writer.send(CompletionRecord::success(100)).unwrap();
        writer.send(CompletionRecord::failed(101)).unwrap();

        let mut records = FramedRead::new(reader, CompletionCodec::new());
        assert_eq!(
            records.next().await.unwrap().unwrap(),
            CompletionRecord::success(100)
        );
        assert_eq!(
            records.next().await.unwrap().unwrap(),
            CompletionRecord::failed(101)
        );
    }

    #[tokio::test]
    async fn writer_emits_exactly_one_record_size() {
        use std::io::Read;

        let (a, b) = StdUnixStream::pair().unwrap();
        let mut writer = ResultWriter::new(a);
        writer.send(CompletionRecord::success(7)).unwrap();
        drop(writer);

        let mut received = Vec::new();
        let mut b = b;
        b.read_to_end(&mut received).unwrap();
        assert_eq!(received.len(), RECORD_SIZE);
    }

    #[tokio::test]
    async fn unit_pair_converts_to_async() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (parent, child) = unit_socket_pair().unwrap();
        let mut parent = into_async(parent).unwrap();
        let mut child = into_async(child).unwrap();

        parent.write_all(b"job").await.unwrap();
        let mut buf = [0u8; 3];
        child.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"job");
    }
}
