//! Local file implementation of [`LogStore`].
//!
//! One append-only file per (topic, partition) at
//! `{data_dir}/{topic}/{partition}.log`, created on first append. Records are
//! framed with [`crate::protocol`]; offsets are byte positions in the file.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use super::error::BrokerResult;
use super::handle_pool::{HandleKey, HandlePool};
use super::metrics;
use super::traits::{LogStore, ReadResult};
use crate::constants::MAX_READ_BYTES;
use crate::protocol::{FrameStop, encode_frame, split_frames};
use crate::types::{Offset, PartitionIndex};

/// Reject names that would escape the data directory.
pub(crate) fn check_path_component(kind: &str, name: &str) -> io::Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid {} name: {:?}", kind, name),
        ));
    }
    Ok(())
}

/// A log tail that can be rolled back after a failed write.
#[async_trait]
trait Truncate {
    async fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

#[async_trait]
impl Truncate for File {
    async fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len).await
    }
}

/// Write a frame at the current position and flush. On failure the tail is
/// cut back to `end` so no partial frame is left behind.
async fn write_frame_or_rollback<W>(tail: &mut W, end: u64, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Truncate + Unpin + Send,
{
    let written = async {
        tail.write_all(frame).await?;
        tail.flush().await
    }
    .await;

    if let Err(e) = written {
        match tail.truncate_to(end).await {
            Ok(()) => {
                metrics::APPEND_TRUNCATIONS.inc();
                tracing::warn!(end, error = %e, "Append failed, log truncated to previous end");
            }
            Err(trunc) => {
                tracing::error!(end, error = %e, truncate_error = %trunc, "Append failed and truncation failed");
            }
        }
        return Err(e);
    }
    Ok(())
}

async fn open_for_append(path: PathBuf) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .await
}

/// Read up to `len` bytes, stopping early at end of file.
async fn read_window(file: &mut File, len: usize) -> io::Result<Bytes> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(Bytes::from(buf))
}

/// File-per-partition log store.
#[derive(Debug)]
pub struct FileLogStore {
    data_dir: PathBuf,
    handles: HandlePool,
}

impl FileLogStore {
    pub fn new(data_dir: impl Into<PathBuf>, idle_timeout: Duration) -> Self {
        Self {
            data_dir: data_dir.into(),
            handles: HandlePool::new(idle_timeout),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn log_path(&self, topic: &str, partition: PartitionIndex) -> PathBuf {
        self.data_dir
            .join(topic)
            .join(format!("{}.log", partition))
    }

    pub fn handles(&self) -> &HandlePool {
        &self.handles
    }

    /// Close handles idle past the configured timeout.
    pub async fn sweep_idle(&self) -> usize {
        self.handles.sweep().await
    }

    async fn append_inner(
        &self,
        topic: &str,
        partition: PartitionIndex,
        payload: &[u8],
    ) -> io::Result<Offset> {
        check_path_component("topic", topic)?;
        if payload.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty records cannot be framed",
            ));
        }

        let path = self.log_path(topic, partition);
        let frame = encode_frame(payload);

        let slot = self.handles.slot(HandleKey::writer(topic, partition));
        let mut guard = slot.lock().await;
        let file = guard.open_with(|| open_for_append(path)).await?;

        let offset = file.seek(SeekFrom::End(0)).await?;
        write_frame_or_rollback(file, offset, &frame).await?;
        Ok(offset)
    }

    /// Whether the log is now longer than `len`, after waiting out any append
    /// in flight. A partial tail that is still there afterwards is torn.
    async fn grew_past(
        &self,
        topic: &str,
        partition: PartitionIndex,
        path: &Path,
        len: u64,
    ) -> bool {
        let slot = self.handles.slot(HandleKey::writer(topic, partition));
        let _writer = slot.lock().await;
        match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len() > len,
            Err(_) => false,
        }
    }

    async fn read_inner(
        &self,
        consumer_group: &str,
        topic: &str,
        partition: PartitionIndex,
        offset: Offset,
        max_bytes: usize,
    ) -> io::Result<ReadResult> {
        check_path_component("topic", topic)?;
        let max_bytes = max_bytes.min(MAX_READ_BYTES);
        if max_bytes == 0 {
            return Ok(ReadResult::empty());
        }

        let path = self.log_path(topic, partition);
        let slot = self
            .handles
            .slot(HandleKey::reader(topic, partition, consumer_group));
        let mut guard = slot.lock().await;

        let file = match guard.open_with(|| File::open(path.clone())).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ReadResult::empty()),
            Err(e) => return Err(e),
        };

        let len = file.metadata().await?.len();
        if offset >= len {
            return Ok(ReadResult::empty());
        }

        let window_len = max_bytes.min((len - offset) as usize);
        file.seek(SeekFrom::Start(offset)).await?;
        let window = read_window(file, window_len).await?;
        drop(guard);

        let at_eof = offset + window.len() as u64 >= len;
        let split = split_frames(window);

        let torn_tail = split.stop != FrameStop::EndOfBuffer && at_eof;
        if split.stop.is_corrupt()
            || (torn_tail && !self.grew_past(topic, partition, &path, len).await)
        {
            metrics::CORRUPT_FRAMES.inc();
            tracing::warn!(
                topic = %topic,
                partition,
                offset = offset + split.consumed as u64,
                stop = ?split.stop,
                "Read stopped at an untrustworthy frame"
            );
        }

        Ok(ReadResult {
            records: split.records,
            bytes_consumed: split.consumed as u64,
        })
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn append(
        &self,
        topic: &str,
        partition: PartitionIndex,
        payload: &[u8],
    ) -> BrokerResult<Offset> {
        let started = Instant::now();
        let offset = self.append_inner(topic, partition, payload).await?;
        metrics::record_storage_operation("append", started.elapsed().as_secs_f64());
        metrics::record_append(topic, partition, payload.len() as u64);
        Ok(offset)
    }

    async fn read(
        &self,
        consumer_group: &str,
        topic: &str,
        partition: PartitionIndex,
        offset: Offset,
        max_bytes: usize,
    ) -> BrokerResult<ReadResult> {
        let started = Instant::now();
        let result = self
            .read_inner(consumer_group, topic, partition, offset, max_bytes)
            .await?;
        metrics::record_storage_operation("read", started.elapsed().as_secs_f64());
        metrics::record_read(
            topic,
            partition,
            "log",
            result.records.len() as u64,
            result.bytes_consumed,
        );
        Ok(result)
    }

    async fn end_offset(&self, topic: &str, partition: PartitionIndex) -> BrokerResult<Offset> {
        check_path_component("topic", topic)?;
        match tokio::fs::metadata(self.log_path(topic, partition)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FRAME_HEADER_SIZE;
    use serial_test::serial;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};

    fn store(dir: &Path) -> FileLogStore {
        FileLogStore::new(dir, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_append_returns_pre_write_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let log = store(dir.path());

        assert_eq!(log.append("t", 0, b"abc").await.unwrap(), 0);
        assert_eq!(
            log.append("t", 0, b"defg").await.unwrap(),
            (FRAME_HEADER_SIZE + 3) as u64
        );
        assert_eq!(
            log.end_offset("t", 0).await.unwrap(),
            (2 * FRAME_HEADER_SIZE + 7) as u64
        );
        assert!(log.log_path("t", 0).exists());
    }

    #[tokio::test]
    async fn test_partitions_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let log = store(dir.path());

        log.append("t", 0, b"zero").await.unwrap();
        assert_eq!(log.append("t", 1, b"one").await.unwrap(), 0);
        assert_eq!(log.end_offset("t", 2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = store(dir.path());
        let result = log.read("g", "nope", 0, 0, 1024).await.unwrap();
        assert_eq!(result, ReadResult::empty());
    }

    #[tokio::test]
    async fn test_read_respects_max_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let log = store(dir.path());
        log.append("t", 0, b"aaaa").await.unwrap();
        log.append("t", 0, b"bbbb").await.unwrap();

        let frame = (FRAME_HEADER_SIZE + 4) as u64;
        let result = log.read("g", "t", 0, 0, frame as usize + 5).await.unwrap();
        assert_eq!(result.records, vec![Bytes::from_static(b"aaaa")]);
        assert_eq!(result.bytes_consumed, frame);

        let result = log.read("g", "t", 0, 0, 3).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(result.bytes_consumed, 0);
    }

    #[tokio::test]
    async fn test_empty_payload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let log = store(dir.path());
        assert!(log.append("t", 0, b"").await.is_err());
        assert_eq!(log.end_offset("t", 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_topic_names_cannot_escape_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log = store(dir.path());
        assert!(log.append("..", 0, b"x").await.is_err());
        assert!(log.append("a/b", 0, b"x").await.is_err());
        assert!(log.read("g", "", 0, 0, 10).await.is_err());
    }

    async fn append_raw(log: &FileLogStore, bytes: &[u8]) {
        let mut file = OpenOptions::new()
            .append(true)
            .open(log.log_path("t", 0))
            .await
            .unwrap();
        file.write_all(bytes).await.unwrap();
        file.flush().await.unwrap();
    }

    // Tests reading CORRUPT_FRAMES are serial; the counter is process-wide.

    #[tokio::test]
    #[serial]
    async fn test_zero_length_header_stops_read() {
        let dir = tempfile::tempdir().unwrap();
        let log = store(dir.path());
        log.append("t", 0, b"good").await.unwrap();
        append_raw(&log, &[0u8; FRAME_HEADER_SIZE + 4]).await;
        let before = metrics::CORRUPT_FRAMES.get();

        let result = log.read("g", "t", 0, 0, 1024).await.unwrap();
        assert_eq!(result.records, vec![Bytes::from_static(b"good")]);
        assert_eq!(result.bytes_consumed, (FRAME_HEADER_SIZE + 4) as u64);
        assert_eq!(metrics::CORRUPT_FRAMES.get(), before + 1);
    }

    #[tokio::test]
    #[serial]
    async fn test_torn_tail_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        let log = store(dir.path());
        log.append("t", 0, b"good").await.unwrap();
        let torn = encode_frame(b"never finished");
        append_raw(&log, &torn[..FRAME_HEADER_SIZE + 3]).await;
        let before = metrics::CORRUPT_FRAMES.get();

        let result = log.read("g", "t", 0, 0, 1024).await.unwrap();
        assert_eq!(result.records, vec![Bytes::from_static(b"good")]);
        assert_eq!(metrics::CORRUPT_FRAMES.get(), before + 1);
    }

    #[tokio::test]
    #[serial]
    async fn test_tail_of_append_in_flight_is_not_counted() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(store(dir.path()));
        log.append("t", 0, b"done").await.unwrap();

        // Stand in for an append holding the writer lock mid-write.
        let frame = encode_frame(b"in flight");
        let (head, rest) = frame.split_at(FRAME_HEADER_SIZE + 2);
        let slot = log.handles.slot(HandleKey::writer("t", 0));
        let writer = slot.lock().await;
        append_raw(&log, head).await;
        let before = metrics::CORRUPT_FRAMES.get();

        let reader = {
            let log = log.clone();
            tokio::spawn(async move { log.read("g", "t", 0, 0, 1024).await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        append_raw(&log, rest).await;
        drop(writer);

        let result = reader.await.unwrap();
        assert_eq!(result.records[0], Bytes::from_static(b"done"));
        assert_eq!(metrics::CORRUPT_FRAMES.get(), before);
    }

    /// Accepts `limit` bytes, then fails every write.
    struct FailingTail {
        written: Vec<u8>,
        limit: usize,
        truncated_to: Option<u64>,
    }

    impl AsyncWrite for FailingTail {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let room = self.limit.saturating_sub(self.written.len());
            if room == 0 {
                return Poll::Ready(Err(io::Error::other("disk full")));
            }
            let n = room.min(buf.len());
            self.written.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[async_trait]
    impl Truncate for FailingTail {
        async fn truncate_to(&mut self, len: u64) -> io::Result<()> {
            self.written.truncate(len as usize);
            self.truncated_to = Some(len);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_append_truncates_to_previous_end() {
        let existing = encode_frame(b"kept");
        let mut tail = FailingTail {
            written: existing.to_vec(),
            limit: existing.len() + 6,
            truncated_to: None,
        };

        let end = existing.len() as u64;
        let result = write_frame_or_rollback(&mut tail, end, &encode_frame(b"lost")).await;

        assert!(result.is_err());
        assert_eq!(tail.truncated_to, Some(end));
        assert_eq!(tail.written, existing.to_vec());
    }

    #[tokio::test]
    async fn test_reader_handles_are_per_group() {
        let dir = tempfile::tempdir().unwrap();
        let log = store(dir.path());
        log.append("t", 0, b"x").await.unwrap();

        log.read("g1", "t", 0, 0, 100).await.unwrap();
        log.read("g2", "t", 0, 0, 100).await.unwrap();
        // writer + two readers
        assert_eq!(log.handles().slot_count(), 3);
    }
}
