//! File-backed log store.
//!
//! Layout: `<root>/<job id>/index.json` lists the job's segments in order and
//! `<root>/<job id>/NNNN.log` holds the bytes of the segment at position `NNNN`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use kiln_core::{JobId, LogSegment};
use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{LogStore, SegmentWriter};
use crate::repo::live::{LiveLogs, WriterClaim, follow};
use crate::repo::{sync_dir, write_atomically};
use crate::{DbError, DbResult};

#[derive(Clone)]
pub struct FileLogStore {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    /// Serializes index rewrites.
    index_lock: Mutex<()>,
    live: Arc<LiveLogs>,
}

impl FileLogStore {
    pub async fn open(root: impl Into<PathBuf>, live: Arc<LiveLogs>) -> DbResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "Opened file log store");
        Ok(Self {
            inner: Arc::new(Inner {
                root,
                index_lock: Mutex::new(()),
                live,
            }),
        })
    }

    fn job_dir(&self, job: JobId) -> PathBuf {
        self.inner.root.join(job.to_string())
    }

    fn index_path(&self, job: JobId) -> PathBuf {
        self.job_dir(job).join("index.json")
    }

    fn segment_path(&self, job: JobId, position: usize) -> PathBuf {
        self.job_dir(job).join(format!("{:04}.log", position))
    }

    async fn load_index(&self, job: JobId) -> DbResult<Vec<LogSegment>> {
        match tokio::fs::read(self.index_path(job)).await {
            Ok(content) => Ok(serde_json::from_slice(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DbError::NotFound(format!("log for job {}", job)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The index, creating an empty one if the job has no log yet.
    async fn load_or_create_index(&self, job: JobId) -> DbResult<Vec<LogSegment>> {
        match self.load_index(job).await {
            Err(DbError::NotFound(_)) => {
                tokio::fs::create_dir_all(self.job_dir(job)).await?;
                sync_dir(&self.inner.root).await?;
                self.save_index(job, &[]).await?;
                Ok(Vec::new())
            }
            other => other,
        }
    }

    async fn save_index(&self, job: JobId, index: &[LogSegment]) -> DbResult<()> {
        write_atomically(&self.index_path(job), &serde_json::to_vec_pretty(index)?).await
    }

    async fn file_len(path: &Path) -> DbResult<u64> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Close the last segment if a previous writer left it open. Returns
    /// whether the index changed.
    async fn close_dangling(&self, job: JobId, index: &mut [LogSegment]) -> DbResult<bool> {
        let position = index.len().saturating_sub(1);
        let Some(last) = index.last_mut() else {
            return Ok(false);
        };
        if !last.is_open() {
            return Ok(false);
        }
        let len = Self::file_len(&self.segment_path(job, position)).await?;
        last.end_offset = Some(last.start_offset + len);
        warn!(job_id = %job, segment = %last.name, "Closed dangling log segment");
        Ok(true)
    }

    async fn total_len(&self, job: JobId, index: &[LogSegment]) -> DbResult<u64> {
        let Some(last) = index.last() else {
            return Ok(0);
        };
        match last.end_offset {
            Some(end) => Ok(end),
            None => {
                let len = Self::file_len(&self.segment_path(job, index.len() - 1)).await?;
                Ok(last.start_offset + len)
            }
        }
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn begin(&self, job: JobId) -> DbResult<()> {
        let _guard = self.inner.index_lock.lock().await;
        let index = self.load_or_create_index(job).await?;
        let len = self.total_len(job, &index).await?;
        self.inner.live.begin(job, len);
        Ok(())
    }

    async fn open_segment(&self, job: JobId, name: &str) -> DbResult<Box<dyn SegmentWriter>> {
        let claim = self.inner.live.claim_writer(job)?;

        let _guard = self.inner.index_lock.lock().await;
        let mut index = self.load_or_create_index(job).await?;
        if index.iter().any(|s| s.name == name) {
            return Err(DbError::Duplicate(format!(
                "segment {} of job {}",
                name, job
            )));
        }
        self.close_dangling(job, &mut index).await?;

        let start_offset = index.last().and_then(|s| s.end_offset).unwrap_or(0);
        let segment = LogSegment {
            name: name.to_string(),
            start_offset,
            end_offset: None,
        };
        let position = index.len();
        let file = tokio::fs::File::create(self.segment_path(job, position)).await?;
        index.push(segment.clone());
        self.save_index(job, &index).await?;

        self.inner.live.begin(job, start_offset);
        debug!(job_id = %job, segment = %name, start_offset, "Opened log segment");

        Ok(Box::new(FileSegmentWriter {
            store: self.clone(),
            job,
            position,
            segment,
            file,
            written: 0,
            _claim: claim,
        }))
    }

    async fn read(&self, job: JobId, name: &str, range: Range<u64>) -> DbResult<Bytes> {
        let index = self.load_index(job).await?;
        let position = index
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| DbError::NotFound(format!("segment {} of job {}", name, job)))?;

        let mut file = match tokio::fs::File::open(self.segment_path(job, position)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Bytes::new()),
            Err(e) => return Err(e.into()),
        };
        let mut len = file.metadata().await?.len();
        if let Some(end) = index[position].end_offset {
            len = len.min(end - index[position].start_offset);
        }

        let start = range.start.min(len);
        let end = range.end.min(len).max(start);
        if start == end {
            return Ok(Bytes::new());
        }

        file.seek(SeekFrom::Start(start)).await?;
        let mut buf = Vec::with_capacity((end - start) as usize);
        file.take(end - start).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn segments(&self, job: JobId) -> DbResult<Vec<LogSegment>> {
        self.load_index(job).await
    }

    fn tail(&self, job: JobId, from: u64) -> BoxStream<'static, DbResult<Bytes>> {
        follow(self.clone(), &self.inner.live, job, from)
    }

    async fn finish(&self, job: JobId) -> DbResult<()> {
        let result = async {
            let _guard = self.inner.index_lock.lock().await;
            let mut index = match self.load_index(job).await {
                Ok(index) => index,
                Err(DbError::NotFound(_)) => return Ok(()),
                Err(e) => return Err(e),
            };
            if self.close_dangling(job, &mut index).await? {
                self.save_index(job, &index).await?;
            }
            Ok(())
        }
        .await;
        self.inner.live.finish(job);
        result
    }
}

struct FileSegmentWriter {
    store: FileLogStore,
    job: JobId,
    position: usize,
    segment: LogSegment,
    file: tokio::fs::File,
    written: u64,
    _claim: WriterClaim,
}

#[async_trait]
impl SegmentWriter for FileSegmentWriter {
    fn segment(&self) -> &LogSegment {
        &self.segment
    }

    fn offset(&self) -> u64 {
        self.segment.start_offset + self.written
    }

    async fn append(&mut self, data: &[u8]) -> DbResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.file.write_all(data).await?;
        self.file.flush().await?;
        self.file.sync_data().await?;
        self.written += data.len() as u64;
        self.store.inner.live.advance(self.job, self.offset());
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> DbResult<LogSegment> {
        self.file.sync_data().await?;

        let store = self.store.clone();
        let _guard = store.inner.index_lock.lock().await;
        let mut index = store.load_index(self.job).await?;
        let end_offset = self.offset();
        let entry = index
            .get_mut(self.position)
            .filter(|s| s.name == self.segment.name)
            .ok_or_else(|| {
                DbError::Corrupt(format!(
                    "segment {} missing from index of job {}",
                    self.segment.name, self.job
                ))
            })?;
        if !entry.is_open() {
            return Err(DbError::SegmentClosed(self.segment.name.clone()));
        }
        entry.end_offset = Some(end_offset);
        store.save_index(self.job, &index).await?;

        self.segment.end_offset = Some(end_offset);
        debug!(job_id = %self.job, segment = %self.segment.name, end_offset, "Closed log segment");
        Ok(self.segment.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn make_store() -> (tempfile::TempDir, FileLogStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileLogStore::open(dir.path(), LiveLogs::new()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_segments_are_contiguous() {
        let (_dir, store) = make_store().await;
        let job = JobId::new();
        store.begin(job).await.unwrap();

        let mut writer = store.open_segment(job, "prepare").await.unwrap();
        writer.append(b"cloning...\n").await.unwrap();
        let prepare = writer.close().await.unwrap();

        let mut writer = store.open_segment(job, "build").await.unwrap();
        assert_eq!(writer.offset(), 11);
        writer.append(b"compiling...\n").await.unwrap();
        let build = writer.close().await.unwrap();

        assert_eq!(prepare.start_offset, 0);
        assert_eq!(prepare.end_offset, Some(11));
        assert_eq!(build.start_offset, 11);
        assert_eq!(build.end_offset, Some(24));
        assert_eq!(store.segments(job).await.unwrap(), vec![prepare, build]);
    }

    #[tokio::test]
    async fn test_read_clamps_range() {
        let (_dir, store) = make_store().await;
        let job = JobId::new();
        let mut writer = store.open_segment(job, "build").await.unwrap();
        writer.append(b"hello world\n").await.unwrap();
        writer.close().await.unwrap();

        let all = store.read(job, "build", 0..u64::MAX).await.unwrap();
        assert_eq!(&all[..], b"hello world\n");
        let part = store.read(job, "build", 6..11).await.unwrap();
        assert_eq!(&part[..], b"world");
        assert!(store.read(job, "build", 100..200).await.unwrap().is_empty());
        assert!(matches!(
            store.read(job, "test", 0..10).await,
            Err(DbError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_one_writer_per_job() {
        let (_dir, store) = make_store().await;
        let job = JobId::new();
        let writer = store.open_segment(job, "build").await.unwrap();
        assert!(matches!(
            store.open_segment(job, "test").await,
            Err(DbError::WriterBusy(_))
        ));
        assert!(store.open_segment(JobId::new(), "build").await.is_ok());

        writer.close().await.unwrap();
        assert!(matches!(
            store.open_segment(job, "build").await,
            Err(DbError::Duplicate(_))
        ));
        assert!(store.open_segment(job, "test").await.is_ok());
    }

    #[tokio::test]
    async fn test_dangling_segment_closed_on_finish() {
        let (_dir, store) = make_store().await;
        let job = JobId::new();
        let mut writer = store.open_segment(job, "build").await.unwrap();
        writer.append(b"partial output\n").await.unwrap();
        drop(writer);

        assert!(store.segments(job).await.unwrap()[0].is_open());
        store.finish(job).await.unwrap();
        let segments = store.segments(job).await.unwrap();
        assert_eq!(segments[0].end_offset, Some(15));
    }

    #[tokio::test]
    async fn test_acknowledged_appends_survive_a_lost_writer() {
        let dir = tempfile::tempdir().unwrap();
        let job = JobId::new();
        {
            let store = FileLogStore::open(dir.path(), LiveLogs::new()).await.unwrap();
            let mut writer = store.open_segment(job, "build").await.unwrap();
            writer.append(b"step 1\n").await.unwrap();
            writer.append(b"step 2\n").await.unwrap();
            // The process goes away without closing the segment.
            std::mem::forget(writer);
        }

        let reopened = FileLogStore::open(dir.path(), LiveLogs::new()).await.unwrap();
        reopened.finish(job).await.unwrap();
        let segments = reopened.segments(job).await.unwrap();
        assert_eq!(segments[0].end_offset, Some(14));
        let bytes = reopened.read(job, "build", 0..u64::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"step 1\nstep 2\n");
    }

    #[tokio::test]
    async fn test_tail_follows_live_appends() {
        let (_dir, store) = make_store().await;
        let job = JobId::new();
        store.begin(job).await.unwrap();

        let mut writer = store.open_segment(job, "build").await.unwrap();
        writer.append(b"first\n").await.unwrap();

        let mut tail = store.tail(job, 0);
        assert_eq!(&tail.next().await.unwrap().unwrap()[..], b"first\n");

        writer.append(b"second\n").await.unwrap();
        assert_eq!(&tail.next().await.unwrap().unwrap()[..], b"second\n");

        writer.close().await.unwrap();
        let mut writer = store.open_segment(job, "test").await.unwrap();
        writer.append(b"third\n").await.unwrap();
        writer.close().await.unwrap();
        store.finish(job).await.unwrap();

        let rest: Vec<Bytes> = tail.map(|chunk| chunk.unwrap()).collect().await;
        assert_eq!(rest.concat(), b"third\n".to_vec());
    }

    #[tokio::test]
    async fn test_tail_of_finished_job_replays_and_ends() {
        let (_dir, store) = make_store().await;
        let job = JobId::new();
        let mut writer = store.open_segment(job, "build").await.unwrap();
        writer.append(b"abcdef\n").await.unwrap();
        writer.close().await.unwrap();
        store.finish(job).await.unwrap();

        let chunks: Vec<Bytes> = store.tail(job, 3).map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks.concat(), b"def\n".to_vec());
    }
}
