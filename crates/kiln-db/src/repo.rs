//! Store traits and implementations.

pub mod jobs;
pub mod live;
pub mod logs;

pub use jobs::{FileJobStore, JobStore, PgJobStore};
pub use live::LiveLogs;
pub use logs::{FileLogStore, LogStore, PgLogStore, SegmentWriter};

use std::path::Path;
use tokio::io::AsyncWriteExt;

use crate::DbResult;

/// Replace `path` with `content` via a synced temp file and a rename, then
/// sync the directory so the rename itself survives a crash.
pub(crate) async fn write_atomically(path: &Path, content: &[u8]) -> DbResult<()> {
    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    if let Some(dir) = path.parent() {
        sync_dir(dir).await?;
    }
    Ok(())
}

/// Flush a directory's entries (created, renamed files) to disk.
#[cfg(unix)]
pub(crate) async fn sync_dir(dir: &Path) -> DbResult<()> {
    tokio::fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) async fn sync_dir(_dir: &Path) -> DbResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomically_replaces_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");

        write_atomically(&path, b"{\"v\":1}").await.unwrap();
        write_atomically(&path, b"{\"v\":2}").await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"{\"v\":2}");
        assert!(!path.with_extension("tmp").exists());
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name());
        }
        assert_eq!(names, vec![std::ffi::OsString::from("job.json")]);
    }

    #[tokio::test]
    async fn test_sync_dir_accepts_directories() {
        let dir = tempfile::tempdir().unwrap();
        sync_dir(dir.path()).await.unwrap();
        assert!(sync_dir(&dir.path().join("missing")).await.is_err());
    }
}
