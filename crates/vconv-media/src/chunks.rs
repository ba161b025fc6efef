//! Ordered reassembly of uploaded chunk files.
//!
//! Chunks live in one directory per video and are named with an embedded
//! sequence number (`0.chunk`, `part-12.chunk`, ...). The sequence number is
//! the first run of ASCII digits in the file name; assembly order is
//! ascending by that number, never by name or directory order.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{MediaError, MediaResult};

/// Extension marking chunk files.
pub const DEFAULT_CHUNK_EXTENSION: &str = "chunk";

fn sequence_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[0-9]+").expect("sequence pattern is valid"))
}

/// Extract the sequence number from a chunk path's file name.
pub fn chunk_sequence(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    sequence_pattern().find(name)?.as_str().parse().ok()
}

/// A chunk file with its parsed sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub sequence: u64,
    pub path: PathBuf,
}

/// Merges a directory of numbered chunks into a single file.
#[derive(Debug, Clone)]
pub struct ChunkAssembler {
    extension: String,
    cancel_rx: Option<watch::Receiver<bool>>,
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self {
            extension: DEFAULT_CHUNK_EXTENSION.to_string(),
            cancel_rx: None,
        }
    }

    /// Recognize chunks by a different extension (without the dot).
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into().trim_start_matches('.').to_string();
        self
    }

    /// Abort between chunks once the signal is raised.
    pub fn with_cancel(mut self, cancel_rx: watch::Receiver<bool>) -> Self {
        self.cancel_rx = Some(cancel_rx);
        self
    }

    /// List the chunks in `dir`, validated and sorted by sequence number.
    ///
    /// Fails if the directory cannot be read or holds no chunks. Also fails if
    /// any chunk cannot be inspected, lacks a sequence number or repeats one.
    pub async fn collect(&self, dir: impl AsRef<Path>) -> MediaResult<Vec<Chunk>> {
        let dir = dir.as_ref();
        let unreadable = |source| MediaError::ChunkDirUnreadable {
            path: dir.to_path_buf(),
            source,
        };

        let mut entries = fs::read_dir(dir).await.map_err(unreadable)?;
        let mut chunks = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(unreadable)? {
            let path = entry.path();
            if !self.is_chunk(&path) {
                continue;
            }
            // Follows symlinks, unlike DirEntry::file_type. A chunk that cannot
            // be inspected must fail the merge rather than silently drop out.
            let metadata = fs::metadata(&path).await.map_err(|source| MediaError::ChunkOpen {
                path: path.clone(),
                source,
            })?;
            if !metadata.is_file() {
                continue;
            }

            let sequence = chunk_sequence(&path).ok_or_else(|| MediaError::InvalidChunkName(path.clone()))?;
            chunks.push(Chunk { sequence, path });
        }

        if chunks.is_empty() {
            return Err(MediaError::NoChunks(dir.to_path_buf()));
        }

        chunks.sort_by_key(|chunk| chunk.sequence);

        if let Some(pair) = chunks.windows(2).find(|pair| pair[0].sequence == pair[1].sequence) {
            return Err(MediaError::DuplicateChunk {
                sequence: pair[0].sequence,
                first: pair[0].path.clone(),
                second: pair[1].path.clone(),
            });
        }

        Ok(chunks)
    }

    /// Concatenate the chunks of `dir` into `destination`, in sequence order.
    ///
    /// The destination is only created once the chunk set is validated, so a
    /// missing or empty directory leaves no file behind. A failure after that
    /// point leaves a partial destination that must not be used.
    pub async fn merge(
        &self,
        dir: impl AsRef<Path>,
        destination: impl AsRef<Path>,
    ) -> MediaResult<PathBuf> {
        let dir = dir.as_ref();
        let destination = destination.as_ref();
        let chunks = self.collect(dir).await?;

        debug!(
            path = %dir.display(),
            chunks = chunks.len(),
            "Merging chunks into {}",
            destination.display()
        );

        let output_err = |source| MediaError::MergeOutput {
            path: destination.to_path_buf(),
            source,
        };

        let mut output = File::create(destination).await.map_err(output_err)?;
        let mut total_bytes = 0u64;

        for chunk in &chunks {
            self.check_cancelled()?;

            // One chunk open at a time; dropped at the end of each iteration
            let mut input = File::open(&chunk.path).await.map_err(|source| MediaError::ChunkOpen {
                path: chunk.path.clone(),
                source,
            })?;

            total_bytes += tokio::io::copy(&mut input, &mut output)
                .await
                .map_err(|source| MediaError::ChunkCopy {
                    path: chunk.path.clone(),
                    source,
                })?;
        }

        output.flush().await.map_err(output_err)?;
        output.sync_all().await.map_err(output_err)?;

        info!(
            path = %dir.display(),
            chunks = chunks.len(),
            bytes = total_bytes,
            "Merged chunks into {}",
            destination.display()
        );

        Ok(destination.to_path_buf())
    }

    fn is_chunk(&self, path: &Path) -> bool {
        path.extension().and_then(|ext| ext.to_str()) == Some(self.extension.as_str())
    }

    fn check_cancelled(&self) -> MediaResult<()> {
        match &self.cancel_rx {
            Some(rx) if *rx.borrow() => Err(MediaError::Cancelled),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn write_chunks(dir: &Path, chunks: &[(&str, &[u8])]) {
        for (name, data) in chunks {
            fs::write(dir.join(name), data).await.unwrap();
        }
    }

    #[test]
    fn test_chunk_sequence() {
        assert_eq!(chunk_sequence(Path::new("/media/1/0.chunk")), Some(0));
        assert_eq!(chunk_sequence(Path::new("part-12.chunk")), Some(12));
        assert_eq!(chunk_sequence(Path::new("/media/99/part-3-of-7.chunk")), Some(3));
        assert_eq!(chunk_sequence(Path::new("/media/99/part.chunk")), None);
        assert_eq!(chunk_sequence(Path::new("99999999999999999999999.chunk")), None);
    }

    #[tokio::test]
    async fn test_merge_orders_by_sequence_number() {
        let dir = TempDir::new().unwrap();
        write_chunks(
            dir.path(),
            &[("part-2.chunk", b"C"), ("part-0.chunk", b"A"), ("part-1.chunk", b"B")],
        )
        .await;
        let merged = dir.path().join("merged.mp4");

        let path = ChunkAssembler::new().merge(dir.path(), &merged).await.unwrap();

        assert_eq!(path, merged);
        assert_eq!(fs::read(&merged).await.unwrap(), b"ABC");
    }

    #[tokio::test]
    async fn test_merge_uses_numeric_not_lexical_order() {
        let dir = TempDir::new().unwrap();
        let mut expected = Vec::new();
        // Written in reverse so neither name nor creation order matches
        for i in (0..12u8).rev() {
            fs::write(dir.path().join(format!("{}.chunk", i)), [i]).await.unwrap();
        }
        for i in 0..12u8 {
            expected.push(i);
        }
        let merged = dir.path().join("merged.mp4");

        ChunkAssembler::new().merge(dir.path(), &merged).await.unwrap();

        assert_eq!(fs::read(&merged).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_merge_ignores_other_files() {
        let dir = TempDir::new().unwrap();
        write_chunks(
            dir.path(),
            &[("0.chunk", b"A"), ("1.chunk", b"B"), ("notes.txt", b"x"), ("merged.mp4", b"old")],
        )
        .await;
        fs::create_dir(dir.path().join("7.chunk")).await.unwrap();
        let merged = dir.path().join("merged.mp4");

        ChunkAssembler::new().merge(dir.path(), &merged).await.unwrap();

        assert_eq!(fs::read(&merged).await.unwrap(), b"AB");
    }

    #[tokio::test]
    async fn test_empty_directory_produces_no_file() {
        let dir = TempDir::new().unwrap();
        let merged = dir.path().join("merged.mp4");

        let err = ChunkAssembler::new().merge(dir.path(), &merged).await.unwrap_err();

        assert!(matches!(err, MediaError::NoChunks(_)));
        assert!(err.is_assembly());
        assert!(!merged.exists());
    }

    #[tokio::test]
    async fn test_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("does-not-exist");
        let merged = dir.path().join("merged.mp4");

        let err = ChunkAssembler::new().merge(&missing, &merged).await.unwrap_err();

        assert!(matches!(err, MediaError::ChunkDirUnreadable { .. }));
        assert!(!merged.exists());
    }

    #[tokio::test]
    async fn test_unnumbered_chunk_fails_whole_assembly() {
        let dir = TempDir::new().unwrap();
        write_chunks(dir.path(), &[("0.chunk", b"A"), ("final.chunk", b"B")]).await;
        let merged = dir.path().join("merged.mp4");

        let err = ChunkAssembler::new().merge(dir.path(), &merged).await.unwrap_err();

        assert!(matches!(err, MediaError::InvalidChunkName(_)));
        assert!(!merged.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dangling_chunk_link_fails_assembly() {
        let dir = TempDir::new().unwrap();
        write_chunks(dir.path(), &[("0.chunk", b"A"), ("2.chunk", b"C")]).await;
        std::os::unix::fs::symlink(dir.path().join("gone"), dir.path().join("1.chunk")).unwrap();
        let merged = dir.path().join("merged.mp4");

        let err = ChunkAssembler::new().merge(dir.path(), &merged).await.unwrap_err();

        assert!(matches!(err, MediaError::ChunkOpen { ref path, .. } if path.ends_with("1.chunk")));
        assert!(err.is_assembly());
        assert!(!merged.exists());
    }

    #[tokio::test]
    async fn test_duplicate_sequence_fails() {
        let dir = TempDir::new().unwrap();
        write_chunks(dir.path(), &[("1.chunk", b"A"), ("part-01.chunk", b"B")]).await;

        let err = ChunkAssembler::new().collect(dir.path()).await.unwrap_err();

        assert!(matches!(err, MediaError::DuplicateChunk { sequence: 1, .. }));
    }

    #[tokio::test]
    async fn test_custom_extension() {
        let dir = TempDir::new().unwrap();
        write_chunks(dir.path(), &[("1.part", b"B"), ("0.part", b"A"), ("2.chunk", b"C")]).await;

        let chunks = ChunkAssembler::new().with_extension(".part").collect(dir.path()).await.unwrap();

        let sequences: Vec<u64> = chunks.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_cancelled_merge_stops() {
        let dir = TempDir::new().unwrap();
        write_chunks(dir.path(), &[("0.chunk", b"A")]).await;
        let (_tx, rx) = watch::channel(true);

        let err = ChunkAssembler::new()
            .with_cancel(rx)
            .merge(dir.path(), dir.path().join("merged.mp4"))
            .await
            .unwrap_err();

        assert!(matches!(err, MediaError::Cancelled));
    }
}
