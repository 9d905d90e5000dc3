//! Kernel workspace directory and chunked file transfer
//!
//! Every kernel runs inside its own workspace directory. Binary outputs
//! (plots, animations) are written there under unique names, and those names
//! are the only handle clients get for them. Files move in and out in chunks,
//! each tagged with the name of the file it belongs to.

use std::path::{Component, Path, PathBuf};

use futures_util::stream::{BoxStream, Stream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

/// Error type for workspace operations
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid file name: {0}")]
    InvalidName(String),
    #[error("upload exceeds the limit of {limit} bytes")]
    UploadLimitExceeded { limit: u64 },
    #[error("file not found: {0}")]
    NotFound(String),
}

/// One piece of a file transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub filename: String,
    pub data: Vec<u8>,
}

/// What an upload wrote
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub files: Vec<String>,
    pub bytes: u64,
}

/// A directory owned by one kernel
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open (creating if needed) a workspace at `root`
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A fresh file name with the given extension
    pub fn unique_name(extension: &str) -> String {
        format!("{}.{}", Uuid::now_v7().simple(), extension)
    }

    /// Write a binary output under a unique name and return the name
    pub fn write_output(&self, bytes: &[u8], extension: &str) -> Result<String, WorkspaceError> {
        let filename = Self::unique_name(extension);
        std::fs::write(self.root.join(&filename), bytes)?;
        debug!(file = %filename, size = bytes.len(), "Wrote kernel output file");
        Ok(filename)
    }

    /// Map a client-supplied name to a path inside the workspace
    pub fn resolve(&self, filename: &str) -> Result<PathBuf, WorkspaceError> {
        let relative = Path::new(filename);
        let mut components = relative.components().peekable();
        if components.peek().is_none()
            || !components.all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(WorkspaceError::InvalidName(filename.to_string()));
        }
        Ok(self.root.join(relative))
    }

    /// Write a stream of chunks to disk
    ///
    /// Consecutive chunks with the same name append to one file. When the
    /// total size passes `max_bytes` the transfer is aborted and every file it
    /// created is removed.
    pub async fn upload<S>(&self, chunks: S, max_bytes: u64) -> Result<UploadSummary, WorkspaceError>
    where
        S: Stream<Item = FileChunk> + Send,
    {
        let mut chunks = Box::pin(chunks);
        let mut summary = UploadSummary::default();
        let mut created: Vec<PathBuf> = Vec::new();
        let mut current: Option<(String, tokio::fs::File)> = None;

        let result: Result<(), WorkspaceError> = async {
            while let Some(chunk) = chunks.next().await {
                summary.bytes += chunk.data.len() as u64;
                if summary.bytes > max_bytes {
                    return Err(WorkspaceError::UploadLimitExceeded { limit: max_bytes });
                }

                let same_file = matches!(&current, Some((name, _)) if *name == chunk.filename);
                if !same_file {
                    if let Some((_, mut file)) = current.take() {
                        file.flush().await?;
                    }
                    let path = self.resolve(&chunk.filename)?;
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    let file = tokio::fs::File::create(&path).await?;
                    created.push(path);
                    summary.files.push(chunk.filename.clone());
                    current = Some((chunk.filename.clone(), file));
                }

                if let Some((_, file)) = current.as_mut() {
                    file.write_all(&chunk.data).await?;
                }
            }
            if let Some((_, mut file)) = current.take() {
                file.flush().await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            drop(current);
            for path in &created {
                if let Err(remove_err) = tokio::fs::remove_file(path).await {
                    warn!(path = %path.display(), error = %remove_err, "Failed to remove partial upload");
                }
            }
            return Err(e);
        }

        debug!(files = summary.files.len(), bytes = summary.bytes, "Upload complete");
        Ok(summary)
    }

    /// Stream a file out in chunks of `chunk_size` bytes
    pub async fn download(
        &self,
        filename: &str,
        chunk_size: usize,
    ) -> Result<BoxStream<'static, Result<FileChunk, WorkspaceError>>, WorkspaceError> {
        let path = self.resolve(filename)?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WorkspaceError::NotFound(filename.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let filename = filename.to_string();
        let chunk_size = chunk_size.max(1);

        let stream = async_stream::stream! {
            loop {
                let mut buf = vec![0u8; chunk_size];
                let mut filled = 0;
                // Fill the whole chunk unless the file ends first
                while filled < chunk_size {
                    match file.read(&mut buf[filled..]).await {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) => {
                            yield Err(WorkspaceError::Io(e));
                            return;
                        }
                    }
                }
                if filled == 0 {
                    break;
                }
                buf.truncate(filled);
                yield Ok(FileChunk { filename: filename.clone(), data: buf });
                if filled < chunk_size {
                    break;
                }
            }
        };
        Ok(stream.boxed())
    }
}

/// Read a local file as upload chunks named after its file name
pub async fn file_chunks(path: &Path, chunk_size: usize) -> Result<Vec<FileChunk>, WorkspaceError> {
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| WorkspaceError::InvalidName(path.display().to_string()))?;
    let data = tokio::fs::read(path).await?;
    Ok(data
        .chunks(chunk_size.max(1))
        .map(|piece| FileChunk {
            filename: filename.clone(),
            data: piece.to_vec(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn chunk(name: &str, data: &[u8]) -> FileChunk {
        FileChunk {
            filename: name.to_string(),
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path()).unwrap();
        assert!(ws.resolve("data.csv").is_ok());
        assert!(ws.resolve("sub/data.csv").is_ok());
        assert!(matches!(ws.resolve("../etc/passwd"), Err(WorkspaceError::InvalidName(_))));
        assert!(matches!(ws.resolve("/etc/passwd"), Err(WorkspaceError::InvalidName(_))));
        assert!(matches!(ws.resolve(""), Err(WorkspaceError::InvalidName(_))));
    }

    #[test]
    fn test_write_output_uses_unique_names() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path()).unwrap();
        let a = ws.write_output(b"png", "png").unwrap();
        let b = ws.write_output(b"png", "png").unwrap();
        assert_ne!(a, b);
        assert!(a.ends_with(".png"));
        assert_eq!(std::fs::read(dir.path().join(&a)).unwrap(), b"png");
    }

    #[tokio::test]
    async fn test_upload_and_download() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path()).unwrap();
        let chunks = stream::iter(vec![
            chunk("a.txt", b"hello "),
            chunk("a.txt", b"world"),
            chunk("b.bin", &[0u8; 10]),
        ]);
        let summary = ws.upload(chunks, 1024).await.unwrap();
        assert_eq!(summary.files, vec!["a.txt".to_string(), "b.bin".to_string()]);
        assert_eq!(summary.bytes, 21);
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"hello world");

        let pieces: Vec<FileChunk> = ws
            .download("a.txt", 4)
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].data, b"hell");
        assert_eq!(pieces[2].data, b"rld");
        assert!(pieces.iter().all(|c| c.filename == "a.txt"));
    }

    #[tokio::test]
    async fn test_upload_limit_aborts_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path()).unwrap();
        let chunks = stream::iter(vec![chunk("big.bin", &[1u8; 8]), chunk("big.bin", &[1u8; 8])]);
        let result = ws.upload(chunks, 10).await;
        assert!(matches!(result, Err(WorkspaceError::UploadLimitExceeded { limit: 10 })));
        assert!(!dir.path().join("big.bin").exists());
    }

    #[tokio::test]
    async fn test_local_file_uploads_under_its_name() {
        let source = tempfile::tempdir().unwrap();
        let path = source.path().join("data.csv");
        std::fs::write(&path, b"a,b\n1,2\n").unwrap();

        let chunks = file_chunks(&path, 4).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.filename == "data.csv"));

        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path()).unwrap();
        let summary = ws.upload(stream::iter(chunks), 1024).await.unwrap();
        assert_eq!(summary.files, vec!["data.csv".to_string()]);
        assert_eq!(std::fs::read(dir.path().join("data.csv")).unwrap(), b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn test_download_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path()).unwrap();
        assert!(matches!(ws.download("nope.txt", 16).await, Err(WorkspaceError::NotFound(_))));
    }
}
