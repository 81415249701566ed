//! Upload buffering.
//!
//! Content for `create_document` and `store_content` is spooled to a
//! temporary file before any path lock is taken, so slow uploads never hold
//! exclusive locks. The delegate receives a disposable file it may move into
//! place. Whatever it leaves behind is removed when the [`BufferedContent`]
//! is dropped.

use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::Arc;

use arbor_core::{ArborResult, BufferConfig, ContentSource, Token};
use arbor_storage::TokenManager;
use tempfile::{NamedTempFile, TempPath};

/// Spools content sources to temporary files.
pub struct ContentBuffer {
    config: BufferConfig,
    tokens: Option<Arc<dyn TokenManager>>,
}

impl ContentBuffer {
    pub fn new(config: BufferConfig, tokens: Option<Arc<dyn TokenManager>>) -> Self {
        Self { config, tokens }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Spool `content` to a temporary file.
    ///
    /// A file that may already be deleted after use is passed through
    /// untouched. While copying, the caller's session is refreshed every
    /// `keepalive_interval_bytes` bytes.
    pub fn buffer(&self, token: &Token, content: ContentSource) -> ArborResult<BufferedContent> {
        if content.is_disposable_file() {
            return Ok(BufferedContent {
                source: content,
                temp: None,
                bytes: 0,
            });
        }

        let mut reader = content.into_reader()?;
        let mut file = match &self.config.temp_dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };

        let mut chunk = vec![0u8; self.config.chunk_size.max(1)];
        let interval = self.config.keepalive_interval_bytes.max(1);
        let mut total: u64 = 0;
        let mut since_keepalive: u64 = 0;
        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            file.write_all(&chunk[..n])?;
            total += n as u64;
            since_keepalive += n as u64;
            if since_keepalive >= interval {
                self.keep_alive(token, total);
                since_keepalive = 0;
            }
        }
        file.flush()?;

        let temp = file.into_temp_path();
        tracing::debug!(path = %temp.display(), bytes = total, "Buffered upload to temporary file");
        Ok(BufferedContent {
            source: ContentSource::disposable_file(temp.to_path_buf()),
            temp: Some(temp),
            bytes: total,
        })
    }

    fn keep_alive(&self, token: &Token, copied: u64) {
        let Some(tokens) = &self.tokens else {
            return;
        };
        if tokens.principal(token).is_none() {
            tracing::warn!(copied, "Session no longer valid while buffering upload");
        } else {
            tracing::trace!(copied, "Refreshed session during upload");
        }
    }
}

/// A buffered content source plus the temporary file backing it.
pub struct BufferedContent {
    source: ContentSource,
    temp: Option<TempPath>,
    bytes: u64,
}

impl BufferedContent {
    /// Bytes copied into the temporary file; zero for pass-through sources.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// The temporary file, if one was written.
    pub fn temp_path(&self) -> Option<&Path> {
        self.temp.as_deref()
    }

    /// Split into the source handed to the delegate and a cleanup handle
    /// that removes the temporary file, if it still exists, on drop.
    pub fn into_parts(self) -> (ContentSource, Option<TempPath>) {
        (self.source, self.temp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::Principal;
    use arbor_storage::InMemoryTokenManager;

    fn config(dir: &Path) -> BufferConfig {
        BufferConfig {
            temp_dir: Some(dir.to_path_buf()),
            chunk_size: 4,
            keepalive_interval_bytes: 10,
        }
    }

    fn read_all(source: ContentSource) -> Vec<u8> {
        let mut out = Vec::new();
        source.into_reader().unwrap().read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_bytes_are_spooled_into_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = ContentBuffer::new(config(dir.path()), None);
        let buffered = buffer
            .buffer(&Token::new("t"), ContentSource::bytes("hello world"))
            .unwrap();
        assert_eq!(buffered.bytes(), 11);
        let temp = buffered.temp_path().unwrap().to_path_buf();
        assert!(temp.starts_with(dir.path()));

        let (source, cleanup) = buffered.into_parts();
        assert!(source.is_disposable_file());
        assert_eq!(read_all(source), b"hello world");
        drop(cleanup);
        assert!(!temp.exists());
    }

    #[test]
    fn test_disposable_file_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload");
        std::fs::write(&path, b"data").unwrap();

        let buffer = ContentBuffer::new(config(dir.path()), None);
        let buffered = buffer
            .buffer(&Token::new("t"), ContentSource::disposable_file(&path))
            .unwrap();
        assert!(buffered.temp_path().is_none());
        drop(buffered);
        assert!(path.exists());
    }

    #[test]
    fn test_kept_file_is_copied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keep");
        std::fs::write(&path, b"keep me").unwrap();

        let buffer = ContentBuffer::new(config(dir.path()), None);
        let source = ContentSource::File {
            path: path.clone(),
            delete_after_use: false,
        };
        let buffered = buffer.buffer(&Token::new("t"), source).unwrap();
        assert_ne!(buffered.temp_path().unwrap(), path.as_path());
        drop(buffered);
        assert!(path.exists());
    }

    #[test]
    fn test_keepalive_every_interval() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = Arc::new(InMemoryTokenManager::new());
        let token = tokens.register(Principal::user("alice"));
        let buffer = ContentBuffer::new(config(dir.path()), Some(tokens.clone()));

        // 4-byte chunks against a 10-byte interval: touches after 12, 24 and 36 bytes.
        buffer
            .buffer(&token, ContentSource::bytes(vec![7u8; 40]))
            .unwrap();
        assert_eq!(tokens.lookup_count(), 3);
    }

    #[test]
    fn test_read_failure_leaves_no_temp_file() {
        struct Failing;
        impl Read for Failing {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(ErrorKind::BrokenPipe, "client went away"))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let buffer = ContentBuffer::new(config(dir.path()), None);
        assert!(buffer
            .buffer(&Token::new("t"), ContentSource::stream(Failing))
            .is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
