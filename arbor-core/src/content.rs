//! Document content sources.

use std::fmt;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::PathBuf;

/// Where the body of a document comes from.
pub enum ContentSource {
    /// Bytes already in memory.
    Bytes(Vec<u8>),
    /// An arbitrary stream, e.g. a request body still being uploaded.
    Stream(Box<dyn Read + Send>),
    /// A file on local disk.
    File {
        path: PathBuf,
        /// The consumer may move or delete the file once it is done with it.
        delete_after_use: bool,
    },
}

impl ContentSource {
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        ContentSource::Bytes(data.into())
    }

    pub fn stream(reader: impl Read + Send + 'static) -> Self {
        ContentSource::Stream(Box::new(reader))
    }

    /// A file the consumer is allowed to take ownership of.
    pub fn disposable_file(path: impl Into<PathBuf>) -> Self {
        ContentSource::File {
            path: path.into(),
            delete_after_use: true,
        }
    }

    /// `true` if this is a file the consumer may move into place.
    pub fn is_disposable_file(&self) -> bool {
        matches!(
            self,
            ContentSource::File {
                delete_after_use: true,
                ..
            }
        )
    }

    /// Open the content for reading.
    pub fn into_reader(self) -> std::io::Result<Box<dyn Read + Send>> {
        match self {
            ContentSource::Bytes(data) => Ok(Box::new(Cursor::new(data))),
            ContentSource::Stream(reader) => Ok(reader),
            ContentSource::File { path, .. } => Ok(Box::new(File::open(path)?)),
        }
    }
}

impl fmt::Debug for ContentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentSource::Bytes(data) => f.debug_tuple("Bytes").field(&data.len()).finish(),
            ContentSource::Stream(_) => f.write_str("Stream(..)"),
            ContentSource::File {
                path,
                delete_after_use,
            } => f
                .debug_struct("File")
                .field("path", path)
                .field("delete_after_use", delete_after_use)
                .finish(),
        }
    }
}
