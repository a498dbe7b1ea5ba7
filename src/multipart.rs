//! Byte sources for `multipart/form-data` uploads.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;

use crate::content_types;

/// Something that can be uploaded as one part of a multipart body.
///
/// `read` returns the whole content from the start on every call, so a body
/// can be sent again when a 307/308 redirect preserves it.
pub trait MultipartSource: Send + Sync {
    /// MIME type the source knows for itself, if any.
    fn mime_type(&self) -> Option<String>;

    fn byte_length(&self) -> u64;

    fn read(&self) -> io::Result<Bytes>;
}

/// A file opened at attach time.
pub struct FileSource {
    path: PathBuf,
    length: u64,
    file: Mutex<File>,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let length = file.metadata()?.len();
        Ok(Self {
            path,
            length,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MultipartSource for FileSource {
    fn mime_type(&self) -> Option<String> {
        None
    }

    fn byte_length(&self) -> u64 {
        self.length
    }

    fn read(&self) -> io::Result<Bytes> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::with_capacity(self.length as usize);
        file.read_to_end(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

/// In-memory content, optionally with its own MIME type.
#[derive(Debug, Clone)]
pub struct BufferSource {
    data: Bytes,
    mime_type: Option<String>,
}

impl BufferSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            mime_type: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

impl MultipartSource for BufferSource {
    fn mime_type(&self) -> Option<String> {
        self.mime_type.clone()
    }

    fn byte_length(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&self) -> io::Result<Bytes> {
        Ok(self.data.clone())
    }
}

#[derive(Clone)]
pub enum PartContent {
    Text(String),
    Source(Arc<dyn MultipartSource>),
}

impl fmt::Debug for PartContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartContent::Text(text) => f.debug_tuple("Text").field(text).finish(),
            PartContent::Source(source) => f
                .debug_struct("Source")
                .field("byte_length", &source.byte_length())
                .finish(),
        }
    }
}

/// One named section of a multipart body.
#[derive(Debug, Clone)]
pub struct Part {
    pub name: String,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub content: PartContent,
}

impl Part {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filename: None,
            mime_type: None,
            content: PartContent::Text(value.into()),
        }
    }

    /// A byte part. The MIME type comes from the source, then the filename
    /// extension, then falls back to `application/octet-stream`.
    pub fn source(
        name: impl Into<String>,
        source: Arc<dyn MultipartSource>,
        filename: Option<String>,
    ) -> Self {
        let mime_type = source.mime_type().unwrap_or_else(|| match &filename {
            Some(filename) => content_types::for_path(Path::new(filename)),
            None => content_types::OCTET_STREAM.to_string(),
        });
        Self {
            name: name.into(),
            filename,
            mime_type: Some(mime_type),
            content: PartContent::Source(source),
        }
    }

    pub fn byte_length(&self) -> u64 {
        match &self.content {
            PartContent::Text(text) => text.len() as u64,
            PartContent::Source(source) => source.byte_length(),
        }
    }
}

/// The ordered parts of a multipart request.
#[derive(Debug, Clone, Default)]
pub struct Multipart {
    parts: Vec<Part>,
}

impl Multipart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, part: Part) {
        self.parts.push(part);
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Sum of all part payloads, excluding boundaries.
    pub fn byte_length(&self) -> u64 {
        self.parts.iter().map(Part::byte_length).sum()
    }
}
