//! Dump sources yielding per-file readers
//!
//! Acquisition and decompression live outside the pipeline; a source hands
//! the core a lazy sequence of readers over already-decompressed XML, one per
//! dump file.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, BufReader};

/// One decompressed dump file ready to be decoded.
pub struct DumpStream {
    /// Originating path, used only for error context.
    pub name: Option<PathBuf>,
    pub reader: Box<dyn AsyncBufRead + Send + Unpin>,
}

impl DumpStream {
    pub fn new(name: Option<PathBuf>, reader: Box<dyn AsyncBufRead + Send + Unpin>) -> Self {
        Self { name, reader }
    }

    /// In-memory stream over an XML document, mainly for tests.
    pub fn from_string(name: impl Into<PathBuf>, xml: impl Into<String>) -> Self {
        let cursor = std::io::Cursor::new(xml.into().into_bytes());
        Self {
            name: Some(name.into()),
            reader: Box::new(cursor),
        }
    }
}

/// Lazy sequence of readers over decompressed dump files.
///
/// Returning `Ok(None)` signals a successfully exhausted source.
#[async_trait]
pub trait DumpSource: Send {
    async fn next_stream(&mut self) -> io::Result<Option<DumpStream>>;
}

/// Walks a directory of already-decompressed `.xml` meta-history files in
/// sorted order.
pub struct FsDumpSource {
    files: std::vec::IntoIter<PathBuf>,
}

impl FsDumpSource {
    pub fn new(dir: impl AsRef<Path>) -> io::Result<Self> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().map(|ext| ext == "xml").unwrap_or(false))
            .collect();
        files.sort();
        tracing::info!("dump source found {} xml files", files.len());
        Ok(Self {
            files: files.into_iter(),
        })
    }
}

#[async_trait]
impl DumpSource for FsDumpSource {
    async fn next_stream(&mut self) -> io::Result<Option<DumpStream>> {
        match self.files.next() {
            Some(path) => {
                let file = File::open(&path).await?;
                Ok(Some(DumpStream {
                    name: Some(path),
                    reader: Box::new(BufReader::new(file)),
                }))
            }
            None => Ok(None),
        }
    }
}

/// Fixed set of in-memory XML documents, mainly for tests.
#[derive(Default)]
pub struct StaticDumpSource {
    documents: std::vec::IntoIter<(String, String)>,
}

impl StaticDumpSource {
    /// `documents` pairs a display name with the XML content.
    pub fn new(documents: Vec<(String, String)>) -> Self {
        Self {
            documents: documents.into_iter(),
        }
    }
}

#[async_trait]
impl DumpSource for StaticDumpSource {
    async fn next_stream(&mut self) -> io::Result<Option<DumpStream>> {
        Ok(self
            .documents
            .next()
            .map(|(name, xml)| DumpStream::from_string(name, xml)))
    }
}
