//! Error taxonomy and the first-error latch
//!
//! Every pipeline error carries the last-seen page title and the dump file it
//! surfaced in, so failures stay diagnosable in multi-terabyte runs.

use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Where in the dump an error surfaced.
#[derive(Debug, Clone, Default)]
pub struct PageContext {
    /// Title of the last page whose `<title>` was decoded.
    pub last_title: String,
    /// Path of the originating dump file, when the source exposes one.
    pub file: Option<PathBuf>,
}

impl PageContext {
    pub fn new(file: Option<PathBuf>) -> Self {
        Self {
            last_title: String::new(),
            file,
        }
    }
}

impl fmt::Display for PageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(path) => {
                write!(f, "last title {:?} in {:?}", self.last_title, path)?;
                if !path.exists() {
                    write!(f, " - WARNING: file not found!")?;
                }
                Ok(())
            }
            None => write!(f, "last title {:?} in unnamed stream", self.last_title),
        }
    }
}

/// Errors that can occur while ingesting a dump.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Structural violation of the expected page schema. Fatal for the
    /// enclosing file.
    #[error("invalid xml ({reason}) - {context}")]
    InvalidXml {
        reason: &'static str,
        context: PageContext,
    },

    /// The XML reader itself rejected the input. Fatal for the file.
    #[error("xml parse error: {message} - {context}")]
    Xml {
        message: String,
        context: PageContext,
    },

    /// A field inside a page could not be decoded. Fatal for the file.
    #[error("malformed {what} {value:?} - {context}")]
    Decode {
        what: &'static str,
        value: String,
        context: PageContext,
    },

    /// Underlying I/O error from the dump reader. Fatal for that file;
    /// other files continue.
    #[error("read error: {message} - {context}")]
    Reader {
        message: String,
        context: PageContext,
    },

    /// The dump source failed to yield the next reader.
    #[error("dump source error: {0}")]
    Source(#[from] std::io::Error),

    /// The pipeline was cancelled while this task was blocked.
    #[error("cancelled - {context}")]
    Cancelled { context: PageContext },
}

impl IngestError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IngestError::Cancelled { .. })
    }
}

/// One-shot error cell paired with a cancellable scope.
///
/// The first error wins: it is stored and cancels the token so every task can
/// unwind. Later errors are swallowed to avoid cascade noise. After joining
/// the pipeline, call [`FailLatch::take`] to retrieve the outcome.
#[derive(Debug)]
pub struct FailLatch {
    cancel: CancellationToken,
    first: Mutex<Option<IngestError>>,
}

impl FailLatch {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            first: Mutex::new(None),
        }
    }

    /// Token cancelled by the first latched error.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Latch `err` if no error was stored before, cancelling the scope.
    pub fn fail(&self, err: IngestError) {
        let mut slot = self
            .first
            .lock()
            .unwrap_or_else(|_| panic!("fail latch mutex poisoned"));
        if slot.is_none() {
            tracing::error!("pipeline failed: {err}");
            *slot = Some(err);
            self.cancel.cancel();
        }
    }

    /// Whether an error has been latched.
    pub fn is_failed(&self) -> bool {
        self.first
            .lock()
            .unwrap_or_else(|_| panic!("fail latch mutex poisoned"))
            .is_some()
    }

    /// The first latched error, if any. Call after the output stream closes.
    pub fn take(&self) -> Option<IngestError> {
        self.first
            .lock()
            .unwrap_or_else(|_| panic!("fail latch mutex poisoned"))
            .take()
    }
}

impl Default for FailLatch {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}
