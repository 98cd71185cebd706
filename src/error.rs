//! Top-level error types.
//!
//! Mirrors the taxonomy in the error handling design: most failures are
//! *transient* or *protocol* errors that a component downgrades into a
//! retry or a log line. [`FatalError`] is reserved for the small set of
//! *fatal-for-process* conditions: a listener that cannot be bound at
//! startup, or a configuration that cannot be made sense of at all.

use std::fmt;

/// An error that should terminate the daemon with a diagnostic.
///
/// The C original aborts the process on conditions like `pselect`
/// returning `EINVAL`/`EACCES` or allocation failure. We don't simulate
/// out-of-memory, but we do treat "no listener could be bound" and
/// "config is structurally invalid" the same way: there is nothing
/// useful left to run.
#[derive(Debug)]
pub struct FatalError {
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl FatalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for FatalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as _)
    }
}
