use std::fmt::{Debug, Display};

use backtrace::Backtrace;
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

/// An error from RedBTree as well as an associated backtrace.
pub struct Error {
    /// The error that occurred.
    pub kind: ErrorKind,

    backtrace: Mutex<Backtrace>,
}

impl Error {
    pub(crate) fn data_integrity(error: impl Into<Self>) -> Self {
        Self::from(ErrorKind::DataIntegrity(Box::new(error.into())))
    }

    /// Returns true if this error was caused by a key not being present in
    /// the tree.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::KeyNotFound)
    }

    /// Returns true if this error was caused by inserting a key that is
    /// already present while `replace` was not requested.
    #[must_use]
    pub const fn is_already_present(&self) -> bool {
        matches!(self.kind, ErrorKind::KeyAlreadyPresent)
    }

    /// Returns the backtrace of where this error was created.
    pub fn backtrace(&self) -> MutexGuard<'_, Backtrace> {
        let mut backtrace = self.backtrace.lock();
        backtrace.resolve();
        backtrace
    }

    fn format_backtrace_frames(&self) -> Vec<String> {
        let mut backtrace = self.backtrace.lock();
        backtrace.resolve();
        backtrace
            .frames()
            .iter()
            .filter_map(|frame| frame.symbols().first())
            .enumerate()
            .map(|(index, symbol)| {
                let mut line = format!("{index}: ");
                if let Some(name) = symbol.name() {
                    line.push_str(&name.to_string());
                    line.push(' ');
                } else if let Some(addr) = symbol.addr() {
                    line.push_str(&format!("{:x}", addr as usize));
                    line.push(' ');
                } else {
                    // Give up on formatting this one.
                    line.push_str(&format!("{symbol:?}"));
                    return line;
                }

                if let Some(file) = symbol.filename() {
                    if let Some(file) = file.to_str() {
                        line.push_str("at ");
                        line.push_str(file);
                    } else {
                        line.push_str(&format!("at {file:?}"));
                    }

                    if let Some(lineno) = symbol.lineno() {
                        line.push(':');
                        line.push_str(&lineno.to_string());
                        if let Some(col) = symbol.colno() {
                            line.push(':');
                            line.push_str(&col.to_string());
                        }
                    }
                }
                line
            })
            .collect()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.kind.source()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.kind, f)?;

        #[cfg(debug_assertions)]
        {
            f.write_str("\nstack backtrace:")?;

            for (index, frame) in self.format_backtrace_frames().into_iter().enumerate() {
                write!(f, "{index}: {frame}")?;
            }
        }

        Ok(())
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let frames = self.format_backtrace_frames();
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("backtrace", &&frames[..])
            .finish()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            backtrace: Mutex::new(Backtrace::new_unresolved()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::from(ErrorKind::from(err))
    }
}

impl From<&'static str> for Error {
    fn from(message: &'static str) -> Self {
        Self::from(ErrorKind::message(message))
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Self::from(ErrorKind::message(message))
    }
}

/// An error from RedBTree.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// An error has occurred. The string contains a human-readable error
    /// message. This error is only used in situations where a user is not
    /// expected to be able to recover automatically from the error.
    #[error("{0}")]
    Message(String),
    /// An error occurred while performing IO.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// An unrecoverable error with the data on disk has been found: a torn
    /// node image, a bad magic string, or free-list metadata that violates
    /// the format's invariants.
    #[error("an unrecoverable error with the data on disk has been found: {0}")]
    DataIntegrity(Box<Error>),
    /// The requested key is not present in the tree.
    #[error("key not found")]
    KeyNotFound,
    /// The key is already present in the tree and `replace` was not
    /// requested.
    #[error("key already present")]
    KeyAlreadyPresent,
    /// An allocation request was larger than the largest size class (2 GiB,
    /// including the 8-byte extent header).
    #[error("allocation too large")]
    AllocationTooLarge,
}

impl ErrorKind {
    /// Returns a new [`ErrorKind::Message`] instance with the message
    /// provided.
    pub(crate) fn message<S: Display>(message: S) -> Self {
        Self::Message(message.to_string())
    }
}

impl From<&'static str> for ErrorKind {
    fn from(message: &'static str) -> Self {
        Self::message(message)
    }
}

impl From<String> for ErrorKind {
    fn from(message: String) -> Self {
        Self::message(message)
    }
}
