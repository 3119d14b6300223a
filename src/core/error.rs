use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Usage,
    Overflow,
    Underflow,
    Timeout,
    FellBehind,
    Closed,
    Interrupted,
    Busy,
    Permission,
    Corrupt,
    Io,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    path: Option<PathBuf>,
    offset: Option<u64>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            path: None,
            offset: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        if let Some(offset) = self.offset {
            write!(f, " (offset: {offset})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

/// Adapts ring errors onto `std::io` so the reader and writer streams
/// compose with `BufReader`, `BufWriter` and `io::copy`.
impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err.kind() {
            ErrorKind::Usage => io::ErrorKind::InvalidInput,
            ErrorKind::Overflow => io::ErrorKind::StorageFull,
            ErrorKind::Underflow => io::ErrorKind::UnexpectedEof,
            ErrorKind::Timeout => io::ErrorKind::TimedOut,
            ErrorKind::FellBehind => io::ErrorKind::InvalidData,
            ErrorKind::Closed => io::ErrorKind::BrokenPipe,
            ErrorKind::Interrupted => io::ErrorKind::Interrupted,
            ErrorKind::Busy => io::ErrorKind::WouldBlock,
            ErrorKind::Permission => io::ErrorKind::PermissionDenied,
            ErrorKind::Corrupt => io::ErrorKind::InvalidData,
            ErrorKind::Io => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Usage => 2,
        ErrorKind::Overflow => 3,
        ErrorKind::Underflow => 4,
        ErrorKind::Timeout => 5,
        ErrorKind::FellBehind => 6,
        ErrorKind::Closed => 7,
        ErrorKind::Interrupted => 8,
        ErrorKind::Busy => 9,
        ErrorKind::Permission => 10,
        ErrorKind::Corrupt => 11,
        ErrorKind::Io => 12,
    }
}

#[cfg(test)]
mod tests {
    use super::{to_exit_code, Error, ErrorKind};
    use std::io;

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Usage, 2),
            (ErrorKind::Overflow, 3),
            (ErrorKind::Underflow, 4),
            (ErrorKind::Timeout, 5),
            (ErrorKind::FellBehind, 6),
            (ErrorKind::Closed, 7),
            (ErrorKind::Interrupted, 8),
            (ErrorKind::Busy, 9),
            (ErrorKind::Permission, 10),
            (ErrorKind::Corrupt, 11),
            (ErrorKind::Io, 12),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
        }
    }

    #[test]
    fn display_includes_context_fields() {
        let err = Error::new(ErrorKind::Corrupt)
            .with_message("header too short")
            .with_path("/tmp/ring.dat")
            .with_offset(24);
        let text = err.to_string();
        assert!(text.starts_with("Corrupt: header too short"));
        assert!(text.contains("(path: /tmp/ring.dat)"));
        assert!(text.contains("(offset: 24)"));
    }

    #[test]
    fn io_conversion_keeps_the_kind_readable() {
        let io_err: io::Error = Error::new(ErrorKind::Closed).into();
        assert_eq!(io_err.kind(), io::ErrorKind::BrokenPipe);

        let io_err: io::Error = Error::new(ErrorKind::Timeout).into();
        assert_eq!(io_err.kind(), io::ErrorKind::TimedOut);
    }
}
