use std::fmt;

use thiserror::Error;

use crate::handle::HandleError;
use crate::path::{Path, Segment};
use crate::value::Kind;

/// A 0-based position in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    /// 0-based line number
    pub line: usize,
    /// 0-based column (character offset within the line)
    pub column: usize,
    /// 0-based absolute byte offset from the start of input
    pub offset: usize,
}

/// A parse error with span information (begin..end).
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub code: String,
    pub message: String,
    /// Start of the offending region
    pub begin: Position,
    /// End of the offending region (exclusive)
    pub end: Position,
}

impl ParseError {
    pub fn syntax_error(message: String, begin: Position, end: Position) -> Self {
        ParseError {
            code: "faml-parse-syntax-error".to_string(),
            message,
            begin,
            end,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.begin == self.end {
            write!(
                f,
                "{}:{}: {} ({})",
                self.begin.line, self.begin.column, self.message, self.code
            )
        } else {
            write!(
                f,
                "{}:{}-{}:{}: {} ({})",
                self.begin.line,
                self.begin.column,
                self.end.line,
                self.end.column,
                self.message,
                self.code
            )
        }
    }
}

impl std::error::Error for ParseError {}

/// Why a single path segment failed to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PathErrorReason {
    #[error("no such field")]
    MissingField,
    #[error("index out of range (length {len})")]
    IndexOutOfRange { len: usize },
    #[error("cannot address into {found}")]
    KindMismatch { found: &'static str },
}

/// A path that stopped resolving at `segment` (the `position`-th segment of `path`).
#[derive(Debug, Clone, PartialEq, Error)]
#[error("cannot resolve `{segment}` in {}: {reason}", .path.describe())]
pub struct PathError {
    pub path: Path,
    pub position: usize,
    pub segment: Segment,
    pub reason: PathErrorReason,
}

impl PathError {
    /// The part of the path that did resolve before the failure.
    pub fn resolved_prefix(&self) -> Path {
        self.path.prefix(self.position)
    }
}

/// Coarse error classification reported across the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Parse,
    Path,
    Type,
    Cycle,
    Eval,
    Handle,
}

impl ErrorKind {
    /// Stable numeric code used by the C boundary.
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::Parse => 1,
            ErrorKind::Path => 2,
            ErrorKind::Type => 3,
            ErrorKind::Cycle => 4,
            ErrorKind::Eval => 5,
            ErrorKind::Handle => 6,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Parse => "parse",
            ErrorKind::Path => "path",
            ErrorKind::Type => "type",
            ErrorKind::Cycle => "cycle",
            ErrorKind::Eval => "eval",
            ErrorKind::Handle => "handle",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("invalid path `{input}` at offset {offset}: {message}")]
    PathSyntax {
        input: String,
        offset: usize,
        message: String,
    },

    #[error("type error at {}: expected {expected}, found {actual}", .path.describe())]
    Type {
        path: Path,
        expected: &'static str,
        actual: Kind,
    },

    #[error("type error at {}: {receiver} has no method `{method}` taking {arity} argument(s)", .path.describe())]
    UnknownMethod {
        path: Path,
        receiver: Kind,
        method: String,
        arity: usize,
    },

    #[error("cannot deserialize value: {0}")]
    Deserialize(String),

    #[error("reference cycle detected at {}", .path.describe())]
    Cycle { path: Path },

    #[error("arithmetic error at {}: {message}", .path.describe())]
    Arithmetic { path: Path, message: String },

    #[error("evaluation of {} exceeded the depth limit of {limit}", .path.describe())]
    DepthLimit { path: Path, limit: usize },

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error("boundary error: {0}")]
    Boundary(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Parse(_) => ErrorKind::Parse,
            Error::Path(_) | Error::PathSyntax { .. } => ErrorKind::Path,
            Error::Type { .. } | Error::UnknownMethod { .. } | Error::Deserialize(_) => {
                ErrorKind::Type
            }
            Error::Cycle { .. } => ErrorKind::Cycle,
            Error::Arithmetic { .. } | Error::DepthLimit { .. } => ErrorKind::Eval,
            Error::Handle(_) | Error::Boundary(_) => ErrorKind::Handle,
        }
    }

    pub(crate) fn type_mismatch(path: &Path, expected: &'static str, actual: Kind) -> Self {
        Error::Type {
            path: path.clone(),
            expected,
            actual,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
