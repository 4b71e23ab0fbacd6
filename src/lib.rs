pub mod error;
pub mod eval;
pub mod expr;
pub mod ffi;
pub mod handle;
mod methods;
mod navigate;
pub mod parser;
pub mod path;
pub mod value;

use serde::de::DeserializeOwned;

pub use error::{Error, ErrorKind, ParseError, PathError, PathErrorReason, Position, Result};
pub use eval::EvalOptions;
pub use expr::{Anchor, BinaryOp, Branch, Expr, ExprTree, Reference, TemplatePart, UnaryOp};
pub use handle::{
    ErrorHandle, ExprHandle, Handle, HandleError, Registry, StrHandle, StrListHandle, ValueHandle,
};
pub use path::{Path, Segment};
pub use value::{Kind, Scalar, Value};

// ── Core API ───────────────────────────────────────────────────────

/// Parse FAML source into an expression tree.
pub fn parse(source: &str) -> Result<ExprTree> {
    ExprTree::parse(source)
}

/// Parse and fully evaluate FAML source.
pub fn evaluate(source: &str) -> Result<Value> {
    parse(source)?.evaluate(&Path::root())
}

/// Parse, evaluate and deserialize FAML source into `T`.
///
/// ```
/// #[derive(serde::Deserialize)]
/// struct Server {
///     host: String,
///     port: u16,
/// }
///
/// let server: Server = faml_rust::from_str("host = \"localhost\"\nport = 8000 + 80").unwrap();
/// assert_eq!(server.port, 8080);
/// ```
pub fn from_str<T: DeserializeOwned>(source: &str) -> Result<T> {
    evaluate(source)?.deserialize()
}

#[cfg(test)]
mod tests;
