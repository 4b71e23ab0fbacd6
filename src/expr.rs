use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;

use crate::error::{Error, PathErrorReason};
use crate::path::{Node, Path, Segment};
use crate::value::{Scalar, Value};

/// Where a reference starts looking for its first segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Anchor {
    /// Innermost enclosing struct, searching outward.
    Scope,
    /// The document root (`base.`).
    Root,
    /// The struct enclosing the innermost one (`super.`).
    Super,
}

/// An unresolved reference to another node of the same tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub anchor: Anchor,
    pub path: Path,
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.anchor {
            Anchor::Scope => {}
            Anchor::Root => f.write_str("base.")?,
            Anchor::Super => f.write_str("super.")?,
        }
        write!(f, "{}", self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Not => "!",
            UnaryOp::BitNot => "~",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Pow,
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Shl,
    Shr,
    BitAnd,
    BitXor,
    BitOr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Pow => "**",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitXor => "^",
            BinaryOp::BitOr => "|",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    /// Binding strength; higher binds tighter.
    pub fn precedence(self) -> u8 {
        match self {
            BinaryOp::Pow => 10,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 9,
            BinaryOp::Add | BinaryOp::Sub => 8,
            BinaryOp::Shl | BinaryOp::Shr => 7,
            BinaryOp::BitAnd => 6,
            BinaryOp::BitXor => 5,
            BinaryOp::BitOr => 4,
            BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge
            | BinaryOp::Eq
            | BinaryOp::Ne => 3,
            BinaryOp::And => 2,
            BinaryOp::Or => 1,
        }
    }

    pub fn is_right_assoc(self) -> bool {
        self == BinaryOp::Pow
    }
}

/// A piece of a `$"..."` template string.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    Expr(Expr),
}

/// One `@if` alternative.
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub condition: Expr,
    pub value: Expr,
}

/// A node of the expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Scalar),
    /// Fields in declaration order.
    Struct(IndexMap<String, Expr>),
    Array(Vec<Expr>),
    Reference(Reference),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Conditional {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Template(Vec<TemplatePart>),
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        receiver: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    /// Values guarded by `@if`; the first true branch wins.
    When {
        branches: Vec<Branch>,
        default: Option<Box<Expr>>,
    },
}

impl Default for Expr {
    fn default() -> Self {
        Expr::Literal(Scalar::None)
    }
}

impl From<Scalar> for Expr {
    fn from(scalar: Scalar) -> Self {
        Expr::Literal(scalar)
    }
}

impl Expr {
    pub fn empty_struct() -> Self {
        Expr::Struct(IndexMap::new())
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Expr::Struct(_) | Expr::Array(_))
    }

    /// Literals and containers; everything else needs the evaluator.
    pub fn is_computed(&self) -> bool {
        !matches!(self, Expr::Literal(_) | Expr::Struct(_) | Expr::Array(_))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Expr::Literal(_) => "literal",
            Expr::Struct(_) => "struct",
            Expr::Array(_) => "array",
            Expr::Reference(_) => "reference",
            _ => "expression",
        }
    }

    /// Combine a repeated definition with this one.
    ///
    /// Structs merge field by field and arrays concatenate. A plain value
    /// meeting an `@if` value becomes (or replaces) its default. In every
    /// other case the later definition wins.
    pub(crate) fn merge(self, later: Expr) -> Expr {
        match (self, later) {
            (Expr::Struct(mut fields), Expr::Struct(more)) => {
                for (key, value) in more {
                    match fields.get_mut(&key) {
                        Some(slot) => {
                            let previous = std::mem::take(slot);
                            *slot = previous.merge(value);
                        }
                        None => {
                            fields.insert(key, value);
                        }
                    }
                }
                Expr::Struct(fields)
            }
            (Expr::Array(mut items), Expr::Array(more)) => {
                items.extend(more);
                Expr::Array(items)
            }
            (
                Expr::When {
                    mut branches,
                    default,
                },
                Expr::When {
                    branches: more,
                    default: later_default,
                },
            ) => {
                branches.extend(more);
                let default = match (default, later_default) {
                    (Some(a), Some(b)) => Some(Box::new(a.merge(*b))),
                    (a, None) => a,
                    (None, b) => b,
                };
                Expr::When { branches, default }
            }
            (Expr::When { branches, default }, plain) => {
                let default = match default {
                    Some(previous) => previous.merge(plain),
                    None => plain,
                };
                Expr::When {
                    branches,
                    default: Some(Box::new(default)),
                }
            }
            (plain, Expr::When { branches, default }) => {
                let default = match default {
                    Some(later) => plain.merge(*later),
                    None => plain,
                };
                Expr::When {
                    branches,
                    default: Some(Box::new(default)),
                }
            }
            (_, later) => later,
        }
    }

    /// Literal tree with the same shape as `value`.
    pub fn from_value(value: &Value) -> Expr {
        match value {
            Value::None => Expr::Literal(Scalar::None),
            Value::Bool(b) => Expr::Literal(Scalar::Bool(*b)),
            Value::Int(n) => Expr::Literal(Scalar::Int(*n)),
            Value::Float(f) => Expr::Literal(Scalar::Float(*f)),
            Value::String(s) => Expr::Literal(Scalar::String(s.clone())),
            Value::Array(items) => Expr::Array(items.iter().map(Expr::from_value).collect()),
            Value::Map(map) => Expr::Struct(
                map.iter()
                    .map(|(k, v)| (k.clone(), Expr::from_value(v)))
                    .collect(),
            ),
        }
    }
}

/// Renders source text that parses back to an equivalent expression.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(scalar) => write!(f, "{}", Value::from(scalar.clone())),
            Expr::Struct(fields) if fields.is_empty() => f.write_str("{}"),
            Expr::Struct(fields) => {
                f.write_str("{ ")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", name, value)?;
                }
                f.write_str(" }")
            }
            Expr::Array(items) => {
                f.write_str("[")?;
                write_list(f, items)?;
                f.write_str("]")
            }
            Expr::Reference(reference) => write!(f, "{}", reference),
            Expr::Unary { op, operand } => {
                f.write_str(op.symbol())?;
                write_operand(f, operand, !operand.is_atom())
            }
            Expr::Binary { op, lhs, rhs } => {
                write_operand(f, lhs, needs_parens(lhs, *op, false))?;
                write!(f, " {} ", op.symbol())?;
                write_operand(f, rhs, needs_parens(rhs, *op, true))
            }
            Expr::Conditional {
                cond,
                then,
                otherwise,
            } => {
                write_operand(f, cond, cond.is_choice())?;
                write!(f, " ? {} : {}", then, otherwise)
            }
            Expr::Template(parts) => {
                f.write_str("$\"")?;
                for part in parts {
                    match part {
                        TemplatePart::Text(text) => write_template_text(f, text)?,
                        TemplatePart::Expr(expr) => write!(f, "{{{}}}", expr)?,
                    }
                }
                f.write_str("\"")
            }
            Expr::Index { target, index } => {
                write_operand(f, target, !target.is_atom())?;
                write!(f, "[{}]", index)
            }
            Expr::Call {
                receiver,
                method,
                args,
            } => {
                write_operand(f, receiver, !receiver.is_atom())?;
                write!(f, ".{}(", method)?;
                write_list(f, args)?;
                f.write_str(")")
            }
            Expr::When { branches, default } => {
                for branch in branches {
                    write_operand(f, &branch.condition, branch.condition.is_choice())?;
                    write!(f, " ? {} : ", branch.value)?;
                }
                match default {
                    Some(default) => write!(f, "{}", default),
                    None => f.write_str("null"),
                }
            }
        }
    }
}

impl Expr {
    /// Binds tighter than any operator.
    fn is_atom(&self) -> bool {
        !matches!(
            self,
            Expr::Unary { .. } | Expr::Binary { .. } | Expr::Conditional { .. } | Expr::When { .. }
        )
    }

    fn is_choice(&self) -> bool {
        matches!(self, Expr::Conditional { .. } | Expr::When { .. })
    }
}

fn needs_parens(operand: &Expr, parent: BinaryOp, right: bool) -> bool {
    match operand {
        Expr::Binary { op, .. } => {
            op.precedence() < parent.precedence()
                || (op.precedence() == parent.precedence() && right != parent.is_right_assoc())
        }
        other => other.is_choice(),
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, operand: &Expr, parens: bool) -> fmt::Result {
    if parens {
        write!(f, "({})", operand)
    } else {
        write!(f, "{}", operand)
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

fn write_template_text(f: &mut fmt::Formatter<'_>, text: &str) -> fmt::Result {
    for ch in text.chars() {
        match ch {
            '\\' => f.write_str("\\\\")?,
            '"' => f.write_str("\\\"")?,
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            '\t' => f.write_str("\\t")?,
            '{' => f.write_str("{{")?,
            '}' => f.write_str("}}")?,
            ch => write!(f, "{}", ch)?,
        }
    }
    Ok(())
}

impl Node for Expr {
    fn child(&self, segment: &Segment) -> Result<&Self, PathErrorReason> {
        match (self, segment) {
            (Expr::Struct(fields), Segment::Field(name)) => {
                fields.get(name).ok_or(PathErrorReason::MissingField)
            }
            (Expr::Array(items), Segment::Index(index)) => items
                .get(*index)
                .ok_or(PathErrorReason::IndexOutOfRange { len: items.len() }),
            (other, _) => Err(PathErrorReason::KindMismatch {
                found: other.kind_name(),
            }),
        }
    }

    fn child_mut(&mut self, segment: &Segment) -> Result<&mut Self, PathErrorReason> {
        match (self, segment) {
            (Expr::Struct(fields), Segment::Field(name)) => {
                fields.get_mut(name).ok_or(PathErrorReason::MissingField)
            }
            (Expr::Array(items), Segment::Index(index)) => {
                let len = items.len();
                items
                    .get_mut(*index)
                    .ok_or(PathErrorReason::IndexOutOfRange { len })
            }
            (other, _) => Err(PathErrorReason::KindMismatch {
                found: other.kind_name(),
            }),
        }
    }
}

/// A parsed document: the root of an expression tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExprTree {
    root: Expr,
}

impl ExprTree {
    pub fn new(root: Expr) -> Self {
        ExprTree { root }
    }

    /// Parse source text into a tree.
    pub fn parse(source: &str) -> Result<ExprTree, Error> {
        Ok(crate::parser::parse(source)?)
    }

    pub fn from_value(value: &Value) -> Self {
        ExprTree::new(Expr::from_value(value))
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    pub fn into_root(self) -> Expr {
        self.root
    }

    /// The unevaluated node at `path`.
    pub fn get(&self, path: &Path) -> Result<&Expr, Error> {
        Ok(path.resolve(&self.root)?)
    }

    /// Replace the node at `path` with a literal.
    ///
    /// The parent of the last segment must resolve. A missing struct field is
    /// appended; an array index must already exist. The empty path replaces
    /// the whole tree.
    pub fn override_value(&mut self, path: &Path, value: impl Into<Scalar>) -> Result<(), Error> {
        let literal = Expr::Literal(value.into());
        tracing::debug!(path = %path, value = ?literal, "applying override");

        let Some((parent, segment)) = path.resolve_parent_mut(&mut self.root)? else {
            self.root = literal;
            return Ok(());
        };

        let last = path.len() - 1;
        match (parent, segment) {
            (Expr::Struct(fields), Segment::Field(name)) => {
                fields.insert(name.clone(), literal);
            }
            (Expr::Array(items), Segment::Index(index)) => {
                let len = items.len();
                let slot = items
                    .get_mut(*index)
                    .ok_or_else(|| path.error_at(last, PathErrorReason::IndexOutOfRange { len }))?;
                *slot = literal;
            }
            (other, _) => {
                let found = other.kind_name();
                return Err(path
                    .error_at(last, PathErrorReason::KindMismatch { found })
                    .into());
            }
        }
        Ok(())
    }

    pub fn override_none(&mut self, path: &Path) -> Result<(), Error> {
        self.override_value(path, Scalar::None)
    }

    pub fn override_bool(&mut self, path: &Path, value: bool) -> Result<(), Error> {
        self.override_value(path, value)
    }

    pub fn override_int(&mut self, path: &Path, value: i64) -> Result<(), Error> {
        self.override_value(path, value)
    }

    pub fn override_float(&mut self, path: &Path, value: f64) -> Result<(), Error> {
        self.override_value(path, value)
    }

    pub fn override_string(&mut self, path: &Path, value: impl Into<String>) -> Result<(), Error> {
        self.override_value(path, Scalar::String(value.into()))
    }

    /// Evaluate the whole tree and deserialize it into `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, Error> {
        self.evaluate(&Path::root())?.deserialize()
    }
}

impl FromStr for ExprTree {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExprTree::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(n: i64) -> Expr {
        Expr::Literal(Scalar::Int(n))
    }

    fn fields(entries: Vec<(&str, Expr)>) -> Expr {
        Expr::Struct(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    #[test]
    fn test_merge_structs_keeps_first_position() {
        let a = fields(vec![("x", lit(1)), ("y", lit(2))]);
        let b = fields(vec![("z", lit(3)), ("x", lit(4))]);
        let merged = a.merge(b);
        assert_eq!(merged, fields(vec![("x", lit(4)), ("y", lit(2)), ("z", lit(3))]));
    }

    #[test]
    fn test_merge_plain_into_when_becomes_default() {
        let guarded = Expr::When {
            branches: vec![Branch {
                condition: Expr::Literal(Scalar::Bool(false)),
                value: lit(2),
            }],
            default: None,
        };
        match lit(1).merge(guarded) {
            Expr::When { branches, default } => {
                assert_eq!(branches.len(), 1);
                assert_eq!(default.as_deref(), Some(&lit(1)));
            }
            other => panic!("expected a guarded value, got {:?}", other),
        }
    }

    #[test]
    fn test_override_rejects_missing_index() {
        let mut tree = ExprTree::new(fields(vec![("xs", Expr::Array(vec![lit(1)]))]));
        let err = tree
            .override_int(&Path::parse("xs[3]").unwrap(), 5)
            .unwrap_err();
        match err {
            Error::Path(err) => {
                assert_eq!(err.segment, Segment::Index(3));
                assert_eq!(err.reason, PathErrorReason::IndexOutOfRange { len: 1 });
            }
            other => panic!("expected path error, got {:?}", other),
        }
    }

    #[test]
    fn test_override_root_replaces_tree() {
        let mut tree = ExprTree::new(fields(vec![("a", lit(1))]));
        tree.override_string(&Path::root(), "flat").unwrap();
        assert_eq!(tree.root(), &Expr::Literal(Scalar::from("flat")));
    }
}
