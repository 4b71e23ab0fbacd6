//! Evaluation of expression trees into value trees.
//!
//! Nodes are located by absolute path in the originating tree. Every addressed
//! node is tracked on an active set while it evaluates, which is how reference
//! cycles are caught; leaf results are memoized for the rest of the pass.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use indexmap::IndexMap;

use crate::error::Error;
use crate::expr::{Anchor, BinaryOp, Expr, ExprTree, Reference, TemplatePart, UnaryOp};
use crate::methods;
use crate::path::{Node, Path, Segment};
use crate::value::{Kind, Value};

/// Knobs for a single evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalOptions {
    /// Nested evaluation frames allowed before giving up with `DepthLimit`.
    pub max_depth: usize,
}

impl Default for EvalOptions {
    fn default() -> Self {
        EvalOptions { max_depth: 256 }
    }
}

impl ExprTree {
    /// Evaluate the subtree at `path` (the whole tree for the empty path).
    pub fn evaluate(&self, path: &Path) -> Result<Value, Error> {
        self.evaluate_with(path, &EvalOptions::default())
    }

    pub fn evaluate_with(&self, path: &Path, options: &EvalOptions) -> Result<Value, Error> {
        tracing::debug!(path = %path, max_depth = options.max_depth, "evaluating");
        let result = Evaluator::new(self.root(), options).eval_path(path);
        if let Err(err) = &result {
            tracing::debug!(path = %path, error = %err, "evaluation failed");
        }
        result
    }

    /// Explain how the node at `path` gets its value.
    ///
    /// One line per addressed node the result depends on, sorted by path,
    /// followed by one line per leaf under `path`. A line shows the source
    /// expression and, when it differs from the source, the value it
    /// evaluates to:
    ///
    /// ```text
    /// hello.value = 12
    /// hello.name = $"hello world {value + 12}"  # "hello world 24"
    /// ```
    pub fn trace(&self, path: &Path) -> Result<String, Error> {
        let options = EvalOptions::default();
        let mut evaluator = Evaluator::new(self.root(), &options);
        evaluator.eval_path(path)?;

        let mut targets = Vec::new();
        evaluator.collect_leaves(path, &mut targets);
        let mut seen: HashSet<Path> = targets.iter().cloned().collect();
        let mut pending: Vec<Path> = targets
            .iter()
            .flat_map(|target| evaluator.dependencies(target))
            .collect();

        let mut lines = BTreeMap::new();
        while let Some(dependency) = pending.pop() {
            let mut leaves = Vec::new();
            evaluator.collect_leaves(&dependency, &mut leaves);
            for leaf in leaves {
                if seen.insert(leaf.clone()) {
                    pending.extend(evaluator.dependencies(&leaf));
                    lines.insert(leaf.to_string(), evaluator.trace_line(&leaf)?);
                }
            }
        }

        let mut lines: Vec<String> = lines.into_values().collect();
        for target in &targets {
            lines.push(evaluator.trace_line(target)?);
        }
        Ok(lines.join("\n"))
    }
}

struct Evaluator<'t> {
    root: &'t Expr,
    options: &'t EvalOptions,
    memo: HashMap<Path, Value>,
    active: HashSet<Path>,
    depth: usize,
}

impl<'t> Evaluator<'t> {
    fn new(root: &'t Expr, options: &'t EvalOptions) -> Self {
        Evaluator {
            root,
            options,
            memo: HashMap::new(),
            active: HashSet::new(),
            depth: 0,
        }
    }

    /// Evaluate the node at an absolute path.
    ///
    /// The walk is structural until it meets a computed node; that prefix is
    /// evaluated and the rest of the path is navigated in its value.
    fn eval_path(&mut self, path: &Path) -> Result<Value, Error> {
        let mut node = self.root;
        let mut scope = Path::root();
        for (position, segment) in path.segments().iter().enumerate() {
            if node.is_computed() {
                let prefix = path.prefix(position);
                let value = self.eval_tracked(&prefix, node, &scope)?;
                return navigate(&value, path, position).cloned();
            }
            if matches!(node, Expr::Struct(_)) {
                scope = path.prefix(position);
            }
            node = locate_child(node, path, position, segment)?;
        }
        self.eval_tracked(path, node, &scope)
    }

    fn eval_tracked(&mut self, path: &Path, node: &'t Expr, scope: &Path) -> Result<Value, Error> {
        if let Some(value) = self.memo.get(path) {
            tracing::trace!(path = %path, "memo hit");
            return Ok(value.clone());
        }
        if !self.active.insert(path.clone()) {
            return Err(Error::Cycle { path: path.clone() });
        }

        let result = self.enter(path, |this| this.eval_node(path, node, scope));
        self.active.remove(path);

        let value = result?;
        if !node.is_container() {
            self.memo.insert(path.clone(), value.clone());
        }
        Ok(value)
    }

    /// Run `f` one frame deeper, failing once the depth limit is reached.
    fn enter<T>(
        &mut self,
        path: &Path,
        f: impl FnOnce(&mut Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        if self.depth >= self.options.max_depth {
            return Err(Error::DepthLimit {
                path: path.clone(),
                limit: self.options.max_depth,
            });
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    /// `scope` is the innermost struct enclosing `node`.
    fn eval_node(&mut self, path: &Path, node: &'t Expr, scope: &Path) -> Result<Value, Error> {
        match node {
            Expr::Struct(fields) => {
                let mut map = IndexMap::with_capacity(fields.len());
                for (name, child) in fields {
                    let value = self.eval_tracked(&path.field(name), child, path)?;
                    map.insert(name.clone(), value);
                }
                Ok(Value::Map(map))
            }
            Expr::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    values.push(self.eval_tracked(&path.index(index), item, scope)?);
                }
                Ok(Value::Array(values))
            }
            computed => self.eval_computed(computed, path, scope),
        }
    }

    /// Evaluate an expression that has no address of its own. `site` is the
    /// path of the node it belongs to and is used for diagnostics.
    fn eval_computed(&mut self, expr: &'t Expr, site: &Path, scope: &Path) -> Result<Value, Error> {
        match expr {
            Expr::Literal(scalar) => Ok(scalar.clone().into()),
            Expr::Reference(reference) => self.resolve_reference(reference, scope),
            compound => self.enter(site, |this| this.eval_compound(compound, site, scope)),
        }
    }

    /// One level of a compound expression; every level costs a frame of
    /// the depth limit.
    fn eval_compound(&mut self, expr: &'t Expr, site: &Path, scope: &Path) -> Result<Value, Error> {
        match expr {
            Expr::Literal(_) | Expr::Reference(_) => self.eval_computed(expr, site, scope),
            Expr::Struct(fields) => {
                let mut map = IndexMap::with_capacity(fields.len());
                for (name, child) in fields {
                    map.insert(name.clone(), self.eval_computed(child, site, scope)?);
                }
                Ok(Value::Map(map))
            }
            Expr::Array(items) => items
                .iter()
                .map(|item| self.eval_computed(item, site, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Unary { op, operand } => {
                let operand = self.eval_computed(operand, site, scope)?;
                unary(*op, operand, site)
            }
            Expr::Binary {
                op: op @ (BinaryOp::And | BinaryOp::Or),
                lhs,
                rhs,
            } => {
                let lhs = self.eval_bool(lhs, site, scope)?;
                match (op, lhs) {
                    (BinaryOp::And, false) => Ok(Value::Bool(false)),
                    (BinaryOp::Or, true) => Ok(Value::Bool(true)),
                    _ => Ok(Value::Bool(self.eval_bool(rhs, site, scope)?)),
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.eval_computed(lhs, site, scope)?;
                let rhs = self.eval_computed(rhs, site, scope)?;
                binary(*op, lhs, rhs, site)
            }
            Expr::Conditional {
                cond,
                then,
                otherwise,
            } => {
                if self.eval_bool(cond, site, scope)? {
                    self.eval_computed(then, site, scope)
                } else {
                    self.eval_computed(otherwise, site, scope)
                }
            }
            Expr::Template(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Text(text) => out.push_str(text),
                        TemplatePart::Expr(expr) => {
                            out.push_str(&self.eval_computed(expr, site, scope)?.to_text())
                        }
                    }
                }
                Ok(Value::String(out))
            }
            Expr::Index { target, index } => {
                let target = self.eval_computed(target, site, scope)?;
                let index = self.eval_computed(index, site, scope)?;
                index_value(target, index, site)
            }
            Expr::Call {
                receiver,
                method,
                args,
            } => {
                let receiver = self.eval_computed(receiver, site, scope)?;
                let args = args
                    .iter()
                    .map(|arg| self.eval_computed(arg, site, scope))
                    .collect::<Result<Vec<_>, _>>()?;
                methods::invoke(site, &receiver, method, &args)
            }
            Expr::When { branches, default } => {
                for branch in branches {
                    if self.eval_bool(&branch.condition, site, scope)? {
                        return self.eval_computed(&branch.value, site, scope);
                    }
                }
                match default {
                    Some(default) => self.eval_computed(default, site, scope),
                    None => Ok(Value::None),
                }
            }
        }
    }

    fn eval_bool(&mut self, expr: &'t Expr, site: &Path, scope: &Path) -> Result<bool, Error> {
        match self.eval_computed(expr, site, scope)? {
            Value::Bool(b) => Ok(b),
            other => Err(Error::type_mismatch(site, "bool", other.kind())),
        }
    }

    fn resolve_reference(&mut self, reference: &Reference, scope: &Path) -> Result<Value, Error> {
        let target = self.reference_target(reference, scope);
        tracing::trace!(reference = %reference, target = %target, "resolving reference");
        self.eval_path(&target)
    }

    /// Absolute path a reference written in `scope` points at.
    fn reference_target(&self, reference: &Reference, scope: &Path) -> Path {
        let base = match reference.anchor {
            Anchor::Root => Path::root(),
            Anchor::Super => self.enclosing_struct(scope, scope.len()),
            Anchor::Scope => self.binding_scope(&reference.path, scope),
        };
        base.join(&reference.path)
    }

    /// The innermost struct, from `scope` outward, that has a field named by
    /// the first segment. Falls back to `scope` itself.
    fn binding_scope(&self, reference: &Path, scope: &Path) -> Path {
        let Some(Segment::Field(first)) = reference.first() else {
            return scope.clone();
        };
        (0..=scope.len())
            .rev()
            .map(|len| scope.prefix(len))
            .find(|candidate| {
                matches!(
                    candidate.resolve(self.root),
                    Ok(Expr::Struct(fields)) if fields.contains_key(first)
                )
            })
            .unwrap_or_else(|| scope.clone())
    }

    /// The nearest struct strictly above the first `len` segments of `scope`.
    fn enclosing_struct(&self, scope: &Path, len: usize) -> Path {
        (0..len)
            .rev()
            .map(|len| scope.prefix(len))
            .find(|candidate| matches!(candidate.resolve(self.root), Ok(Expr::Struct(_))))
            .unwrap_or_default()
    }

    // ── Tracing ─────────────────────────────────────────────────────

    /// The authored node at `path` and its scope, unless the path runs
    /// through a computed node or does not resolve.
    fn locate(&self, path: &Path) -> Option<(&'t Expr, Path)> {
        let mut node = self.root;
        let mut scope = Path::root();
        for (position, segment) in path.segments().iter().enumerate() {
            if matches!(node, Expr::Struct(_)) {
                scope = path.prefix(position);
            }
            node = node.child(segment).ok()?;
        }
        Some((node, scope))
    }

    /// Addressed leaves at or under `path`, in document order.
    fn collect_leaves(&self, path: &Path, out: &mut Vec<Path>) {
        match self.locate(path) {
            Some((Expr::Struct(fields), _)) => {
                for name in fields.keys() {
                    self.collect_leaves(&path.field(name), out);
                }
            }
            Some((Expr::Array(items), _)) => {
                for index in 0..items.len() {
                    self.collect_leaves(&path.index(index), out);
                }
            }
            _ => out.push(path.clone()),
        }
    }

    /// Targets of the references written directly in the leaf at `path`.
    fn dependencies(&self, path: &Path) -> Vec<Path> {
        let Some((node, scope)) = self.locate(path) else {
            return Vec::new();
        };
        let mut references = Vec::new();
        collect_references(node, &mut references);
        references
            .into_iter()
            .map(|reference| self.reference_target(reference, &scope))
            .collect()
    }

    fn trace_line(&mut self, path: &Path) -> Result<String, Error> {
        let value = self.eval_path(path)?.to_string();
        Ok(match self.locate(path) {
            Some((node, _)) if node.to_string() != value => {
                format!("{} = {}  # {}", path, node, value)
            }
            _ => format!("{} = {}", path, value),
        })
    }
}

fn collect_references<'e>(expr: &'e Expr, out: &mut Vec<&'e Reference>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Reference(reference) => out.push(reference),
        Expr::Struct(fields) => fields.values().for_each(|e| collect_references(e, out)),
        Expr::Array(items) => items.iter().for_each(|e| collect_references(e, out)),
        Expr::Unary { operand, .. } => collect_references(operand, out),
        Expr::Binary { lhs, rhs, .. } => {
            collect_references(lhs, out);
            collect_references(rhs, out);
        }
        Expr::Conditional {
            cond,
            then,
            otherwise,
        } => {
            collect_references(cond, out);
            collect_references(then, out);
            collect_references(otherwise, out);
        }
        Expr::Template(parts) => {
            for part in parts {
                if let TemplatePart::Expr(expr) = part {
                    collect_references(expr, out);
                }
            }
        }
        Expr::Index { target, index } => {
            collect_references(target, out);
            collect_references(index, out);
        }
        Expr::Call { receiver, args, .. } => {
            collect_references(receiver, out);
            args.iter().for_each(|e| collect_references(e, out));
        }
        Expr::When { branches, default } => {
            for branch in branches {
                collect_references(&branch.condition, out);
                collect_references(&branch.value, out);
            }
            if let Some(default) = default {
                collect_references(default, out);
            }
        }
    }
}

fn locate_child<'t>(
    node: &'t Expr,
    path: &Path,
    position: usize,
    segment: &Segment,
) -> Result<&'t Expr, Error> {
    node.child(segment)
        .map_err(|reason| path.error_at(position, reason).into())
}

/// Navigate the segments of `path` from `start` onward inside `value`,
/// reporting failures against the full path.
fn navigate<'v>(value: &'v Value, path: &Path, start: usize) -> Result<&'v Value, Error> {
    path.suffix(start)
        .resolve(value)
        .map_err(|err| path.error_at(start + err.position, err.reason).into())
}

fn index_value(target: Value, index: Value, site: &Path) -> Result<Value, Error> {
    let segment = match (&target, index) {
        (Value::Array(_), Value::Int(n)) => match usize::try_from(n) {
            Ok(n) => Segment::Index(n),
            Err(_) => {
                return Err(Error::Arithmetic {
                    path: site.clone(),
                    message: format!("negative index {}", n),
                })
            }
        },
        (Value::Map(_), Value::String(key)) => Segment::Field(key),
        (Value::Array(_), other) => return Err(Error::type_mismatch(site, "int", other.kind())),
        (Value::Map(_), other) => return Err(Error::type_mismatch(site, "string", other.kind())),
        (other, _) => return Err(Error::type_mismatch(site, "array or map", other.kind())),
    };
    navigate(&target, &site.child(segment), site.len()).cloned()
}

// ── Operators ───────────────────────────────────────────────────────

fn overflow(site: &Path, op: &str) -> Error {
    Error::Arithmetic {
        path: site.clone(),
        message: format!("integer overflow in `{}`", op),
    }
}

fn unary(op: UnaryOp, operand: Value, site: &Path) -> Result<Value, Error> {
    match (op, operand) {
        (UnaryOp::Neg, Value::Int(n)) => n
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| overflow(site, op.symbol())),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, other) => Err(Error::type_mismatch(site, "number", other.kind())),
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Not, other) => Err(Error::type_mismatch(site, "bool", other.kind())),
        (UnaryOp::BitNot, Value::Int(n)) => Ok(Value::Int(!n)),
        (UnaryOp::BitNot, other) => Err(Error::type_mismatch(site, "int", other.kind())),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Int(n) => Some(*n as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

/// Structural equality; ints and floats compare numerically and maps ignore
/// key order.
pub(crate) fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Map(a), Value::Map(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, x)| b.get(key).is_some_and(|y| values_equal(x, y)))
        }
        (a, b) => a == b,
    }
}

fn compare(lhs: &Value, rhs: &Value, site: &Path) -> Result<Option<Ordering>, Error> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Ok(Some(a.cmp(b))),
        (Value::String(a), Value::String(b)) => Ok(Some(a.cmp(b))),
        (Value::Int(_) | Value::Float(_), _) => match as_f64(rhs) {
            Some(b) => Ok(as_f64(lhs).and_then(|a| a.partial_cmp(&b))),
            None => Err(Error::type_mismatch(site, "number", rhs.kind())),
        },
        (Value::String(_), other) => Err(Error::type_mismatch(site, "string", other.kind())),
        (other, _) => Err(Error::type_mismatch(site, "number or string", other.kind())),
    }
}

/// Right over left, recursively for nested maps.
fn merge_values(lhs: Value, rhs: Value) -> Value {
    match (lhs, rhs) {
        (Value::Map(mut left), Value::Map(right)) => {
            for (key, value) in right {
                match left.get_mut(&key) {
                    Some(slot) => {
                        let previous = std::mem::take(slot);
                        *slot = merge_values(previous, value);
                    }
                    None => {
                        left.insert(key, value);
                    }
                }
            }
            Value::Map(left)
        }
        (_, rhs) => rhs,
    }
}

fn int_op(op: BinaryOp, a: i64, b: i64, site: &Path) -> Result<Value, Error> {
    let divide_by_zero = || Error::Arithmetic {
        path: site.clone(),
        message: "division by zero".to_string(),
    };
    let checked = match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Sub => a.checked_sub(b),
        BinaryOp::Mul => a.checked_mul(b),
        BinaryOp::Div if b == 0 => return Err(divide_by_zero()),
        BinaryOp::Div => a.checked_div(b),
        BinaryOp::Rem if b == 0 => return Err(divide_by_zero()),
        BinaryOp::Rem => a.checked_rem(b),
        BinaryOp::Pow if b < 0 => return Ok(Value::Float((a as f64).powf(b as f64))),
        BinaryOp::Pow => u32::try_from(b).ok().and_then(|b| a.checked_pow(b)),
        BinaryOp::Shl | BinaryOp::Shr => {
            let Some(shift) = u32::try_from(b).ok().filter(|s| *s < 64) else {
                return Err(Error::Arithmetic {
                    path: site.clone(),
                    message: format!("shift amount {} out of range", b),
                });
            };
            if op == BinaryOp::Shl {
                a.checked_shl(shift)
            } else {
                a.checked_shr(shift)
            }
        }
        BinaryOp::BitAnd => Some(a & b),
        BinaryOp::BitXor => Some(a ^ b),
        BinaryOp::BitOr => Some(a | b),
        _ => return Err(Error::type_mismatch(site, "number", Kind::Int)),
    };
    checked
        .map(Value::Int)
        .ok_or_else(|| overflow(site, op.symbol()))
}

fn float_op(op: BinaryOp, a: f64, b: f64, site: &Path) -> Result<Value, Error> {
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        BinaryOp::Pow => a.powf(b),
        _ => return Err(Error::type_mismatch(site, "int", Kind::Float)),
    };
    Ok(Value::Float(result))
}

/// Largest string, in bytes, that `*` or `repeat()` may build.
pub(crate) const MAX_REPEAT_LEN: usize = 16 * 1024 * 1024;

pub(crate) fn repeat(s: &str, count: i64, site: &Path) -> Result<Value, Error> {
    let arithmetic = |message: String| Error::Arithmetic {
        path: site.clone(),
        message,
    };
    let count = usize::try_from(count)
        .map_err(|_| arithmetic(format!("negative repeat count {}", count)))?;
    match s.len().checked_mul(count) {
        Some(len) if len <= MAX_REPEAT_LEN => Ok(Value::String(s.repeat(count))),
        _ => Err(arithmetic(format!(
            "repeating {} bytes {} times exceeds {} bytes",
            s.len(),
            count,
            MAX_REPEAT_LEN
        ))),
    }
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value, site: &Path) -> Result<Value, Error> {
    use BinaryOp::*;

    match op {
        Eq => return Ok(Value::Bool(values_equal(&lhs, &rhs))),
        Ne => return Ok(Value::Bool(!values_equal(&lhs, &rhs))),
        Lt | Le | Gt | Ge => {
            let ordering = compare(&lhs, &rhs, site)?;
            let result = match op {
                Lt => ordering == Some(Ordering::Less),
                Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
                Gt => ordering == Some(Ordering::Greater),
                _ => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
            };
            return Ok(Value::Bool(result));
        }
        _ => {}
    }

    match (op, lhs, rhs) {
        (_, Value::Int(a), Value::Int(b)) => int_op(op, a, b, site),
        (Add | Sub | Mul | Div | Rem | Pow, Value::Float(a), Value::Float(b)) => {
            float_op(op, a, b, site)
        }
        (Add | Sub | Mul | Div | Rem | Pow, Value::Int(a), Value::Float(b)) => {
            float_op(op, a as f64, b, site)
        }
        (Add | Sub | Mul | Div | Rem | Pow, Value::Float(a), Value::Int(b)) => {
            float_op(op, a, b as f64, site)
        }
        (BitAnd, Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(a & b)),
        (BitXor, Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(a ^ b)),
        (BitOr, Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(a | b)),
        (Add, Value::String(mut a), Value::String(b)) => {
            a.push_str(&b);
            Ok(Value::String(a))
        }
        (Mul, Value::String(s), Value::Int(n)) | (Mul, Value::Int(n), Value::String(s)) => {
            repeat(&s, n, site)
        }
        (Add, Value::Array(mut a), Value::Array(b)) => {
            a.extend(b);
            Ok(Value::Array(a))
        }
        (Add, lhs @ Value::Map(_), rhs @ Value::Map(_)) => Ok(merge_values(lhs, rhs)),
        (_, lhs, rhs) => {
            let expected = match lhs {
                Value::Int(_) | Value::Float(_) => "number",
                Value::String(_) => "string",
                Value::Array(_) => "array",
                Value::Map(_) => "map",
                Value::Bool(_) => "bool",
                Value::None => {
                    return Err(Error::type_mismatch(site, "number", Kind::None));
                }
            };
            // Report the operand that broke the pairing.
            let actual = if matches!(
                (&lhs, &rhs),
                (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_))
            ) || lhs.kind() == rhs.kind()
            {
                lhs.kind()
            } else {
                rhs.kind()
            };
            Err(Error::type_mismatch(site, expected, actual))
        }
    }
}
