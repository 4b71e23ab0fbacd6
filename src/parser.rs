use crate::error::{ParseError, Position};
use crate::expr::{Anchor, BinaryOp, Branch, Expr, ExprTree, Reference, TemplatePart, UnaryOp};
use crate::path::Path;
use crate::value::Scalar;

/// Deepest expression nesting accepted before the parser gives up.
const MAX_NESTING: usize = 128;

/// Binary operator tokens, longest first so `**` wins over `*`.
const BINARY_OPS: &[(&str, BinaryOp)] = &[
    ("**", BinaryOp::Pow),
    ("<<", BinaryOp::Shl),
    (">>", BinaryOp::Shr),
    ("<=", BinaryOp::Le),
    (">=", BinaryOp::Ge),
    ("==", BinaryOp::Eq),
    ("!=", BinaryOp::Ne),
    ("&&", BinaryOp::And),
    ("||", BinaryOp::Or),
    ("*", BinaryOp::Mul),
    ("/", BinaryOp::Div),
    ("%", BinaryOp::Rem),
    ("+", BinaryOp::Add),
    ("-", BinaryOp::Sub),
    ("<", BinaryOp::Lt),
    (">", BinaryOp::Gt),
    ("&", BinaryOp::BitAnd),
    ("^", BinaryOp::BitXor),
    ("|", BinaryOp::BitOr),
];

/// Parser state: tracks position in the input string.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
    /// Open brackets around the current expression. Inside any, newlines
    /// are plain whitespace.
    brackets: usize,
    depth: usize,
}

/// Parse a document into an expression tree.
pub fn parse(input: &str) -> Result<ExprTree, ParseError> {
    let mut parser = Parser {
        input,
        pos: 0,
        brackets: 0,
        depth: 0,
    };
    let root = parser.parse_document()?;
    Ok(ExprTree::new(root))
}

impl<'a> Parser<'a> {
    // ── Helpers ──────────────────────────────────────────────────────

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek_char(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        self.remaining().chars().nth(1)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    fn starts_with(&self, s: &str) -> bool {
        self.remaining().starts_with(s)
    }

    fn eat_char(&mut self, ch: char) -> bool {
        if self.peek_char() == Some(ch) {
            self.advance(ch.len_utf8());
            true
        } else {
            false
        }
    }

    fn expect_char(&mut self, ch: char) -> Result<(), ParseError> {
        if self.eat_char(ch) {
            Ok(())
        } else {
            Err(self.error_point(format!("Expected '{}'", ch)))
        }
    }

    /// Line and column of a byte offset. Only computed when an error is built.
    fn position_at(&self, offset: usize) -> Position {
        let consumed = &self.input[..offset];
        let line = consumed.matches('\n').count();
        let last_newline = consumed.rfind('\n').map(|i| i + 1).unwrap_or(0);
        let column = consumed[last_newline..].chars().count();
        Position {
            line,
            column,
            offset,
        }
    }

    /// Create an error at a single point (current position).
    fn error_point(&self, message: String) -> ParseError {
        self.error_between(message, self.pos, self.pos)
    }

    /// Create an error spanning from the `begin` offset to the current position.
    fn error_span(&self, message: String, begin: usize) -> ParseError {
        self.error_between(message, begin, self.pos)
    }

    fn error_between(&self, message: String, begin: usize, end: usize) -> ParseError {
        ParseError::syntax_error(message, self.position_at(begin), self.position_at(end))
    }

    /// Count one more level of tree depth, failing past `MAX_NESTING`.
    fn deepen(&mut self) -> Result<(), ParseError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error_point(format!(
                "Expression nested deeper than {} levels",
                MAX_NESTING
            )));
        }
        self.depth += 1;
        Ok(())
    }

    /// Run `f` and restore the nesting depth afterwards, however many
    /// levels `f` added through `deepen`.
    fn scoped<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ParseError>,
    ) -> Result<T, ParseError> {
        let depth = self.depth;
        let result = f(self);
        self.depth = depth;
        result
    }

    /// Run `f` one nesting level deeper.
    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ParseError>,
    ) -> Result<T, ParseError> {
        self.scoped(|p| {
            p.deepen()?;
            f(p)
        })
    }

    // ── Whitespace & Comments ───────────────────────────────────────

    fn skip_comment(&mut self) -> bool {
        if self.peek_char() == Some('#') || self.starts_with("//") {
            while let Some(ch) = self.peek_char() {
                if ch == '\r' || ch == '\n' {
                    break;
                }
                self.advance(ch.len_utf8());
            }
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        loop {
            while let Some(ch) = self.peek_char() {
                if ch == ' ' || ch == '\t' || ch == '\r' || ch == '\n' {
                    self.advance(ch.len_utf8());
                } else {
                    break;
                }
            }
            if !self.skip_comment() {
                break;
            }
        }
    }

    /// Spaces and tabs only; a newline ends a statement.
    fn skip_inline_ws(&mut self) {
        while let Some(ch) = self.peek_char() {
            if ch == ' ' || ch == '\t' {
                self.advance(1);
            } else {
                break;
            }
        }
    }

    /// Whitespace allowed between the operands of an expression.
    fn skip_expr_ws(&mut self) {
        if self.brackets > 0 {
            self.skip_ws();
        } else {
            self.skip_inline_ws();
        }
    }

    /// Like `skip_ws`, but also eats commas, which may separate statements.
    fn skip_ws_and_commas(&mut self) {
        self.skip_ws();
        while self.peek_char() == Some(',') {
            self.advance(1);
            self.skip_ws();
        }
    }

    // ── Document & Statements ───────────────────────────────────────

    fn parse_document(&mut self) -> Result<Expr, ParseError> {
        self.skip_ws_and_commas();

        if self.peek_char() == Some('{') {
            let root = self.parse_map()?;
            self.skip_ws_and_commas();
            if !self.at_end() {
                return Err(self.error_point("Unexpected content after document".to_string()));
            }
            return Ok(root);
        }

        let mut root = Expr::empty_struct();
        let mut section = Path::root();
        let mut section_condition: Option<Expr> = None;

        while !self.at_end() {
            let condition = if self.peek_char() == Some('@') {
                let condition = self.parse_annotation()?;
                self.skip_ws();
                Some(condition)
            } else {
                None
            };

            let begin = self.pos;
            if self.starts_with("[[") {
                self.advance(2);
                let keys = self.parse_header_keys()?;
                if !self.starts_with("]]") {
                    return Err(self.error_point("Expected ']]'".to_string()));
                }
                self.advance(2);
                section = append_table(&mut root, &keys)
                    .map_err(|message| self.error_span(message, begin))?;
                section_condition = condition;
            } else if self.peek_char() == Some('[') {
                self.advance(1);
                let keys = self.parse_header_keys()?;
                self.expect_char(']')?;
                section = open_table(&mut root, &keys)
                    .map_err(|message| self.error_span(message, begin))?;
                section_condition = condition;
            } else {
                let keys = self.parse_key()?;
                let key_end = self.pos;
                self.skip_inline_ws();
                if !self.eat_char('=') && !self.eat_char(':') {
                    return Err(self.error_point("Expected '=' or ':' after key".to_string()));
                }
                self.skip_ws();
                let value = self.parse_expr()?;
                let value = match combine_conditions(section_condition.clone(), condition) {
                    Some(condition) => Expr::When {
                        branches: vec![Branch { condition, value }],
                        default: None,
                    },
                    None => value,
                };
                assign(&mut root, &section, &keys, value)
                    .map_err(|message| self.error_between(message, begin, key_end))?;
            }

            self.expect_statement_end()?;
            self.skip_ws_and_commas();
        }

        Ok(root)
    }

    /// After a statement only a comment, a comma or a line break may follow.
    fn expect_statement_end(&mut self) -> Result<(), ParseError> {
        self.skip_inline_ws();
        match self.peek_char() {
            None | Some('\n') | Some('\r') | Some(',') => Ok(()),
            _ if self.skip_comment() => Ok(()),
            _ => Err(self.error_point("Expected end of line".to_string())),
        }
    }

    /// `@if <expr>`
    fn parse_annotation(&mut self) -> Result<Expr, ParseError> {
        let begin = self.pos;
        self.expect_char('@')?;
        let name = self.parse_identifier()?;
        if name != "if" {
            return Err(self.error_span(
                format!("Unknown annotation @{}; expected @if", name),
                begin,
            ));
        }
        self.skip_inline_ws();
        self.parse_expr()
    }

    fn parse_header_keys(&mut self) -> Result<Vec<String>, ParseError> {
        self.skip_inline_ws();
        let keys = self.parse_key()?;
        self.skip_inline_ws();
        Ok(keys)
    }

    // ── Keys ────────────────────────────────────────────────────────

    /// Dotted key: `a.b-c.d`
    fn parse_key(&mut self) -> Result<Vec<String>, ParseError> {
        let mut keys = vec![self.parse_key_segment()?];
        while self.peek_char() == Some('.') {
            self.advance(1);
            keys.push(self.parse_key_segment()?);
        }
        Ok(keys)
    }

    fn parse_key_segment(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        match self.peek_char() {
            Some(ch) if is_ident_start(ch) => self.advance(1),
            _ => return Err(self.error_point("Expected a key".to_string())),
        }
        while let Some(ch) = self.peek_char() {
            if is_ident_char(ch) || ch == '-' {
                self.advance(1);
            } else {
                break;
            }
        }
        Ok(self.input[start..self.pos].to_string())
    }

    /// Identifier inside an expression; `-` is an operator there.
    fn parse_identifier(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        match self.peek_char() {
            Some(ch) if is_ident_start(ch) => self.advance(1),
            _ => return Err(self.error_point("Expected an identifier".to_string())),
        }
        while let Some(ch) = self.peek_char() {
            if is_ident_char(ch) {
                self.advance(1);
            } else {
                break;
            }
        }
        Ok(self.input[start..self.pos].to_string())
    }

    // ── Expressions ─────────────────────────────────────────────────

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.nested(|p| p.parse_ternary())
    }

    fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_binary(1)?;
        let saved = self.pos;
        self.skip_expr_ws();
        if !self.eat_char('?') {
            self.pos = saved;
            return Ok(cond);
        }
        self.skip_ws();
        let then = self.parse_expr()?;
        self.skip_ws();
        self.expect_char(':')?;
        self.skip_ws();
        let otherwise = self.parse_expr()?;
        Ok(Expr::Conditional {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn peek_binary_op(&self) -> Option<(BinaryOp, usize)> {
        if self.starts_with("//") {
            return None;
        }
        BINARY_OPS
            .iter()
            .find(|(token, _)| self.starts_with(token))
            .map(|(token, op)| (*op, token.len()))
    }

    /// Precedence climbing over `BINARY_OPS`. Every operator folded into
    /// the left operand is one more level of tree depth.
    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, ParseError> {
        self.scoped(|p| p.parse_binary_chain(min_prec))
    }

    fn parse_binary_chain(&mut self, min_prec: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let saved = self.pos;
            self.skip_expr_ws();
            let Some((op, len)) = self.peek_binary_op() else {
                self.pos = saved;
                break;
            };
            let prec = op.precedence();
            if prec < min_prec {
                self.pos = saved;
                break;
            }
            self.advance(len);
            self.deepen()?;
            self.skip_ws();
            let next_min = if op.is_right_assoc() { prec } else { prec + 1 };
            let rhs = self.nested(|p| p.parse_binary(next_min))?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek_char() {
            Some('-') if self.peek_second().is_some_and(|c| c.is_ascii_digit()) => {
                return self.parse_postfix();
            }
            Some('-') => UnaryOp::Neg,
            Some('!') => UnaryOp::Not,
            Some('~') => UnaryOp::BitNot,
            _ => return self.parse_postfix(),
        };
        self.advance(1);
        self.skip_ws();
        let operand = self.nested(|p| p.parse_unary())?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    /// Method calls and index expressions wrap the expression before them,
    /// so each one counts against the nesting limit. Field and literal index
    /// steps on a reference only extend its path.
    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        self.scoped(|p| p.parse_postfix_chain())
    }

    fn parse_postfix_chain(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek_char() {
                Some('.') if self.peek_second().is_some_and(is_ident_start) => {
                    self.advance(1);
                    let name = self.parse_identifier()?;
                    if self.peek_char() == Some('(') {
                        self.deepen()?;
                        let args = self.parse_args()?;
                        expr = Expr::Call {
                            receiver: Box::new(expr),
                            method: name,
                            args,
                        };
                    } else if let Expr::Reference(reference) = &mut expr {
                        reference.path = reference.path.field(&name);
                    } else {
                        self.deepen()?;
                        expr = Expr::Index {
                            target: Box::new(expr),
                            index: Box::new(Expr::Literal(Scalar::String(name))),
                        };
                    }
                }
                Some('[') => {
                    let begin = self.pos;
                    self.advance(1);
                    self.brackets += 1;
                    self.skip_ws();
                    let index = self.parse_expr()?;
                    self.skip_ws();
                    self.brackets -= 1;
                    if !self.eat_char(']') {
                        return Err(self.error_span("Unclosed '['".to_string(), begin));
                    }
                    expr = match (expr, index) {
                        (Expr::Reference(mut reference), Expr::Literal(Scalar::Int(n)))
                            if n >= 0 =>
                        {
                            reference.path = reference.path.index(n as usize);
                            Expr::Reference(reference)
                        }
                        (target, index) => {
                            self.deepen()?;
                            Expr::Index {
                                target: Box::new(target),
                                index: Box::new(index),
                            }
                        }
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        let begin = self.pos;
        self.expect_char('(')?;
        self.brackets += 1;
        let mut args = Vec::new();
        loop {
            self.skip_ws();
            if self.eat_char(')') {
                break;
            }
            if self.at_end() {
                return Err(self.error_span("Unclosed '('".to_string(), begin));
            }
            args.push(self.parse_expr()?);
            self.skip_ws();
            if self.eat_char(')') {
                break;
            }
            if !self.eat_char(',') {
                return Err(self.error_point("Expected ',' or ')' in arguments".to_string()));
            }
        }
        self.brackets -= 1;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.peek_char() {
            Some('(') => {
                let begin = self.pos;
                self.advance(1);
                self.brackets += 1;
                self.skip_ws();
                let inner = self.parse_expr()?;
                self.skip_ws();
                self.brackets -= 1;
                if !self.eat_char(')') {
                    return Err(self.error_span("Unclosed '('".to_string(), begin));
                }
                Ok(inner)
            }
            Some('[') => self.parse_array(),
            Some('{') => self.parse_map(),
            Some('"') => {
                let s = if self.starts_with("\"\"\"") {
                    self.parse_triple_string()?
                } else {
                    self.parse_double_quoted_string()?
                };
                Ok(Expr::Literal(Scalar::String(s)))
            }
            Some('\'') => Ok(Expr::Literal(Scalar::String(
                self.parse_single_quoted_string()?,
            ))),
            Some('$') if self.peek_second() == Some('"') => self.parse_template(),
            Some(ch) if ch.is_ascii_digit() || ch == '-' => self.parse_number(),
            Some(ch) if is_ident_start(ch) => self.parse_word(),
            _ => Err(self.error_point("Expected a value".to_string())),
        }
    }

    /// Keywords, `base.`/`super.` references, or a plain reference.
    fn parse_word(&mut self) -> Result<Expr, ParseError> {
        let begin = self.pos;
        let word = self.parse_identifier()?;
        let literal = match word.as_str() {
            "null" => Some(Scalar::None),
            "true" => Some(Scalar::Bool(true)),
            "false" => Some(Scalar::Bool(false)),
            "nan" => Some(Scalar::Float(f64::NAN)),
            "infinity" => Some(Scalar::Float(f64::INFINITY)),
            _ => None,
        };
        if let Some(literal) = literal {
            return Ok(Expr::Literal(literal));
        }

        let anchor = match word.as_str() {
            "base" => Some(Anchor::Root),
            "super" => Some(Anchor::Super),
            _ => None,
        };
        if let Some(anchor) = anchor {
            if self.peek_char() == Some('.') && self.peek_second().is_some_and(is_ident_start) {
                self.advance(1);
                let first = self.parse_identifier()?;
                return Ok(Expr::Reference(Reference {
                    anchor,
                    path: Path::root().field(&first),
                }));
            }
            return Err(self.error_span(
                format!("Expected a field name after '{}.'", word),
                begin,
            ));
        }

        Ok(Expr::Reference(Reference {
            anchor: Anchor::Scope,
            path: Path::root().field(&word),
        }))
    }

    // ── Numbers ─────────────────────────────────────────────────────

    fn parse_number(&mut self) -> Result<Expr, ParseError> {
        let start = self.pos;
        let begin = self.pos;

        self.eat_char('-');
        let digit_start = self.pos;
        self.consume_digits();
        if self.pos == digit_start {
            return Err(self.error_point("Expected digits".to_string()));
        }

        let mut is_float = false;
        if self.peek_char() == Some('.') && self.peek_second().is_some_and(|c| c.is_ascii_digit())
        {
            is_float = true;
            self.advance(1);
            self.consume_digits();
        }

        if let Some('e' | 'E') = self.peek_char() {
            is_float = true;
            self.advance(1);
            if let Some('+' | '-') = self.peek_char() {
                self.advance(1);
            }
            let exp_start = self.pos;
            self.consume_digits();
            if self.pos == exp_start {
                return Err(self.error_span("Expected exponent digits".to_string(), begin));
            }
        }

        if self.peek_char().is_some_and(is_ident_char) {
            return Err(self.error_span("Invalid number".to_string(), begin));
        }

        let text: String = self.input[start..self.pos]
            .chars()
            .filter(|&c| c != '_')
            .collect();
        let scalar = if is_float {
            text.parse::<f64>()
                .map(Scalar::Float)
                .map_err(|_| self.error_span(format!("Invalid number: {}", text), begin))?
        } else {
            text.parse::<i64>().map(Scalar::Int).map_err(|_| {
                self.error_span(format!("Integer out of range: {}", text), begin)
            })?
        };
        Ok(Expr::Literal(scalar))
    }

    /// Digits with `_` separators.
    fn consume_digits(&mut self) {
        let start = self.pos;
        while let Some(ch) = self.peek_char() {
            if ch.is_ascii_digit() || (ch == '_' && self.pos > start) {
                self.advance(1);
            } else {
                break;
            }
        }
    }

    // ── Strings ─────────────────────────────────────────────────────

    fn parse_double_quoted_string(&mut self) -> Result<String, ParseError> {
        let begin = self.pos;
        self.expect_char('"')?;
        let mut result = String::new();
        loop {
            match self.peek_char() {
                None | Some('\r') | Some('\n') => {
                    return Err(self.error_span("Unterminated string".to_string(), begin));
                }
                Some('"') => {
                    self.advance(1);
                    return Ok(result);
                }
                Some('\\') => {
                    self.advance(1);
                    result.push(self.parse_escape_char()?);
                }
                Some(ch) => {
                    self.advance(ch.len_utf8());
                    result.push(ch);
                }
            }
        }
    }

    /// Raw single-quoted string: no escapes at all.
    fn parse_single_quoted_string(&mut self) -> Result<String, ParseError> {
        let begin = self.pos;
        self.expect_char('\'')?;
        let start = self.pos;
        loop {
            match self.peek_char() {
                None | Some('\r') | Some('\n') => {
                    return Err(self.error_span("Unterminated string".to_string(), begin));
                }
                Some('\'') => {
                    let result = self.input[start..self.pos].to_string();
                    self.advance(1);
                    return Ok(result);
                }
                Some(ch) => self.advance(ch.len_utf8()),
            }
        }
    }

    /// `"""..."""`; a line break right after the opening quotes is dropped.
    fn parse_triple_string(&mut self) -> Result<String, ParseError> {
        let begin = self.pos;
        self.advance(3);
        if !self.eat_char('\n') && self.starts_with("\r\n") {
            self.advance(2);
        }

        let mut result = String::new();
        loop {
            if self.starts_with("\"\"\"") {
                self.advance(3);
                return Ok(result);
            }
            match self.peek_char() {
                None => {
                    return Err(
                        self.error_span("Unterminated triple-quoted string".to_string(), begin)
                    );
                }
                Some('\\') => {
                    self.advance(1);
                    result.push(self.parse_escape_char()?);
                }
                Some(ch) => {
                    self.advance(ch.len_utf8());
                    result.push(ch);
                }
            }
        }
    }

    fn parse_escape_char(&mut self) -> Result<char, ParseError> {
        let ch = match self.peek_char() {
            None => return Err(self.error_point("Unterminated escape sequence".to_string())),
            Some(ch) => ch,
        };
        let simple = match ch {
            'b' => Some('\u{0008}'),
            'f' => Some('\u{000C}'),
            'n' => Some('\n'),
            'r' => Some('\r'),
            't' => Some('\t'),
            '0' => Some('\0'),
            'u' => None,
            // Passthrough: \x -> x
            other => Some(other),
        };
        if let Some(simple) = simple {
            self.advance(ch.len_utf8());
            return Ok(simple);
        }

        let begin = self.pos;
        self.advance(1);
        let start = self.pos;
        for _ in 0..4 {
            match self.peek_char() {
                Some(ch) if ch.is_ascii_hexdigit() => self.advance(1),
                _ => {
                    return Err(
                        self.error_span("Expected 4 hex digits in \\uXXXX".to_string(), begin)
                    )
                }
            }
        }
        let hex = &self.input[start..self.pos];
        u32::from_str_radix(hex, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| self.error_span(format!("Invalid unicode code point: \\u{}", hex), begin))
    }

    /// `$"text {expr} text"`; `{{` and `}}` are literal braces.
    fn parse_template(&mut self) -> Result<Expr, ParseError> {
        let begin = self.pos;
        self.advance(2);
        let mut parts = Vec::new();
        let mut text = String::new();
        loop {
            match self.peek_char() {
                None | Some('\r') | Some('\n') => {
                    return Err(self.error_span("Unterminated template string".to_string(), begin));
                }
                Some('"') => {
                    self.advance(1);
                    break;
                }
                Some('\\') => {
                    self.advance(1);
                    text.push(self.parse_escape_char()?);
                }
                Some('{') if self.starts_with("{{") => {
                    self.advance(2);
                    text.push('{');
                }
                Some('}') if self.starts_with("}}") => {
                    self.advance(2);
                    text.push('}');
                }
                Some('}') => {
                    return Err(self.error_point("Unmatched '}' in template string".to_string()));
                }
                Some('{') => {
                    let open = self.pos;
                    self.advance(1);
                    if !text.is_empty() {
                        parts.push(TemplatePart::Text(std::mem::take(&mut text)));
                    }
                    self.brackets += 1;
                    self.skip_ws();
                    let expr = self.parse_expr()?;
                    self.skip_ws();
                    self.brackets -= 1;
                    if !self.eat_char('}') {
                        return Err(self.error_span("Unclosed '{' in template string".to_string(), open));
                    }
                    parts.push(TemplatePart::Expr(expr));
                }
                Some(ch) => {
                    self.advance(ch.len_utf8());
                    text.push(ch);
                }
            }
        }
        if !text.is_empty() {
            parts.push(TemplatePart::Text(text));
        }
        Ok(Expr::Template(parts))
    }

    // ── Arrays & Maps ───────────────────────────────────────────────

    fn parse_array(&mut self) -> Result<Expr, ParseError> {
        let begin = self.pos;
        self.expect_char('[')?;
        self.brackets += 1;
        let mut elements = Vec::new();
        loop {
            self.skip_ws();
            if self.eat_char(']') {
                break;
            }
            if self.at_end() {
                return Err(self.error_span("Unclosed '['".to_string(), begin));
            }
            elements.push(self.parse_expr()?);
            self.skip_ws();
            if self.eat_char(']') {
                break;
            }
            if !self.eat_char(',') {
                if self.at_end() {
                    return Err(self.error_span("Unclosed '['".to_string(), begin));
                }
                return Err(self.error_point("Expected ',' or ']' in array".to_string()));
            }
        }
        self.brackets -= 1;
        Ok(Expr::Array(elements))
    }

    /// `{ key: value, a.b = value }`
    fn parse_map(&mut self) -> Result<Expr, ParseError> {
        let begin = self.pos;
        self.expect_char('{')?;
        self.brackets += 1;
        let mut map = Expr::empty_struct();
        loop {
            self.skip_ws_and_commas();
            if self.eat_char('}') {
                break;
            }
            if self.at_end() {
                return Err(self.error_span("Unclosed '{'".to_string(), begin));
            }
            let key_begin = self.pos;
            let keys = self.parse_key()?;
            let key_end = self.pos;
            self.skip_ws();
            if !self.eat_char(':') && !self.eat_char('=') {
                return Err(self.error_point("Expected ':' or '=' after key".to_string()));
            }
            self.skip_ws();
            let value = self.parse_expr()?;
            assign(&mut map, &Path::root(), &keys, value)
                .map_err(|message| self.error_between(message, key_begin, key_end))?;
        }
        self.brackets -= 1;
        Ok(map)
    }
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

/// A statement guarded both by its own `@if` and by its section's.
fn combine_conditions(section: Option<Expr>, statement: Option<Expr>) -> Option<Expr> {
    match (section, statement) {
        (Some(outer), Some(inner)) => Some(Expr::Binary {
            op: BinaryOp::And,
            lhs: Box::new(outer),
            rhs: Box::new(inner),
        }),
        (outer, None) => outer,
        (None, inner) => inner,
    }
}

// ── Tree building ───────────────────────────────────────────────────

/// Walk `keys` from `node`, creating empty structs for missing fields.
/// An array of tables is entered through its last element.
fn build_access_path<'t>(
    mut node: &'t mut Expr,
    mut path: Path,
    keys: &[String],
) -> Result<(&'t mut Expr, Path), String> {
    for key in keys {
        let Expr::Struct(fields) = node else {
            return Err(format!("`{}` is already defined as a non-table value", path));
        };
        path = path.field(key);
        let child = fields.entry(key.clone()).or_insert_with(Expr::empty_struct);
        let enter_last = matches!(
            child,
            Expr::Array(items) if matches!(items.last(), Some(Expr::Struct(_)))
        );
        node = if enter_last {
            match child {
                Expr::Array(items) => {
                    let index = items.len() - 1;
                    path = path.index(index);
                    &mut items[index]
                }
                other => other,
            }
        } else {
            child
        };
    }
    Ok((node, path))
}

/// `[a.b]`: make sure the table exists and return its path.
fn open_table(root: &mut Expr, keys: &[String]) -> Result<Path, String> {
    let (node, path) = build_access_path(root, Path::root(), keys)?;
    match node {
        Expr::Struct(_) => Ok(path),
        _ => Err(format!("`{}` is already defined as a non-table value", path)),
    }
}

/// `[[a.b]]`: append a new table to the array at `a.b`.
fn append_table(root: &mut Expr, keys: &[String]) -> Result<Path, String> {
    let Some((last, parents)) = keys.split_last() else {
        return Err("Expected a table name".to_string());
    };
    let (parent, path) = build_access_path(root, Path::root(), parents)?;
    let Expr::Struct(fields) = parent else {
        return Err(format!("`{}` is already defined as a non-table value", path));
    };
    let path = path.field(last);
    match fields
        .entry(last.clone())
        .or_insert_with(|| Expr::Array(Vec::new()))
    {
        Expr::Array(items) => {
            items.push(Expr::empty_struct());
            Ok(path.index(items.len() - 1))
        }
        _ => Err(format!("`{}` is already defined as a non-array value", path)),
    }
}

/// `a.b.c = value` inside `section`. Repeated keys merge.
fn assign(root: &mut Expr, section: &Path, keys: &[String], value: Expr) -> Result<(), String> {
    let Some((last, parents)) = keys.split_last() else {
        return Err("Expected a key".to_string());
    };
    let table = section.resolve_mut(root).map_err(|err| err.to_string())?;
    let (parent, path) = build_access_path(table, section.clone(), parents)?;
    let Expr::Struct(fields) = parent else {
        return Err(format!("`{}` is already defined as a non-table value", path));
    };
    match fields.get_mut(last) {
        Some(slot) => {
            let previous = std::mem::take(slot);
            *slot = previous.merge(value);
        }
        None => {
            fields.insert(last.clone(), value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{Node, Segment};

    fn field<'t>(expr: &'t Expr, name: &str) -> &'t Expr {
        expr.child(&Segment::from(name))
            .unwrap_or_else(|reason| panic!("field `{}`: {}", name, reason))
    }

    fn root(src: &str) -> Expr {
        parse(src).unwrap().into_root()
    }

    #[test]
    fn test_postfix_does_not_cross_newline() {
        let tree = root("a = b\n[group]\nx = 1");
        assert!(matches!(field(&tree, "a"), Expr::Reference(_)));
        assert!(matches!(field(&tree, "group"), Expr::Struct(_)));
    }

    #[test]
    fn test_reference_postfix_extends_path() {
        let tree = root("a = base.server.hosts[0].port");
        match field(&tree, "a") {
            Expr::Reference(reference) => {
                assert_eq!(reference.anchor, Anchor::Root);
                assert_eq!(reference.path.to_string(), "server.hosts[0].port");
            }
            other => panic!("expected reference, got {:?}", other),
        }
    }

    #[test]
    fn test_method_call_on_reference() {
        let tree = root("a = name.to_uppercase()");
        assert!(matches!(field(&tree, "a"), Expr::Call { method, .. } if method == "to_uppercase"));
    }

    #[test]
    fn test_precedence() {
        let tree = root("a = 1 + 2 * 3");
        match field(&tree, "a") {
            Expr::Binary { op, rhs, .. } => {
                assert_eq!(*op, BinaryOp::Add);
                assert!(matches!(**rhs, Expr::Binary { op: BinaryOp::Mul, .. }));
            }
            other => panic!("expected binary, got {:?}", other),
        }
    }

    #[test]
    fn test_negative_literal() {
        let tree = root("a = -9223372036854775808");
        assert_eq!(field(&tree, "a"), &Expr::Literal(Scalar::Int(i64::MIN)));
    }

    #[test]
    fn test_header_enters_last_table() {
        let tree = root("[[servers]]\nname = \"a\"\n[[servers]]\nname = \"b\"\n[servers.tls]\non = true");
        match field(&tree, "servers") {
            Expr::Array(items) => {
                assert_eq!(items.len(), 2);
                assert!(matches!(field(&items[0], "name"), Expr::Literal(_)));
                assert!(items[0].child(&Segment::from("tls")).is_err());
                assert!(matches!(field(&items[1], "tls"), Expr::Struct(_)));
            }
            other => panic!("expected array of tables, got {:?}", other),
        }
    }

    #[test]
    fn test_error_span_positions() {
        let err = parse("a = 1\nb = [1,\n  2").unwrap_err();
        assert_eq!(err.message, "Unclosed '['");
        assert_eq!((err.begin.line, err.begin.column, err.begin.offset), (1, 4, 10));
        assert_eq!((err.end.line, err.end.column), (2, 3));
    }

    #[test]
    fn test_long_documents_parse() {
        let src: String = (0..20_000).map(|i| format!("k{} = [{}, \"v\"]\n", i, i)).collect();
        let tree = root(&src);
        assert!(matches!(field(&tree, "k19999"), Expr::Array(_)));
    }

    #[test]
    fn test_postfix_chain_counts_as_nesting() {
        let short = format!("a = 1{}", ".abs()".repeat(100));
        assert!(parse(&short).is_ok());

        let long = format!("a = 1{}", ".abs()".repeat(20_000));
        let err = parse(&long).unwrap_err();
        assert!(err.message.contains("nested deeper"), "{}", err.message);

        let indexed = format!("a = [1]{}", "[0]".repeat(500));
        assert!(parse(&indexed).is_err());
    }

    #[test]
    fn test_operator_chain_counts_as_nesting() {
        let err = parse(&format!("a = 1{}", " + 1".repeat(20_000))).unwrap_err();
        assert!(err.message.contains("nested deeper"), "{}", err.message);
        assert!(parse(&format!("a = 1{}", " + 1".repeat(50))).is_ok());
    }

    #[test]
    fn test_nesting_limit() {
        let src = format!("a = {}1{}", "(".repeat(500), ")".repeat(500));
        let err = parse(&src).unwrap_err();
        assert!(err.message.contains("nested deeper"), "{}", err.message);
    }
}
