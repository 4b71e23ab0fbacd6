//! Structured addressing for expression and value trees.
//!
//! A [`Path`] is parsed once from text such as `server.hosts[0].port` and is
//! immutable afterwards. Resolution is generic over any tree type that
//! implements [`Node`], so the same walker serves the override engine (on
//! expressions) and the value navigator (on evaluated values).

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, PathError, PathErrorReason};

/// One step of a path: a named field or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Field(String),
    Index(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Field(name) => f.write_str(name),
            Segment::Index(index) => write!(f, "[{}]", index),
        }
    }
}

impl From<&str> for Segment {
    fn from(name: &str) -> Self {
        Segment::Field(name.to_string())
    }
}

impl From<String> for Segment {
    fn from(name: String) -> Self {
        Segment::Field(name)
    }
}

impl From<usize> for Segment {
    fn from(index: usize) -> Self {
        Segment::Index(index)
    }
}

/// A tree that paths can walk through.
pub trait Node {
    fn child(&self, segment: &Segment) -> Result<&Self, PathErrorReason>;
    fn child_mut(&mut self, segment: &Segment) -> Result<&mut Self, PathErrorReason>;
}

/// An immutable sequence of segments. The empty path addresses the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Path {
    segments: Vec<Segment>,
}

fn segment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:(\.)?([A-Za-z_][A-Za-z0-9_\-]*)|\[\s*([0-9]+)\s*\])")
            .expect("segment pattern is a valid regex")
    })
}

impl Path {
    pub fn root() -> Self {
        Path::default()
    }

    /// Parse `a.b[2].c`. The empty string parses to the root path.
    pub fn parse(input: &str) -> Result<Path, Error> {
        let syntax = |offset: usize, message: &str| Error::PathSyntax {
            input: input.to_string(),
            offset,
            message: message.to_string(),
        };

        let mut segments = Vec::new();
        let mut offset = 0;
        while offset < input.len() {
            let caps = segment_pattern()
                .captures(&input[offset..])
                .ok_or_else(|| syntax(offset, "expected a field name or `[index]`"))?;

            if let Some(name) = caps.get(2) {
                let dotted = caps.get(1).is_some();
                if dotted && segments.is_empty() {
                    return Err(syntax(offset, "path cannot start with `.`"));
                }
                if !dotted && !segments.is_empty() {
                    return Err(syntax(offset, "expected `.` before field name"));
                }
                segments.push(Segment::Field(name.as_str().to_string()));
            } else if let Some(index) = caps.get(3) {
                let index = index
                    .as_str()
                    .parse::<usize>()
                    .map_err(|_| syntax(offset, "index is too large"))?;
                segments.push(Segment::Index(index));
            }

            offset += caps.get(0).map_or(0, |m| m.end());
        }

        Ok(Path { segments })
    }

    pub fn from_segments(segments: impl IntoIterator<Item = Segment>) -> Self {
        Path {
            segments: segments.into_iter().collect(),
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.is_root()
    }

    pub fn first(&self) -> Option<&Segment> {
        self.segments.first()
    }

    pub fn last(&self) -> Option<&Segment> {
        self.segments.last()
    }

    /// The first `len` segments.
    pub fn prefix(&self, len: usize) -> Path {
        Path {
            segments: self.segments[..len.min(self.segments.len())].to_vec(),
        }
    }

    /// Everything after the first `start` segments.
    pub fn suffix(&self, start: usize) -> Path {
        Path {
            segments: self.segments[start.min(self.segments.len())..].to_vec(),
        }
    }

    pub fn parent(&self) -> Option<Path> {
        if self.is_root() {
            None
        } else {
            Some(self.prefix(self.len() - 1))
        }
    }

    pub fn child(&self, segment: impl Into<Segment>) -> Path {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Path { segments }
    }

    pub fn field(&self, name: &str) -> Path {
        self.child(Segment::Field(name.to_string()))
    }

    pub fn index(&self, index: usize) -> Path {
        self.child(Segment::Index(index))
    }

    pub fn join(&self, other: &Path) -> Path {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Path { segments }
    }

    pub fn starts_with(&self, other: &Path) -> bool {
        self.segments.starts_with(&other.segments)
    }

    /// Human-readable form for diagnostics: the root has no textual form.
    pub fn describe(&self) -> String {
        if self.is_root() {
            "the root".to_string()
        } else {
            format!("`{}`", self)
        }
    }

    pub(crate) fn error_at(&self, position: usize, reason: PathErrorReason) -> PathError {
        PathError {
            path: self.clone(),
            position,
            segment: self.segments[position].clone(),
            reason,
        }
    }

    /// Walk `root` along every segment.
    pub fn resolve<'a, N: Node>(&self, root: &'a N) -> Result<&'a N, PathError> {
        let mut current = root;
        for (position, segment) in self.segments.iter().enumerate() {
            current = current
                .child(segment)
                .map_err(|reason| self.error_at(position, reason))?;
        }
        Ok(current)
    }

    pub fn resolve_mut<'a, N: Node>(&self, root: &'a mut N) -> Result<&'a mut N, PathError> {
        self.walk_mut(root, self.segments.len())
    }

    /// Walk to the parent of the last segment. Errors keep positions relative
    /// to the full path. Returns `None` for the root path.
    pub fn resolve_parent_mut<'a, N: Node>(
        &self,
        root: &'a mut N,
    ) -> Result<Option<(&'a mut N, &Segment)>, PathError> {
        match self.segments.last() {
            None => Ok(None),
            Some(last) => {
                let parent = self.walk_mut(root, self.segments.len() - 1)?;
                Ok(Some((parent, last)))
            }
        }
    }

    fn walk_mut<'a, N: Node>(&self, root: &'a mut N, upto: usize) -> Result<&'a mut N, PathError> {
        let mut current = root;
        for (position, segment) in self.segments[..upto].iter().enumerate() {
            current = current
                .child_mut(segment)
                .map_err(|reason| self.error_at(position, reason))?;
        }
        Ok(current)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 && matches!(segment, Segment::Field(_)) {
                f.write_str(".")?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Path::parse(s)
    }
}

impl TryFrom<&str> for Path {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Path::parse(s)
    }
}

impl From<Vec<Segment>> for Path {
    fn from(segments: Vec<Segment>) -> Self {
        Path { segments }
    }
}
