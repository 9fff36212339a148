//! Reference-point-relative resource addressing.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{PathError, ReferencePointId};

/// A path relative to a reference point, as a sequence of segments.
///
/// Equality is structural. The empty path denotes the reference point
/// itself. Host path representations never leak in here.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct SessionPath(Vec<String>);

impl SessionPath {
    /// The reference point root.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Parse a `/`-separated relative path.
    ///
    /// A leading `/` or a Windows drive prefix is rejected as absolute.
    pub fn parse(text: &str) -> Result<Self, PathError> {
        if text.is_empty() {
            return Ok(Self::root());
        }
        if text.starts_with('/') || text.starts_with('\\') || has_drive_prefix(text) {
            return Err(PathError::Absolute(text.to_string()));
        }
        Self::from_segments(text.split('/').map(str::to_string))
    }

    /// Build a path from individual segments, validating each.
    pub fn from_segments<I, S>(segments: I) -> Result<Self, PathError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments = segments
            .into_iter()
            .map(|s| validate_segment(s.into()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self(segments))
    }

    /// Append one validated segment.
    pub fn join(&self, segment: &str) -> Result<Self, PathError> {
        let mut segments = self.0.clone();
        segments.push(validate_segment(segment.to_string())?);
        Ok(Self(segments))
    }

    /// The containing path, `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Last segment, `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Whether `prefix` is this path or one of its ancestors.
    pub fn starts_with(&self, prefix: &SessionPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Remove `prefix`, returning the remainder.
    pub fn strip_prefix(&self, prefix: &SessionPath) -> Option<Self> {
        self.0.strip_prefix(prefix.0.as_slice()).map(|rest| Self(rest.to_vec()))
    }

    /// Whether this path denotes the reference point itself.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The segments.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Same as [`is_root`](Self::is_root).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn has_drive_prefix(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn validate_segment(segment: String) -> Result<String, PathError> {
    if segment.is_empty() {
        return Err(PathError::EmptySegment(segment));
    }
    if segment == "." || segment == ".." {
        return Err(PathError::DotSegment(segment));
    }
    if segment.contains(['/', '\\', '\0']) {
        return Err(PathError::InvalidCharacter(segment));
    }
    Ok(segment)
}

impl TryFrom<Vec<String>> for SessionPath {
    type Error = PathError;

    fn try_from(segments: Vec<String>) -> Result<Self, Self::Error> {
        Self::from_segments(segments)
    }
}

impl From<SessionPath> for Vec<String> {
    fn from(path: SessionPath) -> Self {
        path.0
    }
}

impl fmt::Display for SessionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

impl fmt::Debug for SessionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionPath({:?})", self.to_string())
    }
}

/// A resource addressed inside a shared reference point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourcePath {
    /// The reference point the path is relative to.
    pub reference_point: ReferencePointId,
    /// Path below the reference point.
    pub path: SessionPath,
}

impl ResourcePath {
    /// Create a resource path.
    pub fn new(reference_point: ReferencePointId, path: SessionPath) -> Self {
        Self {
            reference_point,
            path,
        }
    }

    /// The reference point itself.
    pub fn reference_point_root(reference_point: ReferencePointId) -> Self {
        Self::new(reference_point, SessionPath::root())
    }

    /// Whether this addresses the reference point rather than something below it.
    pub fn is_reference_point(&self) -> bool {
        self.path.is_root()
    }

    /// The containing resource, `None` for a reference point.
    pub fn parent(&self) -> Option<Self> {
        self.path
            .parent()
            .map(|path| Self::new(self.reference_point, path))
    }

    /// Whether this lies at or below `ancestor`.
    pub fn starts_with(&self, ancestor: &ResourcePath) -> bool {
        self.reference_point == ancestor.reference_point && self.path.starts_with(&ancestor.path)
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:/{}", self.reference_point, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(text: &str) -> SessionPath {
        SessionPath::parse(text).unwrap()
    }

    #[test]
    fn parse_and_display() {
        let path = p("src/main.rs");
        assert_eq!(path.segments(), &["src".to_string(), "main.rs".to_string()]);
        assert_eq!(path.to_string(), "src/main.rs");
        assert_eq!(path.file_name(), Some("main.rs"));
    }

    #[test]
    fn empty_text_is_root() {
        assert!(p("").is_root());
        assert_eq!(SessionPath::root().parent(), None);
    }

    #[test]
    fn absolute_paths_rejected() {
        assert!(matches!(
            SessionPath::parse("/etc/passwd"),
            Err(PathError::Absolute(_))
        ));
        assert!(matches!(
            SessionPath::parse("C:/Windows"),
            Err(PathError::Absolute(_))
        ));
    }

    #[test]
    fn relative_segments_rejected() {
        assert!(matches!(
            SessionPath::parse("a/../b"),
            Err(PathError::DotSegment(_))
        ));
        assert!(matches!(
            SessionPath::parse("a//b"),
            Err(PathError::EmptySegment(_))
        ));
        assert!(matches!(
            SessionPath::from_segments(["a\\b"]),
            Err(PathError::InvalidCharacter(_))
        ));
    }

    #[test]
    fn structural_equality() {
        let built = SessionPath::root().join("src").unwrap().join("lib.rs").unwrap();
        assert_eq!(built, p("src/lib.rs"));
        assert_ne!(built, p("src/lib.rs/x"));
    }

    #[test]
    fn prefix_operations() {
        let dir = p("src");
        let file = p("src/net/tcp.rs");
        assert!(file.starts_with(&dir));
        assert!(!dir.starts_with(&file));
        assert!(!p("srcfoo/x").starts_with(&dir));
        assert_eq!(file.strip_prefix(&dir), Some(p("net/tcp.rs")));
        assert_eq!(file.parent(), Some(p("src/net")));
    }

    #[test]
    fn deserialize_validates_segments() {
        let bytes = rmp_serde::to_vec(&vec!["ok".to_string(), "..".to_string()]).unwrap();
        let result: Result<SessionPath, _> = rmp_serde::from_slice(&bytes);
        assert!(result.is_err());
    }

    #[test]
    fn resource_path_ancestry() {
        let rp = ReferencePointId::new();
        let other = ReferencePointId::new();
        let root = ResourcePath::reference_point_root(rp);
        let file = ResourcePath::new(rp, p("a/b.txt"));
        assert!(root.is_reference_point());
        assert!(file.starts_with(&root));
        assert!(!ResourcePath::new(other, p("a/b.txt")).starts_with(&root));
        assert_eq!(file.parent().and_then(|x| x.parent()), Some(root));
    }
}
