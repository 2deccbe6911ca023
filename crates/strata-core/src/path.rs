//! Namespace paths and their change-notification topics
//!
//! A [`Path`] addresses one resource in the naming namespace. Every path with at
//! least one segment also maps to a [`Topic`]: the gossip destination on which
//! writes under that path are announced. Topics are coarsened to at most
//! [`MAX_TOPIC_SEGMENTS`] leading segments so that many related paths share a
//! single subscription.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of every invalidation topic
pub const UPDATES_TOPIC_PREFIX: &str = "/updates";

/// Maximum number of leading path segments retained in a topic
pub const MAX_TOPIC_SEGMENTS: usize = 4;

/// Ordered list of string segments addressing a resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    /// Build a path from its segments
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a canonical `/a/b/c` string. Empty segments are dropped.
    pub fn parse(key: &str) -> Self {
        Self::new(key.split('/').filter(|segment| !segment.is_empty()))
    }

    /// Path segments in order
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the path has no segments
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Last segment, if any
    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Return a new path with `segment` appended
    pub fn join(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Whether `prefix` is a leading run of this path's segments
    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// Keep at most `depth` leading segments
    pub fn truncate(&self, depth: usize) -> Self {
        Self {
            segments: self.segments.iter().take(depth).cloned().collect(),
        }
    }

    /// Segments following `prefix`, or `None` when the prefix does not match
    pub fn strip_prefix(&self, prefix: &Path) -> Option<&[String]> {
        if self.starts_with(prefix) {
            Some(&self.segments[prefix.len()..])
        } else {
            None
        }
    }

    /// Canonical joined form used as the key in the replicated store
    pub fn to_key(&self) -> String {
        self.to_string()
    }

    /// Change-notification topic for this path.
    ///
    /// One segment maps to itself; N ≥ 2 segments keep the first
    /// `min(MAX_TOPIC_SEGMENTS, N - 1)`; the empty path has no topic.
    pub fn topic(&self) -> Option<Topic> {
        let keep = match self.segments.len() {
            0 => return None,
            1 => 1,
            n => MAX_TOPIC_SEGMENTS.min(n - 1),
        };
        Some(Topic::from_segments(&self.segments[..keep]))
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl From<Vec<String>> for Path {
    fn from(segments: Vec<String>) -> Self {
        Self { segments }
    }
}

impl From<&[&str]> for Path {
    fn from(segments: &[&str]) -> Self {
        Self::new(segments.iter().copied())
    }
}

impl<const N: usize> From<[&str; N]> for Path {
    fn from(segments: [&str; N]) -> Self {
        Self::new(segments)
    }
}

/// Gossip destination on which writes under a coarsened path are announced
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Wrap an already formatted topic name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    fn from_segments(segments: &[String]) -> Self {
        let mut name = String::from(UPDATES_TOPIC_PREFIX);
        for segment in segments {
            name.push('/');
            name.push_str(segment);
        }
        Self(name)
    }

    /// Topic name as published on the gossip layer
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_joins_segments() {
        let path = Path::from(["projects", "p1", "branches", "main"]);
        assert_eq!(path.to_key(), "/projects/p1/branches/main");
        assert_eq!(Path::parse("/projects/p1/branches/main"), path);
        assert_eq!(Path::default().to_string(), "/");
    }

    #[test]
    fn parse_drops_empty_segments() {
        assert_eq!(Path::parse("//a///b/"), Path::from(["a", "b"]));
        assert!(Path::parse("/").is_empty());
    }

    #[test]
    fn empty_path_has_no_topic() {
        assert!(Path::default().topic().is_none());
    }

    #[test]
    fn single_segment_topic_is_the_segment() {
        let topic = Path::from(["test"]).topic().unwrap();
        assert_eq!(topic.as_str(), "/updates/test");
    }

    #[test]
    fn topic_drops_last_segment() {
        let topic = Path::from(["a", "b", "c"]).topic().unwrap();
        assert_eq!(topic.as_str(), "/updates/a/b");
    }

    #[test]
    fn topic_caps_at_four_segments() {
        let topic = Path::from(["a", "b", "c", "d", "e", "f", "g"])
            .topic()
            .unwrap();
        assert_eq!(topic.as_str(), "/updates/a/b/c/d");
    }

    #[test]
    fn truncate_and_strip_prefix() {
        let path = Path::from(["a", "b", "c"]);
        assert_eq!(path.truncate(2), Path::from(["a", "b"]));
        assert_eq!(path.truncate(10), path);
        assert_eq!(
            path.strip_prefix(&Path::from(["a"])),
            Some(&["b".to_string(), "c".to_string()][..])
        );
        assert!(path.strip_prefix(&Path::from(["x"])).is_none());
    }
}
