use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// One segment of a [`NodePosition`] pointer.
///
/// Segments consisting solely of ASCII digits are indices; everything else is
/// a name. This keeps `parse(p.to_string()) == p` for every position the
/// parser can produce, since task names in the DSL are identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PositionToken {
    Name(String),
    Index(usize),
}

impl Display for PositionToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PositionToken::Name(name) => write!(f, "{name}"),
            PositionToken::Index(index) => write!(f, "{index}"),
        }
    }
}

/// A JSON-Pointer-shaped path identifying a node in a workflow definition,
/// stable across restarts. Renders as `/do/0/task`; the root position is the
/// empty pointer and renders as the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodePosition(Vec<PositionToken>);

impl NodePosition {
    #[must_use]
    pub fn root() -> Self {
        NodePosition(Vec::new())
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn tokens(&self) -> &[PositionToken] {
        &self.0
    }

    /// Append a name segment, returning the extended position.
    #[must_use]
    pub fn name(&self, segment: impl Into<String>) -> Self {
        let mut tokens = self.0.clone();
        tokens.push(PositionToken::Name(segment.into()));
        NodePosition(tokens)
    }

    /// Append an index segment, returning the extended position.
    #[must_use]
    pub fn index(&self, index: usize) -> Self {
        let mut tokens = self.0.clone();
        tokens.push(PositionToken::Index(index));
        NodePosition(tokens)
    }

    /// The position one segment up, or `None` at the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        Some(NodePosition(self.0[..self.0.len() - 1].to_vec()))
    }

    /// True when `self` is an ancestor of (or equal to) `other`.
    #[must_use]
    pub fn is_prefix_of(&self, other: &NodePosition) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl Display for NodePosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for token in &self.0 {
            write!(f, "/{token}")?;
        }
        Ok(())
    }
}

impl FromStr for NodePosition {
    type Err = InvalidPosition;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(NodePosition::root());
        }
        if !s.starts_with('/') {
            return Err(InvalidPosition {
                pointer: s.to_string(),
            });
        }
        let mut tokens = Vec::new();
        for segment in s[1..].split('/') {
            if segment.is_empty() {
                return Err(InvalidPosition {
                    pointer: s.to_string(),
                });
            }
            if segment.bytes().all(|b| b.is_ascii_digit()) {
                let index = segment.parse().map_err(|_| InvalidPosition {
                    pointer: s.to_string(),
                })?;
                tokens.push(PositionToken::Index(index));
            } else {
                tokens.push(PositionToken::Name(segment.to_string()));
            }
        }
        Ok(NodePosition(tokens))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPosition {
    pub pointer: String,
}

impl Display for InvalidPosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node position pointer: {:?}", self.pointer)
    }
}

impl std::error::Error for InvalidPosition {}

impl Serialize for NodePosition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodePosition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PositionVisitor;

        impl Visitor<'_> for PositionVisitor {
            type Value = NodePosition;

            fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON pointer string such as \"/do/0/task\"")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<NodePosition, E> {
                value.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(PositionVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_renders_as_empty_pointer() {
        assert_eq!(NodePosition::root().to_string(), "");
        assert!(NodePosition::root().is_root());
    }

    #[test]
    fn display_round_trips() {
        let position = NodePosition::root().name("do").index(0).name("fetch");
        assert_eq!(position.to_string(), "/do/0/fetch");
        let parsed: NodePosition = "/do/0/fetch".parse().unwrap();
        assert_eq!(parsed, position);
    }

    #[test]
    fn parse_of_rendered_pointer_is_identity() {
        let positions = [
            NodePosition::root(),
            NodePosition::root().name("do").index(3),
            NodePosition::root()
                .name("do")
                .index(1)
                .name("retry-me")
                .name("try")
                .index(0)
                .name("inner"),
        ];
        for position in positions {
            let parsed: NodePosition = position.to_string().parse().unwrap();
            assert_eq!(parsed, position);
        }
    }

    #[test]
    fn rejects_malformed_pointers() {
        assert!("do/0".parse::<NodePosition>().is_err());
        assert!("/do//task".parse::<NodePosition>().is_err());
    }

    #[test]
    fn parent_walks_up() {
        let position = NodePosition::root().name("do").index(0).name("a");
        let parent = position.parent().unwrap();
        assert_eq!(parent.to_string(), "/do/0");
        assert_eq!(NodePosition::root().parent(), None);
    }

    #[test]
    fn prefix_detection() {
        let fork = NodePosition::root().name("do").index(2).name("split");
        let branch = fork.name("fork").name("branches").index(0).name("left");
        assert!(fork.is_prefix_of(&branch));
        assert!(!branch.is_prefix_of(&fork));
    }

    #[test]
    fn serde_uses_pointer_strings() {
        let position = NodePosition::root().name("do").index(0).name("a");
        let encoded = serde_json::to_string(&position).unwrap();
        assert_eq!(encoded, "\"/do/0/a\"");
        let decoded: NodePosition = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, position);
    }
}
