use derive_more::{Display, Error};
use knit_lockfile::{decode_uri_component, encode_uri_component};
use miette::Diagnostic;
use std::{fmt, str::FromStr};

/// Position of a package in the dependency tree: the ids of every package on the way from the root.
///
/// The text form joins the percent-encoded ids with `:` after the root sentinel `:/:`, e.g.
/// `:/:registry.npmjs.org%2Ffoo%2F1.0.0:`, so ids containing `:` still split unambiguously.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    pkg_ids: Vec<String>,
}

impl NodeId {
    /// Text form of the root.
    pub const ROOT: &str = ":/:";

    pub fn root() -> Self {
        NodeId::default()
    }

    /// Id of `pkg_id` reached from this node.
    pub fn child(&self, pkg_id: &str) -> Self {
        let mut pkg_ids = self.pkg_ids.clone();
        pkg_ids.push(pkg_id.to_string());
        NodeId { pkg_ids }
    }

    pub fn is_root(&self) -> bool {
        self.pkg_ids.is_empty()
    }

    /// Number of edges from the root.
    pub fn depth(&self) -> usize {
        self.pkg_ids.len()
    }

    /// Id of the package at this position.
    pub fn pkg_id(&self) -> Option<&'_ str> {
        self.pkg_ids.last().map(String::as_str)
    }

    pub fn pkg_ids(&self) -> &'_ [String] {
        &self.pkg_ids
    }

    /// Whether `dependent` depends directly on `dependency` somewhere on this path.
    pub fn contains_sequence(&self, dependent: &str, dependency: &str) -> bool {
        self.pkg_ids.windows(2).any(|pair| pair[0] == dependent && pair[1] == dependency)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", NodeId::ROOT)?;
        for pkg_id in &self.pkg_ids {
            write!(f, "{}:", encode_uri_component(pkg_id))?;
        }
        Ok(())
    }
}

/// Error when parsing the text form of a [`NodeId`].
#[derive(Debug, Display, Error, Diagnostic)]
#[display("{node_id:?} is not a valid node id")]
#[diagnostic(code(knit_package_manager::invalid_node_id))]
pub struct ParseNodeIdError {
    #[error(not(source))]
    pub node_id: String,
}

impl FromStr for NodeId {
    type Err = ParseNodeIdError;
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let error = || ParseNodeIdError { node_id: text.to_string() };
        let rest = text.strip_prefix(NodeId::ROOT).ok_or_else(error)?;
        if rest.is_empty() {
            return Ok(NodeId::root());
        }
        let rest = rest.strip_suffix(':').ok_or_else(error)?;
        let pkg_ids = rest
            .split(':')
            .map(|encoded| match encoded {
                "" => Err(error()),
                encoded => Ok(decode_uri_component(encoded).into_owned()),
            })
            .collect::<Result<_, _>>()?;
        Ok(NodeId { pkg_ids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn text_form() {
        let node_id = NodeId::root().child("registry.npmjs.org/foo/1.0.0").child("localhost+4873/@a/b/2.0.0");
        let text = node_id.to_string();
        assert_eq!(text, ":/:registry.npmjs.org%2Ffoo%2F1.0.0:localhost%2B4873%2F%40a%2Fb%2F2.0.0:");
        assert_eq!(text.parse::<NodeId>().unwrap(), node_id);
        assert_eq!(NodeId::root().to_string(), ":/:");
        assert_eq!(":/:".parse::<NodeId>().unwrap(), NodeId::root());
    }

    #[test]
    fn ids_with_colons_survive() {
        let node_id = NodeId::root().child("file:../foo").child("a:b");
        assert_eq!(node_id.to_string(), ":/:file%3A..%2Ffoo:a%3Ab:");
        assert_eq!(node_id.to_string().parse::<NodeId>().unwrap().pkg_ids(), ["file:../foo", "a:b"]);
    }

    #[test]
    fn invalid_text() {
        macro_rules! case {
            ($input:expr) => {{
                let input = $input;
                eprintln!("CASE: {input:?}");
                assert!(input.parse::<NodeId>().is_err());
            }};
        }

        case!("");
        case!("foo:");
        case!(":/:foo");
        case!(":/:foo::");
    }

    #[test]
    fn contains_sequence() {
        let node_id = NodeId::root().child("a").child("b").child("c");
        assert!(node_id.contains_sequence("a", "b"));
        assert!(node_id.contains_sequence("b", "c"));
        assert!(!node_id.contains_sequence("a", "c"));
        assert!(!node_id.contains_sequence("c", "a"));
        assert!(!NodeId::root().contains_sequence("a", "b"));
    }

    #[test]
    fn depth_and_pkg_id() {
        let node_id = NodeId::root().child("a").child("b");
        assert_eq!(node_id.depth(), 2);
        assert_eq!(node_id.pkg_id(), Some("b"));
        assert!(NodeId::root().is_root());
        assert_eq!(NodeId::root().pkg_id(), None);
    }
}
