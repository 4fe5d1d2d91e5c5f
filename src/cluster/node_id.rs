//! Node identity.

use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Length of the generated random suffix.
const SUFFIX_LEN: usize = 7;

/// Opaque identifier of a cluster member.
///
/// Fixed for the lifetime of the process. Either supplied by the operator,
/// built from a prefix plus a random suffix, or fully random.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Wraps an operator supplied identifier as is.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates an identifier, `{prefix}-{suffix}` when a prefix is given,
    /// otherwise just the random suffix.
    pub fn generate(prefix: Option<&str>) -> Self {
        let suffix = random_suffix();
        match prefix {
            Some(prefix) if !prefix.is_empty() => Self(format!("{}-{}", prefix, suffix)),
            _ => Self(suffix),
        }
    }

    /// Resolves the node ID from configuration.
    ///
    /// An explicit ID wins; otherwise one is generated from the prefix.
    pub fn from_config(node_id: Option<&str>, prefix: Option<&str>) -> Self {
        match node_id {
            Some(id) if !id.is_empty() => Self::new(id),
            _ => Self::generate(prefix),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}
