//! Stable ID newtypes for shader graph entities.
//!
//! IDs are distinct newtype wrappers over `u32`, so a `NodeId` cannot be
//! passed where a `ShaderId` is expected.

use std::fmt;

use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};

/// Stable node identifier. Maps to a petgraph `NodeIndex<u32>`.
///
/// Ordering by `NodeId` is the deterministic tie-break used by the
/// schedulers, so the derived `Ord` matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Index of a shader within the scene's shader list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShaderId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ShaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl NodeId {
    /// Position of this node in arena-indexed side tables.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// Bridge between NodeId and petgraph's NodeIndex<u32>.

impl From<NodeIndex<u32>> for NodeId {
    fn from(idx: NodeIndex<u32>) -> Self {
        NodeId(idx.index() as u32)
    }
}

impl From<NodeId> for NodeIndex<u32> {
    fn from(id: NodeId) -> Self {
        NodeIndex::new(id.0 as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_to_node_index_roundtrip() {
        let idx = NodeIndex::<u32>::new(17);
        let node_id = NodeId::from(idx);
        assert_eq!(node_id.0, 17);

        let back: NodeIndex<u32> = node_id.into();
        assert_eq!(back.index(), 17);
    }

    #[test]
    fn node_ids_order_numerically() {
        let mut ids = vec![NodeId(9), NodeId(2), NodeId(5)];
        ids.sort();
        assert_eq!(ids, vec![NodeId(2), NodeId(5), NodeId(9)]);
    }

    #[test]
    fn display_prints_inner_value() {
        assert_eq!(NodeId(3).to_string(), "3");
        assert_eq!(ShaderId(12).to_string(), "12");
    }
}
