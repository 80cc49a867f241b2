//------------ NodeState -----------------------------------------------------

/// The persisted payload of one strike-tree node.
///
/// `struck_bitmap` is only ever non-zero for terminal nodes, where bit `j`
/// marks the j-th entry of the node's 64-entry range as struck.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NodeState {
    pub struck_count: u64,
    pub struck_bitmap: u64,
}

impl NodeState {
    pub fn new(struck_count: u64, struck_bitmap: u64) -> Self {
        NodeState {
            struck_count,
            struck_bitmap,
        }
    }
}
