//! Tree view abstraction: the teacher and learner algorithms never touch
//! concrete node representations, only these capability sets.
//!
//! Both capability sets address nodes through a single opaque handle type,
//! [`NodeId`]. This mirrors the virtual-map view's own node handle (a `u64`
//! path, see [`crate::vmap`]) and lets one non-generic, object-safe trait
//! serve both the standard in-memory implementation and any custom view,
//! which is what makes subtree dispatch — handing traversal off to a
//! *different* concrete view partway through a recursive walk — a plain
//! trait-object swap instead of a second, type-erased copy of the
//! algorithm.
//!
//! The root of whichever subtree a view covers is addressed as the
//! `(ROOT_PARENT, ROOT_INDEX)` position rather than requiring a special
//! case in every method; only the concrete views need to know about it.

use crate::error::Result;
use crate::hash::Hash;
use async_trait::async_trait;

/// Opaque node handle. Minted and interpreted only by the concrete view
/// that issued it; the algorithm never inspects its value.
pub type NodeId = u64;

/// Sentinel "parent" used to address a subtree's own root slot, so that
/// the root lesson/query can be expressed with the same `(parent, index)`
/// shape as every other position instead of a special case in the
/// traversal code.
pub const ROOT_PARENT: NodeId = u64::MAX;
pub const ROOT_INDEX: usize = 0;

/// One entry of the learner's expected-lesson queue. Responses are recorded
/// here in the order they're sent, and lessons drain them in that same
/// order to re-correlate each arriving lesson with the node position its
/// query was about (lessons carry no positional identifier on the wire).
#[derive(Debug, Clone, Copy)]
pub struct ExpectedLesson {
    pub parent: NodeId,
    pub child_index: usize,
    pub original: Option<NodeId>,
    pub node_already_present: bool,
}

/// Teacher-side capability set. The teacher's tree is an immutable snapshot
/// for the duration of reconnect, so every method here is `&self`.
#[async_trait]
pub trait TeacherTreeView: Send + Sync {
    /// Blocks until the view is safe to traverse (background hashing may
    /// still be catching up when the orchestrator hands it to reconnect).
    async fn wait_until_ready(&self) -> Result<()>;

    async fn root(&self) -> NodeId;

    /// `None` for an absent or out-of-range child.
    async fn get_child(&self, parent: NodeId, index: usize) -> Option<NodeId>;

    /// Hash of `node`, or the null hash for `None`/out-of-range.
    async fn hash_of(&self, node: Option<NodeId>) -> Hash;

    fn is_leaf(&self, node: NodeId) -> bool;
    fn has_custom_view(&self, node: NodeId) -> bool;
    fn class_id(&self, node: NodeId) -> u64;
    fn version(&self, node: NodeId) -> i32;
    fn child_count(&self, node: NodeId) -> usize;

    /// Virtual-map-style roots additionally carry leaf-path bounds on the
    /// wire; `None` for every other internal kind.
    fn vmap_bounds(&self, _node: NodeId) -> Option<(i64, i64)> {
        None
    }

    fn serialize_leaf(&self, node: NodeId) -> Result<Vec<u8>>;

    /// Builds the teacher-side view for a declared custom subtree root.
    async fn build_teacher_view(&self, node: NodeId) -> Result<Box<dyn TeacherTreeView>>;

    /// Releases any resource associated with `node`. A no-op for handles
    /// that don't own anything beyond what ordinary `Drop` already frees.
    fn release(&self, _node: NodeId) {}
}

/// Learner-side capability set.
#[async_trait]
pub trait LearnerTreeView: Send + Sync {
    fn is_root_of_state(&self) -> bool {
        false
    }

    /// The learner's node at `(parent, index)` in its *old*, pre-reconnect
    /// tree, or `None` if `parent` is `None` (no original at this position
    /// at all) or the position doesn't exist there.
    async fn original_child(&self, parent: Option<NodeId>, index: usize) -> Option<NodeId>;

    /// Hash of a node in the learner's old tree (used only by `L1` to
    /// decide `already-have` responses); null hash for `None`.
    async fn original_hash(&self, node: Option<NodeId>) -> Hash;

    /// Hash of a node in the learner's newly reconstructed tree. Only used
    /// by the optional end-to-end root-hash consistency check.
    async fn hash_of_new(&self, node: NodeId) -> Hash;

    // --- expected-lesson queue (single-producer `L1` / single-consumer `L3`) ---
    fn expect_lesson_for(&self, parent: NodeId, index: usize, original: Option<NodeId>, already_present: bool);
    fn has_next(&self) -> bool;
    fn next_expected(&self) -> Option<ExpectedLesson>;

    // --- building the new subtree ---
    fn set_child(&self, parent: NodeId, index: usize, child: Option<NodeId>);

    /// Applies an `already-have` lesson at `(parent, index)`: the learner
    /// keeps reusing `original` unchanged. The default just relinks it via
    /// `set_child`; a view whose shape is implicit in node addressing (the
    /// virtual map) instead copies the backing data across.
    async fn apply_reuse(&self, parent: NodeId, index: usize, original: Option<NodeId>) -> Result<()> {
        self.set_child(parent, index, original);
        Ok(())
    }

    /// Async because a custom view's rebuild pipeline may suspend here if
    /// background hashing lags ingest.
    async fn deserialize_leaf(&self, class_id: u64, version: i32, bytes: &[u8]) -> Result<NodeId>;

    /// `vmap_bounds` carries the teacher-declared `(first_leaf_path,
    /// last_leaf_path)` pair when this internal is a virtual-map root;
    /// `None` for every other internal kind. A view that rebuilds a virtual
    /// map uses it to initialise its destination subtree's bounds before
    /// any leaf arrives.
    async fn deserialize_internal(
        &self,
        class_id: u64,
        version: i32,
        child_count: usize,
        vmap_bounds: Option<(i64, i64)>,
    ) -> Result<NodeId>;
    fn mark_for_initialisation(&self, node: NodeId);

    /// Initialises every reconstructed internal, children before parents,
    /// exactly once each.
    async fn initialise_all(&self) -> Result<()>;

    /// The root of the rebuilt subtree, valid only after `set_child` has
    /// been called for `(ROOT_PARENT, ROOT_INDEX)`.
    fn new_root(&self) -> Option<NodeId>;

    /// Builds the learner-side view for a custom subtree. `original` is the
    /// learner's pre-existing node at that position, if any.
    async fn build_learner_view(&self, original: Option<NodeId>, class_id: u64, version: i32) -> Result<Box<dyn LearnerTreeView>>;

    /// Ends the reconnect for this view: finalises any deferred hashing
    /// and leaves the new subtree ready to be installed. Returns the
    /// finished root.
    async fn close(&self) -> Result<NodeId>;

    fn release(&self, _node: NodeId) {}
}
