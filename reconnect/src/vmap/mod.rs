//! Concrete custom view for a large, disk-backed virtual map.
//!
//! A virtual map addresses every node, leaf or internal, by a single `u64`
//! path into a complete binary tree: `root = 0`, `parent(p) = (p-1)/2`,
//! `left(p) = 2p+1`, `right(p) = 2p+2`. `first_leaf_path`/`last_leaf_path`
//! bound which paths are actual leaves; everything below `first_leaf_path`
//! is an internal ancestor, and any path above `last_leaf_path` does not
//! exist yet and hashes to the null hash.
//!
//! This module supplies the path arithmetic and the [`TeacherTreeView`] /
//! [`LearnerTreeView`] adapters; the actual record storage is behind the
//! [`VirtualMapSource`] (teacher, read-only) and [`VirtualMapSink`]
//! (learner, write) traits a caller implements against its own datasource
//! and cache, mirroring how `trees::axtrees` keeps hashing concerns
//! separate from the backing store.

use crate::error::{ReconnectError, Result};
use crate::hash::Hash;
use crate::view::{ExpectedLesson, LearnerTreeView, NodeId, TeacherTreeView, ROOT_INDEX, ROOT_PARENT};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub fn parent_path(path: u64) -> Option<u64> {
    if path == 0 {
        None
    } else {
        Some((path - 1) / 2)
    }
}

pub fn left_child(path: u64) -> u64 {
    2 * path + 1
}

pub fn right_child(path: u64) -> u64 {
    2 * path + 2
}

/// `true` if `path % 2 == 1`, i.e. `path` is its parent's left child.
pub fn is_left_child(path: u64) -> bool {
    path % 2 == 1
}

fn in_range(path: u64, last_leaf_path: i64) -> bool {
    last_leaf_path >= 0 && path <= last_leaf_path as u64
}

/// Teacher-side read access to a virtual map's records.
#[async_trait]
pub trait VirtualMapSource: Send + Sync {
    fn class_id(&self) -> u64;
    fn version(&self) -> i32;
    /// `(first_leaf_path, last_leaf_path)`.
    fn bounds(&self) -> (i64, i64);
    /// May suspend until background hashing of ancestors of `path` catches up.
    async fn hash_of(&self, path: u64) -> Hash;
    fn serialize_leaf(&self, path: u64) -> Result<Vec<u8>>;
}

/// Learner-side write access: the destination being rebuilt by reconnect.
#[async_trait]
pub trait VirtualMapSink: Send + Sync {
    fn set_bounds(&self, first_leaf_path: i64, last_leaf_path: i64);
    /// Pushes a freshly-received leaf into the rebuild pipeline. May block
    /// if hashing lags ingest.
    async fn push_leaf(&self, path: u64, bytes: Vec<u8>) -> Result<()>;
    /// Copies the subtree at `path` unchanged from the map's own pre-reconnect
    /// data (an `already-have` position).
    async fn reuse_subtree(&self, path: u64) -> Result<()>;
    /// Finalises hashing and returns the completed root hash.
    async fn finish(&self) -> Result<Hash>;
}

pub struct VirtualMapTeacherView {
    source: Arc<dyn VirtualMapSource>,
}

impl VirtualMapTeacherView {
    pub fn new(source: Arc<dyn VirtualMapSource>) -> Self {
        VirtualMapTeacherView { source }
    }
}

#[async_trait]
impl TeacherTreeView for VirtualMapTeacherView {
    async fn wait_until_ready(&self) -> Result<()> {
        Ok(())
    }

    async fn root(&self) -> NodeId {
        0
    }

    async fn get_child(&self, parent: NodeId, index: usize) -> Option<NodeId> {
        let (_, last_leaf) = self.source.bounds();
        let child = if index == 0 { left_child(parent) } else { right_child(parent) };
        in_range(child, last_leaf).then_some(child)
    }

    async fn hash_of(&self, node: Option<NodeId>) -> Hash {
        let (_, last_leaf) = self.source.bounds();
        match node {
            Some(path) if in_range(path, last_leaf) => self.source.hash_of(path).await,
            _ => Hash::NULL,
        }
    }

    fn is_leaf(&self, node: NodeId) -> bool {
        let (first_leaf, _) = self.source.bounds();
        first_leaf >= 0 && node >= first_leaf as u64
    }

    fn has_custom_view(&self, _node: NodeId) -> bool {
        false
    }

    fn class_id(&self, _node: NodeId) -> u64 {
        self.source.class_id()
    }

    fn version(&self, _node: NodeId) -> i32 {
        self.source.version()
    }

    fn child_count(&self, node: NodeId) -> usize {
        if self.is_leaf(node) {
            0
        } else {
            2
        }
    }

    fn vmap_bounds(&self, node: NodeId) -> Option<(i64, i64)> {
        (node == 0).then(|| self.source.bounds())
    }

    fn serialize_leaf(&self, node: NodeId) -> Result<Vec<u8>> {
        self.source.serialize_leaf(node)
    }

    async fn build_teacher_view(&self, node: NodeId) -> Result<Box<dyn TeacherTreeView>> {
        Err(ReconnectError::Invariant(format!(
            "virtual-map node {node} does not itself nest a further custom view"
        )))
    }
}

/// One slot of the learner's expected-lesson queue, specialised to avoid
/// boxing a full `ExpectedLesson` per entry the way the generic in-memory
/// view does.
struct PendingPath {
    path: u64,
    already_present: bool,
    original_present: bool,
}

pub struct VirtualMapLearnerView {
    original: Option<Arc<dyn VirtualMapSource>>,
    sink: Arc<dyn VirtualMapSink>,
    queue: Mutex<VecDeque<PendingPath>>,
    /// The path `next_expected` most recently handed out, consumed by the
    /// following `deserialize_leaf`/`deserialize_internal` call. Valid
    /// because the generic learner driver never interleaves processing of
    /// two lessons.
    current_path: Mutex<Option<u64>>,
}

impl VirtualMapLearnerView {
    pub fn new(original: Option<Arc<dyn VirtualMapSource>>, sink: Arc<dyn VirtualMapSink>) -> Self {
        VirtualMapLearnerView {
            original,
            sink,
            queue: Mutex::new(VecDeque::new()),
            current_path: Mutex::new(None),
        }
    }

    fn child_path(parent: NodeId, index: usize) -> u64 {
        if parent == ROOT_PARENT {
            0
        } else if index == 0 {
            left_child(parent)
        } else {
            right_child(parent)
        }
    }
}

#[async_trait]
impl LearnerTreeView for VirtualMapLearnerView {
    async fn original_child(&self, parent: Option<NodeId>, index: usize) -> Option<NodeId> {
        let parent = parent?;
        let original = self.original.as_ref()?;
        let (_, last_leaf) = original.bounds();
        let path = Self::child_path(parent, index);
        in_range(path, last_leaf).then_some(path)
    }

    async fn original_hash(&self, node: Option<NodeId>) -> Hash {
        match (node, &self.original) {
            (Some(path), Some(original)) => original.hash_of(path).await,
            _ => Hash::NULL,
        }
    }

    async fn hash_of_new(&self, node: NodeId) -> Hash {
        // The sink owns hashing for the rebuilt map; by the time this is
        // called, `close`/`finish` has already run, so any further lookup
        // is serviced by re-reading the now-finalised root via `original`-
        // style access is not available here. Callers that need this use
        // the hash `finish()` already returned from `close()`.
        let _ = node;
        Hash::NULL
    }

    fn expect_lesson_for(&self, parent: NodeId, index: usize, original: Option<NodeId>, already_present: bool) {
        let path = Self::child_path(parent, index);
        self.queue.lock().unwrap().push_back(PendingPath {
            path,
            already_present,
            original_present: original.is_some(),
        });
    }

    fn has_next(&self) -> bool {
        !self.queue.lock().unwrap().is_empty()
    }

    fn next_expected(&self) -> Option<ExpectedLesson> {
        let entry = self.queue.lock().unwrap().pop_front()?;
        *self.current_path.lock().unwrap() = Some(entry.path);
        let (parent, index) = match parent_path(entry.path) {
            None => (ROOT_PARENT, ROOT_INDEX),
            Some(p) => (p, if is_left_child(entry.path) { 0 } else { 1 }),
        };
        Some(ExpectedLesson {
            parent,
            child_index: index,
            original: entry.original_present.then_some(entry.path),
            node_already_present: entry.already_present,
        })
    }

    fn set_child(&self, _parent: NodeId, _index: usize, _child: Option<NodeId>) {
        // The map's shape is implicit in path arithmetic; nothing to link.
        // `Lesson::Empty` reuse is handled by `apply_reuse` below instead.
    }

    async fn apply_reuse(&self, parent: NodeId, index: usize, _original: Option<NodeId>) -> Result<()> {
        self.sink.reuse_subtree(Self::child_path(parent, index)).await
    }

    async fn deserialize_leaf(&self, _class_id: u64, _version: i32, bytes: &[u8]) -> Result<NodeId> {
        let path = self
            .current_path
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ReconnectError::Invariant("deserialize_leaf called with no pending path".into()))?;
        self.sink.push_leaf(path, bytes.to_vec()).await?;
        Ok(path)
    }

    async fn deserialize_internal(
        &self,
        _class_id: u64,
        _version: i32,
        _child_count: usize,
        vmap_bounds: Option<(i64, i64)>,
    ) -> Result<NodeId> {
        let path = self
            .current_path
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ReconnectError::Invariant("deserialize_internal called with no pending path".into()))?;
        if let Some((first_leaf_path, last_leaf_path)) = vmap_bounds {
            self.sink.set_bounds(first_leaf_path, last_leaf_path);
        }
        Ok(path)
    }

    fn mark_for_initialisation(&self, _node: NodeId) {
        // Internal hashing is entirely the sink's background job; there is
        // no children-before-parents step for the algorithm to drive here.
    }

    async fn initialise_all(&self) -> Result<()> {
        Ok(())
    }

    fn new_root(&self) -> Option<NodeId> {
        Some(0)
    }

    async fn build_learner_view(&self, _original: Option<NodeId>, class_id: u64, _version: i32) -> Result<Box<dyn LearnerTreeView>> {
        Err(ReconnectError::Invariant(format!(
            "class {class_id} has no further nested custom view inside a virtual map"
        )))
    }

    async fn close(&self) -> Result<NodeId> {
        self.sink.finish().await?;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{InMemoryVMapSink, InMemoryVMapSource};
    use crate::{run_learner, run_teacher, ReconnectConfig};

    #[test]
    fn parent_and_child_paths_are_inverse() {
        for path in 0..100u64 {
            assert!(is_left_child(left_child(path)));
            assert!(!is_left_child(right_child(path)));
            assert_eq!(parent_path(left_child(path)), Some(path));
            assert_eq!(parent_path(right_child(path)), Some(path));
        }
    }

    #[test]
    fn root_has_no_parent() {
        assert_eq!(parent_path(0), None);
    }

    #[test]
    fn in_range_respects_last_leaf_path() {
        assert!(in_range(6, 6));
        assert!(!in_range(7, 6));
        assert!(!in_range(0, -1));
    }

    fn four_leaves(values: [&str; 4]) -> InMemoryVMapSource {
        InMemoryVMapSource::new(9, 1, values.iter().map(|v| v.as_bytes().to_vec()).collect())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_sync_from_empty_learner_rebuilds_the_map() {
        let teacher_source = Arc::new(four_leaves(["a", "b", "c", "d"]));
        let expected_source = four_leaves(["a", "b", "c", "d"]);
        let teacher_view: Arc<dyn TeacherTreeView> = Arc::new(VirtualMapTeacherView::new(teacher_source));

        let sink = Arc::new(InMemoryVMapSink::new(9, 1, None));
        let learner_view: Arc<dyn LearnerTreeView> = Arc::new(VirtualMapLearnerView::new(None, sink.clone()));

        let (teacher_conn, learner_conn) = tokio::io::duplex(1 << 16);
        let config = ReconnectConfig::default();
        let teacher_cfg = config;
        let teacher_task = tokio::spawn(async move { run_teacher(teacher_view, teacher_conn, teacher_cfg).await });
        let learner_task = tokio::spawn(async move { run_learner(learner_view, learner_conn, None, config).await });
        let (teacher_result, learner_result) = tokio::join!(teacher_task, learner_task);
        teacher_result.unwrap().expect("teacher side failed");
        learner_result.unwrap().expect("learner side failed");

        let expected_root_hash = expected_source.hash_of(0).await;
        let rebuilt_root_hash = sink.finish().await.unwrap();
        assert_eq!(expected_root_hash, rebuilt_root_hash);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unchanged_map_reuses_every_leaf() {
        let original_source = Arc::new(four_leaves(["a", "b", "c", "d"]));
        let teacher_source = Arc::new(four_leaves(["a", "b", "c", "d"]));
        let teacher_view: Arc<dyn TeacherTreeView> = Arc::new(VirtualMapTeacherView::new(teacher_source));

        let sink = Arc::new(InMemoryVMapSink::new(9, 1, Some(original_source.clone())));
        let original_dyn: Arc<dyn VirtualMapSource> = original_source.clone();
        let learner_view: Arc<dyn LearnerTreeView> = Arc::new(VirtualMapLearnerView::new(Some(original_dyn), sink.clone()));

        let (teacher_conn, learner_conn) = tokio::io::duplex(1 << 16);
        let config = ReconnectConfig::default();
        let teacher_cfg = config;
        let teacher_task = tokio::spawn(async move { run_teacher(teacher_view, teacher_conn, teacher_cfg).await });
        let learner_task =
            tokio::spawn(async move { run_learner(learner_view, learner_conn, Some(0), config).await });
        let (teacher_result, learner_result) = tokio::join!(teacher_task, learner_task);
        teacher_result.unwrap().expect("teacher side failed");
        learner_result.unwrap().expect("learner side failed");

        let expected_root_hash = original_source.hash_of(0).await;
        let rebuilt_root_hash = sink.finish().await.unwrap();
        assert_eq!(expected_root_hash, rebuilt_root_hash);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_changed_leaf_resyncs_only_that_leaf() {
        let original_source = Arc::new(four_leaves(["a", "b", "c", "d"]));
        let teacher_source = Arc::new(four_leaves(["a", "b-changed", "c", "d"]));
        let expected_source = four_leaves(["a", "b-changed", "c", "d"]);
        let teacher_view: Arc<dyn TeacherTreeView> = Arc::new(VirtualMapTeacherView::new(teacher_source));

        let sink = Arc::new(InMemoryVMapSink::new(9, 1, Some(original_source.clone())));
        let original_dyn: Arc<dyn VirtualMapSource> = original_source;
        let learner_view: Arc<dyn LearnerTreeView> = Arc::new(VirtualMapLearnerView::new(Some(original_dyn), sink.clone()));

        let (teacher_conn, learner_conn) = tokio::io::duplex(1 << 16);
        let config = ReconnectConfig::default();
        let teacher_cfg = config;
        let teacher_task = tokio::spawn(async move { run_teacher(teacher_view, teacher_conn, teacher_cfg).await });
        let learner_task =
            tokio::spawn(async move { run_learner(learner_view, learner_conn, Some(0), config).await });
        let (teacher_result, learner_result) = tokio::join!(teacher_task, learner_task);
        teacher_result.unwrap().expect("teacher side failed");
        learner_result.unwrap().expect("learner side failed");

        let expected_root_hash = expected_source.hash_of(0).await;
        let rebuilt_root_hash = sink.finish().await.unwrap();
        assert_eq!(expected_root_hash, rebuilt_root_hash);
    }
}
