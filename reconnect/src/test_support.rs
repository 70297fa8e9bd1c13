//! An in-memory reference tree implementing both [`TeacherTreeView`] and
//! [`LearnerTreeView`] directly, with no custom subtrees of its own. Used by
//! this crate's own tests as the "standard implementation" fixture, the way
//! a concrete in-memory store would back the teacher/learner algorithms in
//! a caller outside this crate.

use crate::error::{ReconnectError, Result};
use crate::hash::Hash;
use crate::vmap::{left_child, right_child, VirtualMapSink, VirtualMapSource};
use crate::view::{ExpectedLesson, LearnerTreeView, NodeId, TeacherTreeView, ROOT_INDEX, ROOT_PARENT};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Node ids minted by a learner's new-tree builder set this bit so they can
/// never collide with ids carried over from the original tree (test fixture
/// trees are small enough that original ids never approach it).
const NEW_NODE_TAG: NodeId = 1 << 63;

#[derive(Clone)]
enum NodeData {
    Leaf {
        class_id: u64,
        version: i32,
        bytes: Vec<u8>,
    },
    Internal {
        class_id: u64,
        version: i32,
        children: Vec<Option<NodeId>>,
    },
}

/// A fully-built, immutable, fully-hashed tree: the teacher side, or the
/// learner's pre-existing tree before reconnect.
pub struct InMemoryTree {
    nodes: HashMap<NodeId, NodeData>,
    hashes: HashMap<NodeId, Hash>,
    root: NodeId,
}

/// Builds an [`InMemoryTree`] bottom-up; every node must be added before
/// anything that references it as a child.
#[derive(Default)]
pub struct TreeBuilder {
    nodes: HashMap<NodeId, NodeData>,
    hashes: HashMap<NodeId, Hash>,
    next_id: u64,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn leaf(&mut self, class_id: u64, version: i32, bytes: impl Into<Vec<u8>>) -> NodeId {
        let bytes = bytes.into();
        let hash = Hash::of_leaf(&bytes);
        let id = self.alloc();
        self.nodes.insert(id, NodeData::Leaf { class_id, version, bytes });
        self.hashes.insert(id, hash);
        id
    }

    pub fn internal(&mut self, class_id: u64, version: i32, children: Vec<Option<NodeId>>) -> NodeId {
        let child_hashes: Vec<Hash> = children
            .iter()
            .map(|c| c.and_then(|id| self.hashes.get(&id).copied()).unwrap_or(Hash::NULL))
            .collect();
        let hash = Hash::of_internal(class_id, version, &child_hashes);
        let id = self.alloc();
        self.nodes.insert(
            id,
            NodeData::Internal {
                class_id,
                version,
                children,
            },
        );
        self.hashes.insert(id, hash);
        id
    }

    pub fn finish(self, root: NodeId) -> InMemoryTree {
        InMemoryTree {
            nodes: self.nodes,
            hashes: self.hashes,
            root,
        }
    }

    fn alloc(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl InMemoryTree {
    pub fn root_id(&self) -> NodeId {
        self.root
    }

    pub fn hash_of_node(&self, node: Option<NodeId>) -> Hash {
        node.and_then(|id| self.hashes.get(&id).copied()).unwrap_or(Hash::NULL)
    }

    fn child(&self, parent: NodeId, index: usize) -> Option<NodeId> {
        match self.nodes.get(&parent) {
            Some(NodeData::Internal { children, .. }) => children.get(index).copied().flatten(),
            _ => None,
        }
    }
}

#[async_trait]
impl TeacherTreeView for InMemoryTree {
    async fn wait_until_ready(&self) -> Result<()> {
        Ok(())
    }

    async fn root(&self) -> NodeId {
        self.root
    }

    async fn get_child(&self, parent: NodeId, index: usize) -> Option<NodeId> {
        self.child(parent, index)
    }

    async fn hash_of(&self, node: Option<NodeId>) -> Hash {
        self.hash_of_node(node)
    }

    fn is_leaf(&self, node: NodeId) -> bool {
        matches!(self.nodes.get(&node), Some(NodeData::Leaf { .. }))
    }

    fn has_custom_view(&self, _node: NodeId) -> bool {
        false
    }

    fn class_id(&self, node: NodeId) -> u64 {
        match self.nodes.get(&node) {
            Some(NodeData::Leaf { class_id, .. }) | Some(NodeData::Internal { class_id, .. }) => *class_id,
            None => 0,
        }
    }

    fn version(&self, node: NodeId) -> i32 {
        match self.nodes.get(&node) {
            Some(NodeData::Leaf { version, .. }) | Some(NodeData::Internal { version, .. }) => *version,
            None => 0,
        }
    }

    fn child_count(&self, node: NodeId) -> usize {
        match self.nodes.get(&node) {
            Some(NodeData::Internal { children, .. }) => children.len(),
            _ => 0,
        }
    }

    fn serialize_leaf(&self, node: NodeId) -> Result<Vec<u8>> {
        match self.nodes.get(&node) {
            Some(NodeData::Leaf { bytes, .. }) => Ok(bytes.clone()),
            _ => Err(ReconnectError::Invariant(format!("node {node} is not a leaf"))),
        }
    }

    async fn build_teacher_view(&self, node: NodeId) -> Result<Box<dyn TeacherTreeView>> {
        Err(ReconnectError::Invariant(format!(
            "node {node} has no custom view to build"
        )))
    }
}

/// The learner side: reads from an immutable `original` tree and
/// accumulates a brand-new tree in `new_nodes`/`edges`.
pub struct InMemoryLearnerView {
    original: Option<Arc<InMemoryTree>>,
    new_nodes: Mutex<HashMap<NodeId, NodeData>>,
    edges: Mutex<HashMap<(NodeId, usize), Option<NodeId>>>,
    next_id: AtomicU64,
    queue: Mutex<VecDeque<ExpectedLesson>>,
    pending_init: Mutex<Vec<NodeId>>,
}

impl InMemoryLearnerView {
    pub fn new(original: Option<Arc<InMemoryTree>>) -> Self {
        InMemoryLearnerView {
            original,
            new_nodes: Mutex::new(HashMap::new()),
            edges: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            queue: Mutex::new(VecDeque::new()),
            pending_init: Mutex::new(Vec::new()),
        }
    }

    fn is_new(id: NodeId) -> bool {
        id & NEW_NODE_TAG != 0
    }

    fn alloc(&self) -> NodeId {
        (self.next_id.fetch_add(1, Ordering::SeqCst)) | NEW_NODE_TAG
    }

    /// Reconstructs an [`InMemoryTree`] from the accumulated new nodes, for
    /// assertions in tests. Panics if `set_child(ROOT_PARENT, ROOT_INDEX, _)`
    /// was never called.
    pub fn into_tree(self) -> InMemoryTree {
        let root = self
            .edges
            .lock()
            .unwrap()
            .get(&(ROOT_PARENT, ROOT_INDEX))
            .copied()
            .flatten()
            .expect("reconnect finished without installing a root");
        let new_nodes = self.new_nodes.into_inner().unwrap();
        let original = self.original;
        let mut hashes = HashMap::new();
        let mut nodes = HashMap::new();
        for (id, data) in &new_nodes {
            nodes.insert(*id, data.clone());
        }
        fn hash_rec(
            id: NodeId,
            new_nodes: &HashMap<NodeId, NodeData>,
            original: &Option<Arc<InMemoryTree>>,
            hashes: &mut HashMap<NodeId, Hash>,
        ) -> Hash {
            if let Some(h) = hashes.get(&id) {
                return *h;
            }
            if !InMemoryLearnerView::is_new(id) {
                let h = original.as_ref().map(|t| t.hash_of_node(Some(id))).unwrap_or(Hash::NULL);
                hashes.insert(id, h);
                return h;
            }
            let h = match new_nodes.get(&id) {
                Some(NodeData::Leaf { bytes, .. }) => Hash::of_leaf(bytes),
                Some(NodeData::Internal {
                    class_id,
                    version,
                    children,
                }) => {
                    let child_hashes: Vec<Hash> = children
                        .iter()
                        .map(|c| c.map(|cid| hash_rec(cid, new_nodes, original, hashes)).unwrap_or(Hash::NULL))
                        .collect();
                    Hash::of_internal(*class_id, *version, &child_hashes)
                }
                None => Hash::NULL,
            };
            hashes.insert(id, h);
            h
        }
        hash_rec(root, &new_nodes, &original, &mut hashes);
        // Pull in every node reachable from the new root so lookups work
        // uniformly regardless of whether a position was rebuilt or reused.
        fn collect(
            id: NodeId,
            new_nodes: &HashMap<NodeId, NodeData>,
            original: &Option<Arc<InMemoryTree>>,
            hashes: &mut HashMap<NodeId, Hash>,
            nodes: &mut HashMap<NodeId, NodeData>,
        ) {
            if nodes.contains_key(&id) {
                return;
            }
            if InMemoryLearnerView::is_new(id) {
                if let Some(data) = new_nodes.get(&id) {
                    if let NodeData::Internal { children, .. } = data {
                        for c in children.iter().flatten() {
                            collect(*c, new_nodes, original, hashes, nodes);
                        }
                    }
                    nodes.insert(id, data.clone());
                }
            } else if let Some(orig) = original {
                if let Some(data) = orig.nodes.get(&id) {
                    if let NodeData::Internal { children, .. } = data {
                        for c in children.iter().flatten() {
                            collect(*c, new_nodes, original, hashes, nodes);
                        }
                    }
                    nodes.insert(id, data.clone());
                    hashes.insert(id, orig.hash_of_node(Some(id)));
                }
            }
        }
        collect(root, &new_nodes, &original, &mut hashes, &mut nodes);
        InMemoryTree { nodes, hashes, root }
    }
}

#[async_trait]
impl LearnerTreeView for InMemoryLearnerView {
    async fn original_child(&self, parent: Option<NodeId>, index: usize) -> Option<NodeId> {
        let parent = parent?;
        if Self::is_new(parent) {
            return None;
        }
        self.original.as_ref()?.child(parent, index)
    }

    async fn original_hash(&self, node: Option<NodeId>) -> Hash {
        match node {
            Some(id) if !Self::is_new(id) => self.original.as_ref().map(|t| t.hash_of_node(Some(id))).unwrap_or(Hash::NULL),
            _ => Hash::NULL,
        }
    }

    async fn hash_of_new(&self, node: NodeId) -> Hash {
        // Cheap for tests: rebuild is small, so just recompute by walking
        // the accumulated new_nodes/edges on demand.
        let new_nodes = self.new_nodes.lock().unwrap();
        fn go(id: NodeId, new_nodes: &HashMap<NodeId, NodeData>, original: &Option<Arc<InMemoryTree>>) -> Hash {
            if !InMemoryLearnerView::is_new(id) {
                return original.as_ref().map(|t| t.hash_of_node(Some(id))).unwrap_or(Hash::NULL);
            }
            match new_nodes.get(&id) {
                Some(NodeData::Leaf { bytes, .. }) => Hash::of_leaf(bytes),
                Some(NodeData::Internal {
                    class_id,
                    version,
                    children,
                }) => {
                    let hs: Vec<Hash> = children
                        .iter()
                        .map(|c| c.map(|cid| go(cid, new_nodes, original)).unwrap_or(Hash::NULL))
                        .collect();
                    Hash::of_internal(*class_id, *version, &hs)
                }
                None => Hash::NULL,
            }
        }
        go(node, &new_nodes, &self.original)
    }

    fn expect_lesson_for(&self, parent: NodeId, index: usize, original: Option<NodeId>, already_present: bool) {
        self.queue.lock().unwrap().push_back(ExpectedLesson {
            parent,
            child_index: index,
            original,
            node_already_present: already_present,
        });
    }

    fn has_next(&self) -> bool {
        !self.queue.lock().unwrap().is_empty()
    }

    fn next_expected(&self) -> Option<ExpectedLesson> {
        self.queue.lock().unwrap().pop_front()
    }

    fn set_child(&self, parent: NodeId, index: usize, child: Option<NodeId>) {
        self.edges.lock().unwrap().insert((parent, index), child);
    }

    async fn deserialize_leaf(&self, class_id: u64, version: i32, bytes: &[u8]) -> Result<NodeId> {
        let id = self.alloc();
        self.new_nodes.lock().unwrap().insert(
            id,
            NodeData::Leaf {
                class_id,
                version,
                bytes: bytes.to_vec(),
            },
        );
        Ok(id)
    }

    async fn deserialize_internal(
        &self,
        class_id: u64,
        version: i32,
        child_count: usize,
        _vmap_bounds: Option<(i64, i64)>,
    ) -> Result<NodeId> {
        let id = self.alloc();
        self.new_nodes.lock().unwrap().insert(
            id,
            NodeData::Internal {
                class_id,
                version,
                children: vec![None; child_count],
            },
        );
        Ok(id)
    }

    fn mark_for_initialisation(&self, node: NodeId) {
        self.pending_init.lock().unwrap().push(node);
    }

    async fn initialise_all(&self) -> Result<()> {
        // The reference tree keeps children inline via `set_child`/`close`,
        // so there is no deferred linking step; this just drains the
        // children-before-parents bookkeeping list.
        self.pending_init.lock().unwrap().clear();
        Ok(())
    }

    fn new_root(&self) -> Option<NodeId> {
        self.edges.lock().unwrap().get(&(ROOT_PARENT, ROOT_INDEX)).copied().flatten()
    }

    async fn build_learner_view(&self, _original: Option<NodeId>, class_id: u64, _version: i32) -> Result<Box<dyn LearnerTreeView>> {
        Err(ReconnectError::Invariant(format!(
            "class {class_id} has no custom learner view in the reference tree"
        )))
    }

    async fn close(&self) -> Result<NodeId> {
        // Flush edges into the internal nodes' own `children` vectors so a
        // later `into_tree()` sees a self-contained structure.
        let edges = self.edges.lock().unwrap();
        let mut new_nodes = self.new_nodes.lock().unwrap();
        for (&(parent, index), &child) in edges.iter() {
            if parent == ROOT_PARENT {
                continue;
            }
            if let Some(NodeData::Internal { children, .. }) = new_nodes.get_mut(&parent) {
                if index < children.len() {
                    children[index] = child;
                }
            }
        }
        drop(new_nodes);
        self.new_root()
            .ok_or_else(|| ReconnectError::Invariant("no root installed at close()".into()))
    }
}

/// A small, fully in-memory [`VirtualMapSource`]: a complete binary tree of
/// `last_leaf_path - first_leaf_path + 1` leaves, with every leaf's bytes
/// supplied up front. Used by this crate's own tests the way
/// [`InMemoryTree`] backs the standard-view tests.
pub struct InMemoryVMapSource {
    class_id: u64,
    version: i32,
    first_leaf_path: i64,
    last_leaf_path: i64,
    leaves: HashMap<u64, Vec<u8>>,
}

impl InMemoryVMapSource {
    /// `leaves` must have a length that is a power of two; paths are
    /// assigned left-to-right at the bottom of the complete binary tree
    /// whose root is path `0`.
    pub fn new(class_id: u64, version: i32, leaves: Vec<Vec<u8>>) -> Self {
        let n = leaves.len();
        assert!(n.is_power_of_two(), "leaf count must be a power of two");
        let depth = n.trailing_zeros();
        let first_leaf_path = (1u64 << depth) - 1;
        let last_leaf_path = first_leaf_path + n as u64 - 1;
        let leaf_map = leaves
            .into_iter()
            .enumerate()
            .map(|(i, bytes)| (first_leaf_path + i as u64, bytes))
            .collect();
        InMemoryVMapSource {
            class_id,
            version,
            first_leaf_path: first_leaf_path as i64,
            last_leaf_path: last_leaf_path as i64,
            leaves: leaf_map,
        }
    }

    fn hash_rec(&self, path: u64) -> Hash {
        if path > self.last_leaf_path as u64 {
            return Hash::NULL;
        }
        if path >= self.first_leaf_path as u64 {
            return Hash::of_leaf(self.leaves.get(&path).expect("path within leaf range has no bytes"));
        }
        let l = self.hash_rec(left_child(path));
        let r = self.hash_rec(right_child(path));
        Hash::of_internal(self.class_id, self.version, &[l, r])
    }
}

#[async_trait]
impl VirtualMapSource for InMemoryVMapSource {
    fn class_id(&self) -> u64 {
        self.class_id
    }

    fn version(&self) -> i32 {
        self.version
    }

    fn bounds(&self) -> (i64, i64) {
        (self.first_leaf_path, self.last_leaf_path)
    }

    async fn hash_of(&self, path: u64) -> Hash {
        self.hash_rec(path)
    }

    fn serialize_leaf(&self, path: u64) -> Result<Vec<u8>> {
        self.leaves
            .get(&path)
            .cloned()
            .ok_or_else(|| ReconnectError::Invariant(format!("no leaf at path {path}")))
    }
}

/// A small, fully in-memory [`VirtualMapSink`]: accumulates pushed leaves
/// and reused-subtree markers, and on `finish()` recomputes the root hash
/// by walking the same path arithmetic the source uses, falling back to
/// `original` for any path that was reused rather than rewritten.
pub struct InMemoryVMapSink {
    class_id: u64,
    version: i32,
    original: Option<Arc<InMemoryVMapSource>>,
    bounds: Mutex<Option<(i64, i64)>>,
    leaves: Mutex<HashMap<u64, Vec<u8>>>,
    reused: Mutex<std::collections::HashSet<u64>>,
}

impl InMemoryVMapSink {
    pub fn new(class_id: u64, version: i32, original: Option<Arc<InMemoryVMapSource>>) -> Self {
        InMemoryVMapSink {
            class_id,
            version,
            original,
            bounds: Mutex::new(None),
            leaves: Mutex::new(HashMap::new()),
            reused: Mutex::new(std::collections::HashSet::new()),
        }
    }

    fn hash_rec(&self, path: u64, last_leaf_path: i64) -> Hash {
        if path > last_leaf_path as u64 {
            return Hash::NULL;
        }
        if self.reused.lock().unwrap().contains(&path) {
            return self
                .original
                .as_ref()
                .expect("reuse_subtree called with no original backing the sink")
                .hash_rec(path);
        }
        if let Some(bytes) = self.leaves.lock().unwrap().get(&path) {
            return Hash::of_leaf(bytes);
        }
        let l = self.hash_rec(left_child(path), last_leaf_path);
        let r = self.hash_rec(right_child(path), last_leaf_path);
        Hash::of_internal(self.class_id, self.version, &[l, r])
    }
}

#[async_trait]
impl VirtualMapSink for InMemoryVMapSink {
    fn set_bounds(&self, first_leaf_path: i64, last_leaf_path: i64) {
        *self.bounds.lock().unwrap() = Some((first_leaf_path, last_leaf_path));
    }

    async fn push_leaf(&self, path: u64, bytes: Vec<u8>) -> Result<()> {
        self.leaves.lock().unwrap().insert(path, bytes);
        Ok(())
    }

    async fn reuse_subtree(&self, path: u64) -> Result<()> {
        self.reused.lock().unwrap().insert(path);
        Ok(())
    }

    async fn finish(&self) -> Result<Hash> {
        let (_, last_leaf_path) = self
            .bounds
            .lock()
            .unwrap()
            .ok_or_else(|| ReconnectError::Invariant("finish called before bounds were set".into()))?;
        Ok(self.hash_rec(0, last_leaf_path))
    }
}
