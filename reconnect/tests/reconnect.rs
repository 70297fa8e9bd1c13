//! End-to-end exercises of `run_teacher`/`run_learner` against the
//! in-memory reference tree, talking over an in-process duplex pipe.

use reconnect::test_support::{InMemoryLearnerView, InMemoryTree, InMemoryVMapSink, InMemoryVMapSource, TreeBuilder};
use reconnect::vmap::{VirtualMapLearnerView, VirtualMapSource, VirtualMapTeacherView};
use reconnect::{run_learner, run_teacher, LearnerTreeView, ReconnectConfig, ReconnectError, TeacherTreeView};
use std::sync::Arc;

const TRACE: bool = false;
static INIT: std::sync::Once = std::sync::Once::new();

fn init_tracing() {
    if TRACE {
        INIT.call_once(|| {
            tracing_subscriber::fmt().with_env_filter("debug").init();
        });
    }
}

fn small_tree(second_leaf: &str) -> InMemoryTree {
    let mut b = TreeBuilder::new();
    let x = b.leaf(10, 1, "leaf-x");
    let y = b.leaf(10, 1, second_leaf);
    let inner = b.internal(20, 1, vec![Some(x), Some(y)]);
    let z = b.leaf(10, 1, "leaf-z");
    let root = b.internal(21, 1, vec![Some(inner), Some(z)]);
    b.finish(root)
}

async fn run_pair(
    teacher_tree: InMemoryTree,
    original: Option<Arc<InMemoryTree>>,
    config: ReconnectConfig,
) -> (reconnect::NodeId, InMemoryTree) {
    let (teacher_conn, learner_conn) = tokio::io::duplex(1 << 20);

    let teacher_view: Arc<dyn reconnect::TeacherTreeView> = Arc::new(teacher_tree);
    let original_root = original.as_ref().map(|t| t.root_id());
    let learner_view = Arc::new(InMemoryLearnerView::new(original));
    let learner_view_for_run: Arc<dyn reconnect::LearnerTreeView> = learner_view.clone();

    let teacher_cfg = config;
    let teacher_task = tokio::spawn(async move { run_teacher(teacher_view, teacher_conn, teacher_cfg).await });
    let learner_task =
        tokio::spawn(async move { run_learner(learner_view_for_run, learner_conn, original_root, config).await });

    let (teacher_result, learner_result) = tokio::join!(teacher_task, learner_task);
    teacher_result.unwrap().expect("teacher side failed");
    let root = learner_result.unwrap().expect("learner side failed");

    let learner_view = Arc::try_unwrap(learner_view)
        .unwrap_or_else(|_| panic!("learner view still shared after reconnect completed"));
    (root, learner_view.into_tree())
}

fn assert_same_shape(expected: &InMemoryTree, got: &InMemoryTree, got_root: reconnect::NodeId) {
    assert_eq!(
        expected.hash_of_node(Some(expected.root_id())),
        got.hash_of_node(Some(got_root))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn full_sync_from_empty_learner() {
    init_tracing();
    let teacher_tree = small_tree("leaf-y");
    let expected = small_tree("leaf-y");
    let (root, got) = run_pair(teacher_tree, None, ReconnectConfig::default()).await;
    assert_same_shape(&expected, &got, root);
}

#[tokio::test(flavor = "multi_thread")]
async fn identical_trees_reuse_everything() {
    init_tracing();
    let teacher_tree = small_tree("leaf-y");
    let original = Arc::new(small_tree("leaf-y"));
    let expected = small_tree("leaf-y");
    let (root, got) = run_pair(teacher_tree, Some(original), ReconnectConfig::default()).await;
    assert_same_shape(&expected, &got, root);
}

#[tokio::test(flavor = "multi_thread")]
async fn single_changed_leaf_is_resynced() {
    init_tracing();
    let teacher_tree = small_tree("leaf-y-changed");
    let original = Arc::new(small_tree("leaf-y"));
    let expected = small_tree("leaf-y-changed");
    let (root, got) = run_pair(teacher_tree, Some(original), ReconnectConfig::default()).await;
    assert_same_shape(&expected, &got, root);
}

#[tokio::test(flavor = "multi_thread")]
async fn verify_root_hash_passes_on_a_correct_rebuild() {
    init_tracing();
    let teacher_tree = small_tree("leaf-y");
    let original = Arc::new(small_tree("leaf-y"));
    let config = ReconnectConfig {
        verify_root_hash: true,
        ..ReconnectConfig::default()
    };
    let expected = small_tree("leaf-y");
    let (root, got) = run_pair(teacher_tree, Some(original), config).await;
    assert_same_shape(&expected, &got, root);
}

#[tokio::test(flavor = "multi_thread")]
async fn learner_times_out_when_teacher_never_answers() {
    init_tracing();
    let (_teacher_conn, learner_conn) = tokio::io::duplex(1 << 16);
    let original: Option<Arc<InMemoryTree>> = None;
    let learner_view: Arc<dyn reconnect::LearnerTreeView> = Arc::new(InMemoryLearnerView::new(original));
    let config = ReconnectConfig {
        async_stream_timeout_ms: 50,
        ..ReconnectConfig::default()
    };
    let err = run_learner(learner_view, learner_conn, None, config).await.unwrap_err();
    assert!(matches!(err, ReconnectError::Timeout(_) | ReconnectError::Io(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn teacher_closes_cleanly_when_learner_drops_connection() {
    init_tracing();
    let teacher_tree = small_tree("leaf-y");
    let (teacher_conn, learner_conn) = tokio::io::duplex(1 << 16);
    let teacher_view: Arc<dyn reconnect::TeacherTreeView> = Arc::new(teacher_tree);
    let config = ReconnectConfig {
        async_stream_timeout_ms: 200,
        ..ReconnectConfig::default()
    };
    drop(learner_conn);
    let err = run_teacher(teacher_view, teacher_conn, config).await.unwrap_err();
    assert!(matches!(err, ReconnectError::Io(_) | ReconnectError::Timeout(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn deep_subtree_with_only_a_leaf_changed_keeps_untouched_branches() {
    init_tracing();
    let mut original_builder = TreeBuilder::new();
    let mut leaves = Vec::new();
    for i in 0..8 {
        leaves.push(Some(original_builder.leaf(5, 0, format!("v{i}"))));
    }
    let left = original_builder.internal(6, 0, leaves[0..4].to_vec());
    let right = original_builder.internal(6, 0, leaves[4..8].to_vec());
    let original_root = original_builder.internal(7, 0, vec![Some(left), Some(right)]);
    let original = Arc::new(original_builder.finish(original_root));

    let mut teacher_builder = TreeBuilder::new();
    let mut teacher_leaves = Vec::new();
    for i in 0..8 {
        let value = if i == 5 { "v5-changed".to_string() } else { format!("v{i}") };
        teacher_leaves.push(Some(teacher_builder.leaf(5, 0, value)));
    }
    let t_left = teacher_builder.internal(6, 0, teacher_leaves[0..4].to_vec());
    let t_right = teacher_builder.internal(6, 0, teacher_leaves[4..8].to_vec());
    let t_root = teacher_builder.internal(7, 0, vec![Some(t_left), Some(t_right)]);
    let teacher_tree = teacher_builder.finish(t_root);

    let mut expected_builder = TreeBuilder::new();
    let mut expected_leaves = Vec::new();
    for i in 0..8 {
        let value = if i == 5 { "v5-changed".to_string() } else { format!("v{i}") };
        expected_leaves.push(Some(expected_builder.leaf(5, 0, value)));
    }
    let e_left = expected_builder.internal(6, 0, expected_leaves[0..4].to_vec());
    let e_right = expected_builder.internal(6, 0, expected_leaves[4..8].to_vec());
    let e_root = expected_builder.internal(7, 0, vec![Some(e_left), Some(e_right)]);
    let expected = expected_builder.finish(e_root);

    let (root, got) = run_pair(teacher_tree, Some(original), ReconnectConfig::default()).await;
    assert_same_shape(&expected, &got, root);
}

#[tokio::test(flavor = "multi_thread")]
async fn small_buffer_size_still_completes_a_sync() {
    init_tracing();
    let teacher_tree = small_tree("leaf-y-changed");
    let original = Arc::new(small_tree("leaf-y"));
    let expected = small_tree("leaf-y-changed");
    let config = ReconnectConfig {
        async_stream_buffer_size: 1,
        ..ReconnectConfig::default()
    };
    let (root, got) = run_pair(teacher_tree, Some(original), config).await;
    assert_same_shape(&expected, &got, root);
}

fn four_leaves(values: [&str; 4]) -> InMemoryVMapSource {
    InMemoryVMapSource::new(30, 1, values.iter().map(|v| v.as_bytes().to_vec()).collect())
}

async fn run_vmap_pair(
    teacher_map: InMemoryVMapSource,
    original_map: Option<Arc<InMemoryVMapSource>>,
) -> Arc<InMemoryVMapSink> {
    let teacher_view: Arc<dyn TeacherTreeView> = Arc::new(VirtualMapTeacherView::new(Arc::new(teacher_map)));
    let original_root = original_map.as_ref().map(|_| 0u64);
    let sink = Arc::new(InMemoryVMapSink::new(30, 1, original_map.clone()));
    let original_dyn: Option<Arc<dyn VirtualMapSource>> = original_map.map(|m| m as Arc<dyn VirtualMapSource>);
    let learner_view: Arc<dyn LearnerTreeView> = Arc::new(VirtualMapLearnerView::new(original_dyn, sink.clone()));

    let (teacher_conn, learner_conn) = tokio::io::duplex(1 << 16);
    let config = ReconnectConfig::default();
    let teacher_task = tokio::spawn(async move { run_teacher(teacher_view, teacher_conn, config).await });
    let learner_task =
        tokio::spawn(async move { run_learner(learner_view, learner_conn, original_root, config).await });
    let (teacher_result, learner_result) = tokio::join!(teacher_task, learner_task);
    teacher_result.unwrap().expect("teacher side failed");
    learner_result.unwrap().expect("learner side failed");

    sink
}

#[tokio::test(flavor = "multi_thread")]
async fn virtual_map_full_sync_from_empty_learner() {
    init_tracing();
    let teacher_map = four_leaves(["a", "b", "c", "d"]);
    let expected_map = four_leaves(["a", "b", "c", "d"]);
    let sink = run_vmap_pair(teacher_map, None).await;

    let expected_hash = expected_map.hash_of(0).await;
    let rebuilt_hash = sink.finish().await.unwrap();
    assert_eq!(expected_hash, rebuilt_hash);
}

#[tokio::test(flavor = "multi_thread")]
async fn virtual_map_single_changed_leaf_is_resynced() {
    init_tracing();
    let original_map = Arc::new(four_leaves(["a", "b", "c", "d"]));
    let teacher_map = four_leaves(["a", "b-changed", "c", "d"]);
    let expected_map = four_leaves(["a", "b-changed", "c", "d"]);
    let sink = run_vmap_pair(teacher_map, Some(original_map)).await;

    let expected_hash = expected_map.hash_of(0).await;
    let rebuilt_hash = sink.finish().await.unwrap();
    assert_eq!(expected_hash, rebuilt_hash);
}

#[tokio::test(flavor = "multi_thread")]
async fn virtual_map_identical_map_reuses_every_leaf() {
    init_tracing();
    let original_map = Arc::new(four_leaves(["a", "b", "c", "d"]));
    let teacher_map = four_leaves(["a", "b", "c", "d"]);
    let expected_map = four_leaves(["a", "b", "c", "d"]);
    let sink = run_vmap_pair(teacher_map, Some(original_map)).await;

    let expected_hash = expected_map.hash_of(0).await;
    let rebuilt_hash = sink.finish().await.unwrap();
    assert_eq!(expected_hash, rebuilt_hash);
}


#[quickcheck_macros::quickcheck]
fn round_trip_reproduces_the_teacher_tree(leaves: Vec<Vec<u8>>, start_from_prior: bool) -> bool {
    let leaves: Vec<Vec<u8>> = leaves.into_iter().take(8).collect();
    if leaves.is_empty() {
        return true;
    }

    let build = |leaves: &[Vec<u8>]| -> InMemoryTree {
        let mut b = TreeBuilder::new();
        let mut ids: Vec<reconnect::NodeId> = leaves.iter().map(|bytes| b.leaf(50, 1, bytes.clone())).collect();
        let mut class = 51u64;
        while ids.len() > 1 {
            let mut next = Vec::new();
            for pair in ids.chunks(2) {
                let children = pair.iter().map(|&id| Some(id)).collect();
                next.push(b.internal(class, 1, children));
            }
            ids = next;
            class += 1;
        }
        b.finish(ids[0])
    };

    let teacher_tree = build(&leaves);
    let expected = build(&leaves);

    let original = if start_from_prior { Some(Arc::new(build(&leaves))) } else { None };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async move {
        let (root, got) = run_pair(teacher_tree, original, ReconnectConfig::default()).await;
        expected.hash_of_node(Some(expected.root_id())) == got.hash_of_node(Some(root))
    })
}

