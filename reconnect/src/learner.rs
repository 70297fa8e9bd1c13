//! Learner algorithm, mirroring the single-driver design used by
//! [`crate::teacher`]:
//!
//! - The query/lesson reader is `AsyncInputStream`'s own background pump,
//!   reading whichever [`TeacherToLearner`] variant comes next.
//! - Sending responses and applying the lessons that follow them are
//!   combined into one driver, because a `Query` and the `Lesson` that
//!   answers it never carry their own position on the wire — the driver is
//!   the thing that keeps a worklist mirroring the teacher's own traversal
//!   order, so it always knows which tree position the next arriving
//!   message is about. It dequeues a worklist entry per `Query`, and the
//!   matching per-view expected-lesson entry per `Lesson`.
//!
//! Custom-subtree recursion is this same function called again against the
//! sub-view returned by [`LearnerTreeView::build_learner_view`].

use crate::config::ReconnectConfig;
use crate::error::{ReconnectError, Result};
use crate::hash::Hash;
use crate::stream::{AsyncInputStream, AsyncOutputStream};
use crate::teacher::TeacherToLearner;
use crate::view::{LearnerTreeView, NodeId, ROOT_INDEX, ROOT_PARENT};
use crate::wire::{Lesson, Response};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info_span, trace, warn, Instrument};

/// Runs the learner side of reconnect to completion over `connection`,
/// returning the root of the newly reconstructed subtree.
///
/// `original_root` is the learner's pre-existing node at the root position,
/// if any — `None` when the learner has no prior state there at all.
pub async fn run_learner<C>(
    view: Arc<dyn LearnerTreeView>,
    connection: C,
    original_root: Option<NodeId>,
    config: ReconnectConfig,
) -> Result<NodeId>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(connection);
    let mut output = AsyncOutputStream::<Response>::new(
        write_half,
        config.async_stream_buffer_size,
        config.flush_interval(),
        config.max_message_size,
    );
    let mut input = AsyncInputStream::<TeacherToLearner>::new(
        read_half,
        config.async_stream_buffer_size,
        config.max_message_size,
    );

    let result = traverse(view.as_ref(), &output, &mut input, original_root, &config)
        .instrument(info_span!("learner_reconnect"))
        .await;

    if let Err(e) = &result {
        error!(error = %e, "learner traversal failed");
    }
    // Both cleanup steps run regardless of which one fails, and regardless
    // of whether the traversal itself failed: a broken connection makes
    // `close` likely to error too, and skipping `abort` in that case would
    // leak the input pump's background task and its queued messages.
    if let Err(e) = output.close().await {
        warn!(error = %e, "error closing output stream during teardown");
    }
    input.abort().await;

    let expected_root_hash = result?;

    view.initialise_all().await.map_err(|e| {
        error!(error = %e, "failed to initialise reconstructed subtree");
        e
    })?;
    let root = view.close().await.map_err(|e| {
        error!(error = %e, "failed to close learner view");
        e
    })?;

    if config.verify_root_hash {
        let actual = view.hash_of_new(root).await;
        if actual != expected_root_hash {
            let e = ReconnectError::Protocol(format!(
                "reconstructed root hash {actual} does not match teacher's root hash {expected_root_hash}"
            ));
            error!(error = %e, "root hash verification failed");
            return Err(e);
        }
    }

    Ok(root)
}

/// Drives one subtree's worth of query/lesson exchange, returning the
/// teacher's hash for this subtree's root as reported on its `Query`.
#[async_recursion::async_recursion]
async fn traverse(
    view: &dyn LearnerTreeView,
    output: &AsyncOutputStream<Response>,
    input: &mut AsyncInputStream<TeacherToLearner>,
    root_original: Option<NodeId>,
    config: &ReconnectConfig,
) -> Result<Hash> {
    let send_timeout = config.send_timeout();
    let poll_timeout = config.poll_timeout();

    let mut worklist: VecDeque<(NodeId, usize, Option<NodeId>)> =
        VecDeque::from([(ROOT_PARENT, ROOT_INDEX, root_original)]);
    let mut root_hash: Option<Hash> = None;

    while !worklist.is_empty() || view.has_next() {
        input.anticipate();
        let message = input.read_anticipated(poll_timeout).await?;

        match message {
            TeacherToLearner::Query(query) => {
                let (parent, index, original) = worklist.pop_front().ok_or_else(|| {
                    let e = ReconnectError::Protocol("received a query with no outstanding worklist entry".into());
                    error!(error = %e, "protocol violation");
                    e
                })?;
                let query_hash = query.hash()?;
                trace!(parent, index, %query_hash, "got query");
                if parent == ROOT_PARENT {
                    root_hash = Some(query_hash);
                }
                let have_hash = view.original_hash(original).await;
                let already_have = have_hash == query_hash;
                trace!(parent, index, already_have, "sending response");
                if already_have && original.is_none() {
                    warn!(parent, index, "reporting already-have at a position with no prior node at all");
                }
                output.send(Response { already_have }, send_timeout).await?;
                view.expect_lesson_for(parent, index, original, already_have);
            }
            TeacherToLearner::Lesson(lesson) => {
                let expected = view.next_expected().ok_or_else(|| {
                    let e = ReconnectError::Protocol("received a lesson with no expected entry".into());
                    error!(error = %e, "protocol violation");
                    e
                })?;
                apply_lesson(view, output, input, lesson, expected.parent, expected.child_index, expected.original, &mut worklist, config)
                    .await?;
            }
        }
    }

    root_hash.ok_or_else(|| ReconnectError::Protocol("subtree closed without ever receiving its root query".into()))
}

#[allow(clippy::too_many_arguments)]
async fn apply_lesson(
    view: &dyn LearnerTreeView,
    output: &AsyncOutputStream<Response>,
    input: &mut AsyncInputStream<TeacherToLearner>,
    lesson: Lesson,
    parent: NodeId,
    index: usize,
    original: Option<NodeId>,
    worklist: &mut VecDeque<(NodeId, usize, Option<NodeId>)>,
    config: &ReconnectConfig,
) -> Result<()> {
    match lesson {
        Lesson::Empty => {
            trace!(parent, index, "applying empty lesson, reusing original");
            // The learner keeps its own subtree at this position unchanged.
            view.apply_reuse(parent, index, original).await?;
        }
        Lesson::Leaf { class_id, version, bytes } => {
            debug!(parent, index, class_id, bytes = bytes.len(), "applying leaf lesson");
            let node = view.deserialize_leaf(class_id, version, &bytes).await?;
            view.set_child(parent, index, Some(node));
        }
        Lesson::Internal {
            class_id,
            version,
            child_hashes,
            is_root_of_state: _,
            vmap_bounds,
        } => {
            debug!(parent, index, class_id, child_count = child_hashes.len(), "applying internal lesson");
            let node = view
                .deserialize_internal(class_id, version, child_hashes.len(), vmap_bounds)
                .await?;
            view.mark_for_initialisation(node);
            view.set_child(parent, index, Some(node));
            for i in 0..child_hashes.len() {
                let child_original = view.original_child(original, i).await;
                worklist.push_back((node, i, child_original));
            }
        }
        Lesson::CustomSubtreeMarker { class_id, version } => {
            debug!(parent, index, class_id, "applying custom-subtree marker lesson");
            let sub_view = view.build_learner_view(original, class_id, version).await?;
            let _sub_root_hash = traverse(sub_view.as_ref(), output, input, original, config)
                .instrument(info_span!("learner_reconnect", class_id))
                .await?;
            let sub_root = sub_view.close().await?;
            view.set_child(parent, index, Some(sub_root));
            if let Some(o) = original {
                view.release(o);
            }
        }
    }
    Ok(())
}
