//! Teacher algorithm.
//!
//! The protocol separates three concerns that this implementation maps
//! onto one driver plus the stream layer's own background pump:
//!
//! - The response-reader is the background pump already owned by
//!   [`AsyncInputStream`] — it continuously deserialises responses off the
//!   wire into a bounded buffer the moment [`anticipate`](AsyncInputStream::anticipate)
//!   says one is expected, which is exactly "read booleans from the
//!   learner, one per query sent, in the same order."
//! - Sending queries and sending the lessons that answer them are combined
//!   into one driver task, since they always advance in lockstep (one
//!   query ⇒ one lesson) — there is no information a split would preserve
//!   that a single sequential loop doesn't already have. Pipelining (the
//!   lesson-sender must not outpace the queue of pending responses) falls
//!   out of `anticipate()` being non-blocking: the driver sends queries for
//!   an entire window of `config.async_stream_buffer_size` nodes ahead of
//!   reading any of their responses, bounded exactly by the input stream's
//!   own buffer capacity.
//!
//! Custom-subtree recursion is then just this same function calling itself
//! against the sub-view — since there is only the one driver task per
//! level, nested and outer queries can never interleave on the wire.

use crate::config::ReconnectConfig;
use crate::error::{ReconnectError, Result};
use crate::stream::{AsyncInputStream, AsyncOutputStream};
use crate::view::TeacherTreeView;
use crate::wire::{Lesson, Query, Response};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info_span, trace, warn, Instrument};

/// Wraps a [`TeacherTreeView::wait_until_ready`] failure in its own error
/// kind so callers can tell "the view never became traversable" apart from
/// an ordinary I/O or protocol failure mid-traversal.
async fn wait_until_ready(view: &dyn TeacherTreeView) -> Result<()> {
    view.wait_until_ready()
        .await
        .map_err(|e| ReconnectError::ViewReadyFailed(e.to_string()))
}

/// Everything the teacher sends, multiplexed onto one outbound direction of
/// the byte stream: one stream instance, one message type, per direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TeacherToLearner {
    Query(Query),
    Lesson(Lesson),
}

/// Runs the teacher side of reconnect to completion over `connection`.
pub async fn run_teacher<C>(view: Arc<dyn TeacherTreeView>, connection: C, config: ReconnectConfig) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    wait_until_ready(view.as_ref()).await?;

    let (read_half, write_half) = tokio::io::split(connection);
    let mut output = AsyncOutputStream::<TeacherToLearner>::new(
        write_half,
        config.async_stream_buffer_size,
        config.flush_interval(),
        config.max_message_size,
    );
    let mut input =
        AsyncInputStream::<Response>::new(read_half, config.async_stream_buffer_size, config.max_message_size);

    let root = view.root().await;
    let class_id = view.class_id(root);
    let result = traverse(view.as_ref(), &output, &mut input, root, true, &config)
        .instrument(info_span!("teacher_reconnect", class_id))
        .await;

    if let Err(e) = &result {
        error!(error = %e, "teacher traversal failed");
    }
    // Both cleanup steps run regardless of which one fails, and regardless
    // of whether the traversal itself failed: a broken connection makes
    // `close` likely to error too, and skipping `abort` in that case would
    // leak the input pump's background task and its queued messages.
    if let Err(e) = output.close().await {
        warn!(error = %e, "error closing output stream during teardown");
    }
    input.abort().await;
    result
}

/// BFS-with-a-pipelining-window traversal of one subtree, recursing into
/// custom views at their boundary.
#[async_recursion::async_recursion]
async fn traverse(
    view: &dyn TeacherTreeView,
    output: &AsyncOutputStream<TeacherToLearner>,
    input: &mut AsyncInputStream<Response>,
    root: crate::view::NodeId,
    is_root_of_state: bool,
    config: &ReconnectConfig,
) -> Result<()> {
    let send_timeout = config.send_timeout();
    let poll_timeout = config.poll_timeout();
    let window = config.async_stream_buffer_size.max(1);

    let mut worklist: VecDeque<(crate::view::NodeId, bool)> = VecDeque::new();
    worklist.push_back((root, is_root_of_state));
    let mut in_flight: VecDeque<(crate::view::NodeId, bool)> = VecDeque::new();

    while !worklist.is_empty() || !in_flight.is_empty() {
        while in_flight.len() < window {
            let Some((node, is_root)) = worklist.pop_front() else {
                break;
            };
            let hash = view.hash_of(Some(node)).await;
            trace!(node, %hash, "sending query");
            output
                .send(TeacherToLearner::Query(Query::new(hash)), send_timeout)
                .await?;
            input.anticipate();
            in_flight.push_back((node, is_root));
        }

        let Some((node, is_root)) = in_flight.pop_front() else {
            continue;
        };
        let response = input.read_anticipated(poll_timeout).await?;
        trace!(node, already_have = response.already_have, "got response");

        if response.already_have {
            if is_root {
                warn!(node, "learner already has the entire subtree root; nothing to resync");
            }
            // Never descend into a subtree the learner already has.
            output.send(TeacherToLearner::Lesson(Lesson::Empty), send_timeout).await?;
            continue;
        }

        if view.is_leaf(node) {
            let bytes = view.serialize_leaf(node)?;
            debug!(node, bytes = bytes.len(), "sending leaf lesson");
            output
                .send(
                    TeacherToLearner::Lesson(Lesson::Leaf {
                        class_id: view.class_id(node),
                        version: view.version(node),
                        bytes,
                    }),
                    send_timeout,
                )
                .await?;
            continue;
        }

        if view.has_custom_view(node) {
            let class_id = view.class_id(node);
            debug!(node, class_id, "sending custom-subtree marker lesson");
            output
                .send(
                    TeacherToLearner::Lesson(Lesson::CustomSubtreeMarker {
                        class_id,
                        version: view.version(node),
                    }),
                    send_timeout,
                )
                .await?;
            let sub_view = view.build_teacher_view(node).await?;
            wait_until_ready(sub_view.as_ref()).await?;
            let sub_root = sub_view.root().await;
            let sub_class_id = sub_view.class_id(sub_root);
            traverse(sub_view.as_ref(), output, input, sub_root, false, config)
                .instrument(info_span!("teacher_reconnect", class_id = sub_class_id))
                .await?;
            view.release(node);
            continue;
        }

        // Plain internal: header + ordered child hashes, and every
        // present child goes back onto the worklist for its own query.
        let child_count = view.child_count(node);
        let mut child_hashes = Vec::with_capacity(child_count);
        let mut children = Vec::with_capacity(child_count);
        for i in 0..child_count {
            let child = view.get_child(node, i).await;
            let hash = view.hash_of(child).await;
            child_hashes.push(hash.as_bytes());
            children.push(child);
        }
        debug!(node, child_count, "sending internal lesson");
        output
            .send(
                TeacherToLearner::Lesson(Lesson::Internal {
                    class_id: view.class_id(node),
                    version: view.version(node),
                    child_hashes,
                    is_root_of_state: is_root,
                    vmap_bounds: view.vmap_bounds(node),
                }),
                send_timeout,
            )
            .await?;
        for child in children.into_iter().flatten() {
            worklist.push_back((child, false));
        }
    }

    Ok(())
}
