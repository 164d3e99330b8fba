//! WebSocket message processing for a single submitted prompt.
//!
//! Reads raw frames from a ComfyUI WebSocket connection, parses them
//! into typed [`ComfyUIMessage`] variants, and reduces the ones that
//! concern one prompt to [`PromptEvent`]s.

use futures::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::client::ComfyUIClientError;
use crate::history::{node_images, HistoryImage};
use crate::messages::{parse_message, ComfyUIMessage};

/// What happened to the tracked prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptEvent {
    Started,
    /// Step progress within the current node.
    Progress { value: u32, max: u32 },
    /// A node began executing.
    Executing(String),
    /// A node produced images.
    Output(Vec<HistoryImage>),
    /// The prompt finished.
    Completed,
    /// The prompt was interrupted server-side.
    Interrupted,
    /// The prompt failed inside a node.
    Failed { node_id: String, message: String },
}

/// Reduce a message to an event for `prompt_id`, or `None` if it is
/// unrelated (another prompt, queue status, cache notices).
///
/// Progress frames from servers that omit `prompt_id` are attributed to
/// the tracked prompt, since execution messages are only routed to the
/// submitting client.
pub fn classify(msg: &ComfyUIMessage, prompt_id: &str) -> Option<PromptEvent> {
    if msg.prompt_id().is_some_and(|id| id != prompt_id) {
        return None;
    }

    match msg {
        ComfyUIMessage::ExecutionStart(_) => Some(PromptEvent::Started),
        ComfyUIMessage::Progress(data) => Some(PromptEvent::Progress {
            value: data.value.max(0).unsigned_abs(),
            max: data.max.max(0).unsigned_abs(),
        }),
        ComfyUIMessage::Executing(data) => match (&data.node, &data.prompt_id) {
            (_, None) => None,
            (Some(node), Some(_)) => Some(PromptEvent::Executing(node.clone())),
            (None, Some(_)) => Some(PromptEvent::Completed),
        },
        ComfyUIMessage::Executed(data) => {
            let images = node_images(&data.node, &data.output);
            (!images.is_empty()).then_some(PromptEvent::Output(images))
        }
        ComfyUIMessage::ExecutionSuccess(_) => Some(PromptEvent::Completed),
        ComfyUIMessage::ExecutionInterrupted(_) => Some(PromptEvent::Interrupted),
        ComfyUIMessage::ExecutionError(data) => Some(PromptEvent::Failed {
            node_id: data.node_id.clone(),
            message: format!("{}: {}", data.exception_type, data.exception_message),
        }),
        ComfyUIMessage::ExecutionCached(data) => {
            tracing::debug!(prompt_id, cached = data.nodes.len(), "Execution used cache");
            None
        }
        ComfyUIMessage::Status(data) => {
            tracing::debug!(
                queue_remaining = data.status.exec_info.queue_remaining,
                "ComfyUI queue status",
            );
            None
        }
    }
}

/// Wait for the next event concerning `prompt_id`.
///
/// Unparseable and unrelated frames are skipped. Binary frames (preview
/// images) are ignored. Returns [`ComfyUIClientError::Protocol`] when the
/// socket closes or errors before an event arrives.
pub async fn next_prompt_event<S>(
    ws_stream: &mut S,
    prompt_id: &str,
) -> Result<PromptEvent, ComfyUIClientError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = ws_stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match parse_message(&text) {
                Ok(msg) => {
                    if let Some(event) = classify(&msg, prompt_id) {
                        return Ok(event);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        raw_message = %text,
                        "Failed to parse ComfyUI message",
                    );
                }
            },
            Ok(Message::Binary(_)) => {
                tracing::trace!(prompt_id, "Ignoring binary message (preview image)");
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Ok(Message::Close(frame)) => {
                tracing::info!(?frame, "ComfyUI WebSocket closed");
                return Err(ComfyUIClientError::Protocol("WebSocket closed".to_string()));
            }
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket receive error");
                return Err(ComfyUIClientError::Protocol(e.to_string()));
            }
        }
    }
    Err(ComfyUIClientError::Protocol("WebSocket stream ended".to_string()))
}
