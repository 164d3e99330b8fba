//! Parsing of `GET /history/{prompt_id}` responses.
//!
//! The response is keyed by prompt id:
//!
//! ```json
//! {"<prompt_id>": {
//!     "outputs": {"9": {"images": [{"filename": "x.png", "subfolder": "", "type": "output"}]}},
//!     "status": {"status_str": "success", "completed": true, "messages": [...]}
//! }}
//! ```
//!
//! An empty object means the prompt has not finished yet.

use serde_json::Value;

/// One image written by a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryImage {
    pub node_id: String,
    pub filename: String,
    /// Empty subfolders are normalized to `None`.
    pub subfolder: Option<String>,
    /// `output`, `temp`, ...
    pub kind: String,
}

/// Outcome of a finished prompt as recorded by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptOutcome {
    Success(Vec<HistoryImage>),
    Error(String),
}

/// Read a prompt's outcome from a history response.
///
/// Returns `None` while the prompt is absent (still queued or running)
/// or present but not marked completed.
pub fn parse_history(history: &Value, prompt_id: &str) -> Option<PromptOutcome> {
    let entry = history.get(prompt_id)?;
    let status = entry.get("status");

    let status_str = status
        .and_then(|s| s.get("status_str"))
        .and_then(Value::as_str);
    if status_str == Some("error") {
        return Some(PromptOutcome::Error(error_message(status)));
    }

    let completed = status
        .and_then(|s| s.get("completed"))
        .and_then(Value::as_bool)
        // Servers predating the status block only record finished prompts.
        .unwrap_or(true);
    if !completed {
        return None;
    }

    Some(PromptOutcome::Success(output_images(entry.get("outputs"))))
}

/// Collect every image from an `outputs` map (also the shape of an
/// `executed` message's `output` when wrapped by node id).
pub fn output_images(outputs: Option<&Value>) -> Vec<HistoryImage> {
    let Some(nodes) = outputs.and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut images: Vec<HistoryImage> = nodes
        .iter()
        .flat_map(|(node_id, output)| node_images(node_id, output))
        .collect();
    images.sort_by(|a, b| a.node_id.cmp(&b.node_id).then(a.filename.cmp(&b.filename)));
    images
}

/// Images from a single node's output object.
pub fn node_images(node_id: &str, output: &Value) -> Vec<HistoryImage> {
    output
        .get("images")
        .and_then(Value::as_array)
        .map(|images| {
            images
                .iter()
                .filter_map(|image| {
                    let filename = image.get("filename")?.as_str()?.to_string();
                    let subfolder = image
                        .get("subfolder")
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string);
                    let kind = image
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("output")
                        .to_string();
                    Some(HistoryImage {
                        node_id: node_id.to_string(),
                        filename,
                        subfolder,
                        kind,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Pull the exception text out of `status.messages`, which is a list of
/// `[event_name, payload]` pairs.
fn error_message(status: Option<&Value>) -> String {
    status
        .and_then(|s| s.get("messages"))
        .and_then(Value::as_array)
        .and_then(|messages| {
            messages.iter().find_map(|m| {
                let pair = m.as_array()?;
                if pair.first()?.as_str()? != "execution_error" {
                    return None;
                }
                pair.get(1)?
                    .get("exception_message")?
                    .as_str()
                    .map(str::to_string)
            })
        })
        .unwrap_or_else(|| "ComfyUI reported an execution error".to_string())
}
