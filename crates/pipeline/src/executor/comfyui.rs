//! Executor backed by a ComfyUI server.
//!
//! Every requested texture map is rendered by its own prompt graph. For
//! each one the executor opens a WebSocket with a fresh client id,
//! submits the graph via `POST /prompt`, and follows the execution
//! messages for the returned prompt id. If the socket drops before the
//! prompt finishes, it falls back to polling `GET /history/{prompt_id}`
//! with exponential backoff.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use miktos_comfyui::api::{ComfyUIApi, ComfyUIApiError};
use miktos_comfyui::backoff::{poll_history, BackoffConfig};
use miktos_comfyui::client::{ComfyUIClient, ComfyUIClientError};
use miktos_comfyui::history::{HistoryImage, PromptOutcome};
use miktos_comfyui::processor::{next_prompt_event, PromptEvent};
use miktos_core::task::{OutputRef, TaskResult};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{ExecutionError, ExecutionJob, Executor, ExecutorKind, ProgressSink};
use crate::texture::{build_texture_graph, TextureRequest};

/// Share of the progress range covered by sampling; the rest is
/// reserved for collecting outputs.
const SAMPLING_SHARE: f64 = 0.9;

#[derive(Debug, Clone)]
pub struct ComfyUIExecutorConfig {
    /// HTTP base URL, e.g. `http://localhost:8188`. The WebSocket URL is
    /// derived from it.
    pub base_url: String,
    /// Bound on establishing HTTP and WebSocket connections.
    pub connect_timeout: Duration,
    /// Bound on each individual HTTP request.
    pub request_timeout: Duration,
    /// Bound on the whole execution of one task.
    pub execution_timeout: Duration,
    /// Backoff used when polling history after the socket drops.
    pub poll_backoff: BackoffConfig,
}

impl Default for ComfyUIExecutorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8188".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            execution_timeout: Duration::from_secs(300),
            poll_backoff: BackoffConfig::default(),
        }
    }
}

pub struct ComfyUIExecutor {
    api: ComfyUIApi,
    client: ComfyUIClient,
    config: ComfyUIExecutorConfig,
}

impl ComfyUIExecutor {
    pub fn new(config: ComfyUIExecutorConfig) -> Result<Self, ExecutionError> {
        let client = ComfyUIClient::from_api_url(&config.base_url);
        let api = ComfyUIApi::with_timeouts(
            client.api_url().to_string(),
            config.connect_timeout,
            config.request_timeout,
        )
        .map_err(|e| ExecutionError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { api, client, config })
    }

    pub fn config(&self) -> &ComfyUIExecutorConfig {
        &self.config
    }

    /// Render every requested map in turn.
    async fn run_maps(
        &self,
        job: &ExecutionJob,
        request: &TextureRequest,
        progress: &mut Progress<'_>,
        in_flight: &Mutex<Option<String>>,
        cancel: &CancellationToken,
    ) -> Result<(Vec<OutputRef>, Vec<String>), ExecutionError> {
        let map_count = request.maps.len();
        let mut outputs = Vec::new();
        let mut prompt_ids = Vec::with_capacity(map_count);

        for (index, map) in request.maps.iter().enumerate() {
            progress.report(overall_fraction(index, 0, 0, map_count), &format!("queued {map}"));

            let graph = build_texture_graph(request, map);
            let (prompt_id, images) = self
                .run_prompt(&graph, index, map_count, map, progress, in_flight, cancel)
                .await?;

            tracing::info!(
                task_id = %job.task_id,
                prompt_id = %prompt_id,
                map = %map,
                images = images.len(),
                "ComfyUI map rendered",
            );

            outputs.extend(images.into_iter().map(|image| OutputRef {
                location: image.filename,
                map_type: Some(map.clone()),
                node_id: Some(image.node_id),
                subfolder: image.subfolder,
            }));
            prompt_ids.push(prompt_id);
        }

        Ok((outputs, prompt_ids))
    }

    /// Submit one graph and wait for its images.
    #[allow(clippy::too_many_arguments)]
    async fn run_prompt(
        &self,
        graph: &serde_json::Value,
        index: usize,
        map_count: usize,
        map: &str,
        progress: &mut Progress<'_>,
        in_flight: &Mutex<Option<String>>,
        cancel: &CancellationToken,
    ) -> Result<(String, Vec<HistoryImage>), ExecutionError> {
        let mut conn = self
            .client
            .connect(self.config.connect_timeout)
            .await
            .map_err(map_client_error)?;

        let submitted = self
            .api
            .submit_workflow(graph, &conn.client_id)
            .await
            .map_err(map_api_error)?;
        if submitted
            .node_errors
            .as_object()
            .is_some_and(|errors| !errors.is_empty())
        {
            return Err(ExecutionError::ExecutionFailed(format!(
                "ComfyUI rejected the graph: {}",
                submitted.node_errors
            )));
        }

        let prompt_id = submitted.prompt_id;
        *in_flight.lock() = Some(prompt_id.clone());
        tracing::debug!(prompt_id = %prompt_id, queue_position = submitted.number, "Prompt queued");

        let mut images = Vec::new();
        let mut finished = false;
        while !finished {
            match next_prompt_event(&mut conn.ws_stream, &prompt_id).await {
                Ok(PromptEvent::Started) => {
                    tracing::debug!(prompt_id = %prompt_id, "Prompt started");
                }
                Ok(PromptEvent::Progress { value, max }) => {
                    progress.report(
                        overall_fraction(index, value, max, map_count),
                        &format!("sampling {map}"),
                    );
                }
                Ok(PromptEvent::Executing(node)) => {
                    tracing::trace!(prompt_id = %prompt_id, node = %node, "Node executing");
                }
                Ok(PromptEvent::Output(node_images)) => images.extend(node_images),
                Ok(PromptEvent::Completed) => finished = true,
                Ok(PromptEvent::Interrupted) => {
                    return Err(ExecutionError::ExecutionFailed(
                        "prompt was interrupted on the ComfyUI server".to_string(),
                    ));
                }
                Ok(PromptEvent::Failed { node_id, message }) => {
                    return Err(ExecutionError::ExecutionFailed(format!(
                        "node {node_id} failed: {message}"
                    )));
                }
                Err(e) => {
                    tracing::warn!(
                        prompt_id = %prompt_id,
                        error = %e,
                        "ComfyUI WebSocket lost, polling history",
                    );
                    images = self.await_history(&prompt_id, cancel).await?;
                    finished = true;
                }
            }
        }

        // `executed` frames are not guaranteed; history is authoritative.
        if images.is_empty() {
            images = self.await_history(&prompt_id, cancel).await?;
        }
        let _ = conn.ws_stream.close(None).await;
        *in_flight.lock() = None;

        images.retain(|image| image.kind != "temp");
        if images.is_empty() {
            return Err(ExecutionError::ExecutionFailed(format!(
                "prompt {prompt_id} finished without producing images"
            )));
        }
        Ok((prompt_id, images))
    }

    async fn await_history(
        &self,
        prompt_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<HistoryImage>, ExecutionError> {
        match poll_history(&self.api, prompt_id, &self.config.poll_backoff, cancel)
            .await
            .map_err(map_api_error)?
        {
            Some(PromptOutcome::Success(images)) => Ok(images),
            Some(PromptOutcome::Error(message)) => Err(ExecutionError::ExecutionFailed(message)),
            None => Err(ExecutionError::Cancelled),
        }
    }

    /// Best-effort removal of an abandoned prompt from the server.
    async fn abort_prompt(&self, prompt_id: &str) {
        if let Err(e) = self.api.cancel_execution(prompt_id).await {
            tracing::warn!(prompt_id, error = %e, "Failed to delete prompt from ComfyUI queue");
        }
        if let Err(e) = self.api.interrupt().await {
            tracing::warn!(prompt_id, error = %e, "Failed to interrupt ComfyUI execution");
        }
    }
}

#[async_trait]
impl Executor for ComfyUIExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::ComfyUI
    }

    async fn check_connection(&self) -> bool {
        match self.api.system_stats().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "ComfyUI health probe failed");
                false
            }
        }
    }

    async fn available_models(&self) -> Result<Vec<String>, ExecutionError> {
        self.api.checkpoint_names().await.map_err(map_api_error)
    }

    async fn execute(
        &self,
        job: ExecutionJob,
        sink: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<TaskResult, ExecutionError> {
        let request = TextureRequest::from_params(&job.parameters)?;
        let started = Instant::now();
        let in_flight = Mutex::new(None);
        let mut progress = Progress::new(sink);
        let timeout = self.config.execution_timeout;

        let outcome = {
            let run = self.run_maps(&job, &request, &mut progress, &in_flight, &cancel);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
                result = tokio::time::timeout(timeout, run) => match result {
                    Ok(result) => result,
                    Err(_) => Err(ExecutionError::Timeout(format!(
                        "execution exceeded {}s",
                        timeout.as_secs_f64()
                    ))),
                },
            }
        };

        let (outputs, prompt_ids) = match outcome {
            Ok(done) => done,
            Err(err) => {
                if matches!(err, ExecutionError::Cancelled | ExecutionError::Timeout(_)) {
                    let abandoned = in_flight.lock().take();
                    if let Some(prompt_id) = abandoned {
                        self.abort_prompt(&prompt_id).await;
                    }
                }
                tracing::warn!(task_id = %job.task_id, error = %err, "ComfyUI execution failed");
                return Err(err);
            }
        };

        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        progress.report(1.0, "completed");

        let metadata = request.metadata(job.task_id, self.kind(), &outputs);
        Ok(TaskResult {
            outputs,
            backend_refs: prompt_ids,
            metadata,
            execution_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Forwards only strictly increasing fractions to the sink.
struct Progress<'a> {
    sink: &'a dyn ProgressSink,
    last: Option<f64>,
}

impl<'a> Progress<'a> {
    fn new(sink: &'a dyn ProgressSink) -> Self {
        Self { sink, last: None }
    }

    fn report(&mut self, fraction: f64, stage: &str) {
        if self.last.is_some_and(|last| fraction <= last) {
            return;
        }
        self.last = Some(fraction);
        self.sink.report(fraction, Some(stage));
    }
}

/// Overall progress for step `value` of `max` while rendering map
/// `index` of `map_count`.
pub fn overall_fraction(index: usize, value: u32, max: u32, map_count: usize) -> f64 {
    let step = if max == 0 {
        0.0
    } else {
        (f64::from(value) / f64::from(max)).clamp(0.0, 1.0)
    };
    (index as f64 + step) / map_count.max(1) as f64 * SAMPLING_SHARE
}

fn map_client_error(err: ComfyUIClientError) -> ExecutionError {
    match err {
        ComfyUIClientError::Connection(msg) => ExecutionError::ServiceUnavailable(msg),
        ComfyUIClientError::Timeout(after) => ExecutionError::ServiceUnavailable(format!(
            "ComfyUI did not accept a WebSocket connection within {}s",
            after.as_secs_f64()
        )),
        ComfyUIClientError::Protocol(msg) => ExecutionError::ExecutionFailed(msg),
    }
}

fn map_api_error(err: ComfyUIApiError) -> ExecutionError {
    if err.is_connect() {
        return ExecutionError::ServiceUnavailable(err.to_string());
    }
    if err.is_timeout() {
        return ExecutionError::Timeout(err.to_string());
    }
    match err {
        ComfyUIApiError::ApiError { status: 502..=504, .. } => {
            ExecutionError::ServiceUnavailable(err.to_string())
        }
        _ => ExecutionError::ExecutionFailed(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_spans_maps_and_reserves_tail() {
        assert_eq!(overall_fraction(0, 0, 0, 1), 0.0);
        assert!((overall_fraction(0, 10, 20, 1) - 0.45).abs() < 1e-9);
        assert!((overall_fraction(0, 20, 20, 1) - 0.9).abs() < 1e-9);
        assert!((overall_fraction(1, 0, 20, 2) - 0.45).abs() < 1e-9);
        assert!(overall_fraction(0, 50, 20, 1) <= SAMPLING_SHARE);
    }

    #[test]
    fn progress_forwards_only_increases() {
        #[derive(Default)]
        struct Sink(Mutex<Vec<f64>>);
        impl ProgressSink for Sink {
            fn report(&self, fraction: f64, _stage: Option<&str>) {
                self.0.lock().push(fraction);
            }
        }

        let sink = Sink::default();
        let mut progress = Progress::new(&sink);
        for f in [0.0, 0.0, 0.3, 0.2, 0.3, 0.9, 1.0] {
            progress.report(f, "x");
        }
        assert_eq!(*sink.0.lock(), vec![0.0, 0.3, 0.9, 1.0]);
    }

    #[test]
    fn api_status_errors_map_to_failure_kinds() {
        let unavailable = map_api_error(ComfyUIApiError::ApiError {
            status: 503,
            body: "busy".into(),
        });
        assert!(matches!(unavailable, ExecutionError::ServiceUnavailable(_)));

        let rejected = map_api_error(ComfyUIApiError::ApiError {
            status: 400,
            body: "bad graph".into(),
        });
        assert!(matches!(rejected, ExecutionError::ExecutionFailed(_)));
    }

    #[test]
    fn client_errors_map_to_failure_kinds() {
        assert!(matches!(
            map_client_error(ComfyUIClientError::Connection("refused".into())),
            ExecutionError::ServiceUnavailable(_)
        ));
        assert!(matches!(
            map_client_error(ComfyUIClientError::Protocol("closed".into())),
            ExecutionError::ExecutionFailed(_)
        ));
    }
}
