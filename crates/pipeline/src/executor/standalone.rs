//! In-process executor that simulates generation without any backend.
//!
//! Each requested map passes through two simulated stages (sampling and
//! saving), so a task with `n` maps reports `k / 2n` for `k = 0..=2n`.
//! Used for development and tests; never touches the network or disk.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use miktos_core::task::{OutputRef, TaskResult};
use tokio_util::sync::CancellationToken;

use super::{ExecutionError, ExecutionJob, Executor, ExecutorKind, ProgressSink};
use crate::texture::TextureRequest;

const MOCK_MODELS: [&str; 3] = ["standalone_sd_v1.5", "standalone_sd_xl", "standalone_control_net"];

pub struct StandaloneExecutor {
    output_dir: PathBuf,
    stage_delay: Duration,
}

impl StandaloneExecutor {
    /// * `output_dir`  - directory the synthetic output locations point into.
    /// * `stage_delay` - simulated duration of every stage.
    pub fn new(output_dir: impl Into<PathBuf>, stage_delay: Duration) -> Self {
        Self {
            output_dir: output_dir.into(),
            stage_delay,
        }
    }

    fn stage_label(maps: &[String], step: usize) -> String {
        if step == 0 {
            return "starting".to_string();
        }
        let map = &maps[(step - 1) / 2];
        if step % 2 == 1 {
            format!("sampling {map}")
        } else {
            format!("saved {map}")
        }
    }
}

#[async_trait]
impl Executor for StandaloneExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Standalone
    }

    async fn check_connection(&self) -> bool {
        true
    }

    async fn available_models(&self) -> Result<Vec<String>, ExecutionError> {
        Ok(MOCK_MODELS.iter().map(|m| m.to_string()).collect())
    }

    async fn execute(
        &self,
        job: ExecutionJob,
        sink: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<TaskResult, ExecutionError> {
        let request = TextureRequest::from_params(&job.parameters)?;
        let started = Instant::now();
        let total = request.maps.len() * 2;

        tracing::info!(
            task_id = %job.task_id,
            workflow = %job.workflow,
            maps = request.maps.len(),
            "[standalone] Simulating execution",
        );

        for step in 0..=total {
            if step > 0 {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
                    _ = tokio::time::sleep(self.stage_delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }
            let label = Self::stage_label(&request.maps, step);
            sink.report(step as f64 / total as f64, Some(&label));
        }

        let outputs: Vec<OutputRef> = request
            .maps
            .iter()
            .map(|map| OutputRef {
                location: self
                    .output_dir
                    .join(format!("{}_{map}.png", job.task_id))
                    .to_string_lossy()
                    .into_owned(),
                map_type: Some(map.clone()),
                node_id: None,
                subfolder: None,
            })
            .collect();

        let metadata = request.metadata(job.task_id, self.kind(), &outputs);
        tracing::info!(task_id = %job.task_id, outputs = outputs.len(), "[standalone] Execution completed");

        Ok(TaskResult {
            outputs,
            backend_refs: Vec::new(),
            metadata,
            execution_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<(f64, Option<String>)>>);

    impl ProgressSink for RecordingSink {
        fn report(&self, fraction: f64, stage: Option<&str>) {
            self.0.lock().push((fraction, stage.map(str::to_string)));
        }
    }

    fn job(params: serde_json::Value) -> ExecutionJob {
        ExecutionJob {
            task_id: miktos_core::types::new_task_id(),
            workflow: "basic_texture".to_string(),
            parameters: params.as_object().cloned().unwrap(),
        }
    }

    #[tokio::test]
    async fn single_map_reports_three_steps() {
        let executor = StandaloneExecutor::new("out", Duration::from_millis(1));
        let sink = RecordingSink::default();
        let job = job(json!({"prompt": "red brick wall texture", "size": [512, 512]}));
        let task_id = job.task_id;

        let result = executor.execute(job, &sink, CancellationToken::new()).await.unwrap();

        let fractions: Vec<f64> = sink.0.lock().iter().map(|(f, _)| *f).collect();
        assert_eq!(fractions, vec![0.0, 0.5, 1.0]);
        assert_eq!(result.outputs.len(), 1);
        assert_eq!(
            PathBuf::from(&result.outputs[0].location),
            PathBuf::from("out").join(format!("{task_id}_diffuse.png"))
        );
        assert_eq!(result.metadata["size"], json!([512, 512]));
    }

    #[tokio::test]
    async fn one_output_per_map() {
        let executor = StandaloneExecutor::new("out", Duration::ZERO);
        let sink = RecordingSink::default();
        let result = executor
            .execute(
                job(json!({"prompt": "metal", "maps": ["diffuse", "normal", "roughness"]})),
                &sink,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let maps: Vec<_> = result.outputs.iter().filter_map(|o| o.map_type.as_deref()).collect();
        assert_eq!(maps, vec!["diffuse", "normal", "roughness"]);

        let reports = sink.0.lock();
        assert_eq!(reports.len(), 7);
        assert!(reports.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(reports[1].1.as_deref(), Some("sampling diffuse"));
    }

    #[tokio::test]
    async fn cancelled_token_stops_execution() {
        let executor = StandaloneExecutor::new("out", Duration::from_secs(60));
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();

        let run = executor.execute(job(json!({"prompt": "x"})), &sink, cancel.clone());
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(run, canceller);

        assert!(matches!(result, Err(ExecutionError::Cancelled)));
        assert_eq!(sink.0.lock().len(), 1);
    }

    #[tokio::test]
    async fn reports_mock_models_and_is_always_connected() {
        let executor = StandaloneExecutor::new("out", Duration::ZERO);
        assert!(executor.check_connection().await);
        assert_eq!(executor.available_models().await.unwrap().len(), 3);
    }
}
