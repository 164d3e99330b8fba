//! `miktos-bridge`: runs the workflow bridge in-process.
//!
//! ```text
//! miktos-bridge                         # serve until SIGINT/SIGTERM
//! miktos-bridge workflows               # list registered workflows
//! miktos-bridge models                  # list models offered by the executor
//! miktos-bridge submit <workflow> <json>
//! ```
//!
//! `submit` prints every progress event as a JSON line followed by the
//! final task snapshot. Configuration comes from `MIKTOS_*` variables
//! (see `BridgeConfig::from_env`), optionally loaded from `.env`. Logs go
//! to stderr, filtered by `RUST_LOG`.

use anyhow::{bail, Context};
use futures::StreamExt;
use miktos_core::task::TaskState;
use miktos_pipeline::config::BridgeConfig;
use miktos_pipeline::orchestrator::BridgeOrchestrator;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // `MIKTOS_LOG_FORMAT=json` switches to structured log lines.
    let json_logs = std::env::var("MIKTOS_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "miktos_worker=debug,miktos_pipeline=debug".into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();

    let config = BridgeConfig::from_env().context("Invalid configuration")?;
    tracing::info!(
        executor = %config.executor,
        output_dir = %config.output_dir.display(),
        "Loaded configuration"
    );

    let bridge = BridgeOrchestrator::from_config(&config).context("Failed to set up bridge")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let outcome = match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] => serve(&bridge).await,
        ["workflows"] => {
            for workflow in bridge.list_workflows() {
                println!("{}", serde_json::to_string(&*workflow)?);
            }
            Ok(())
        }
        ["models"] => {
            for model in bridge.available_models().await? {
                println!("{model}");
            }
            Ok(())
        }
        ["submit", workflow, parameters] => submit(&bridge, workflow, parameters).await,
        _ => bail!("usage: miktos-bridge [workflows | models | submit <workflow> <json>]"),
    };

    bridge.shutdown().await;
    outcome
}

async fn serve(bridge: &BridgeOrchestrator) -> anyhow::Result<()> {
    let health = bridge.health().await;
    tracing::info!(
        executor = %health.executor,
        connected = health.executor_connected,
        workflows = health.workflows,
        "Bridge ready"
    );
    if !health.executor_connected {
        tracing::warn!("Executor is not reachable; submissions will fail until it is");
    }

    shutdown_signal().await;
    tracing::info!(active = bridge.active_tasks(), "Cancelling running tasks");
    Ok(())
}

async fn submit(bridge: &BridgeOrchestrator, workflow: &str, parameters: &str) -> anyhow::Result<()> {
    let parameters: serde_json::Value =
        serde_json::from_str(parameters).context("Parameters must be a JSON object")?;

    let (task, subscription) = bridge.submit_and_subscribe(workflow, &parameters)?;
    tracing::info!(task_id = %task.id, workflow, "Task submitted");

    let mut events = Box::pin(subscription.into_stream());
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
            () = shutdown_signal() => {
                bridge.cancel(task.id)?;
            }
        }
    }

    let task = bridge.status(task.id)?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    if task.state != TaskState::Succeeded {
        bail!("task {} ended in state {:?}", task.id, task.state);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT (Ctrl-C), shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
