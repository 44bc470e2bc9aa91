use std::sync::Arc;

use tracing_subscriber::fmt::writer::MakeWriterExt;

use agent_queue::config::{self, Config};
use agent_queue::engine::{EngineDeps, ExecutionEngine};
use agent_queue::notify::{LogSink, NotificationSink, OutputSink};
use agent_queue::store::TaskRepository;

/// Prints live agent output to the terminal, prefixed with the task ID.
struct StdoutSink;

impl OutputSink for StdoutSink {
    fn on_line(&self, task_id: &str, line: &str) {
        println!("[{task_id}] {line}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let working_dir = match std::env::var("AGENT_QUEUE_DIR") {
        Ok(dir) => std::path::PathBuf::from(dir),
        Err(_) => std::env::current_dir()?,
    };
    let data_dir = config::data_dir(&working_dir);

    let repository = Arc::new(TaskRepository::new(data_dir.clone()));
    repository.ensure_layout().await?;

    // Log to stderr and to app.log inside the data directory.
    let (file_writer, _log_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&data_dir, "app.log"));
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(file_writer.and(std::io::stderr))
        .with_ansi(false)
        .with_target(false)
        .init();

    let config = Config::load(&data_dir).await?;
    let agent = config.agent_command();

    eprintln!("agent-queue v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Data dir: {}", data_dir.display());
    eprintln!("   Agent: {} {}", agent.command, agent.args.join(" "));
    if config.parallel_execution {
        eprintln!(
            "   Mode: parallel (max {} concurrent)",
            config.effective_max_parallel()
        );
    } else {
        eprintln!("   Mode: sequential");
    }
    eprintln!("   Timeout: {} min per attempt\n", config.task_timeout_minutes);

    // Recover tasks left in-progress by an unclean shutdown before any
    // execution loop starts.
    let orphans = repository.cleanup_orphan_tasks().await?;
    if orphans > 0 {
        tracing::info!(count = orphans, "recovered orphaned tasks to ready");
    }

    let deps = EngineDeps {
        repository,
        config,
        sinks: vec![Arc::new(LogSink) as Arc<dyn NotificationSink>],
        output: Some(Arc::new(StdoutSink) as Arc<dyn OutputSink>),
    };
    let engine = Arc::new(ExecutionEngine::new(deps));

    let engine_for_signal = Arc::clone(&engine);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested, letting in-flight tasks finish");
            engine_for_signal.stop();
        }
    });

    engine.run().await;
    Ok(())
}
