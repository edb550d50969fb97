use anyhow::Result;
use briefcast_orchestrator::dispatcher::{DispatchPolicy, Dispatcher};
use briefcast_orchestrator::worker::{HttpWorkerClient, WorkerService};
use briefcast_orchestrator::{config, db, retry, sweep};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run one maintenance sweep, drain due retries and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Skip the retry ledger and only run the sweep
    #[arg(long)]
    skip_retries: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let worker: Arc<dyn WorkerService> = Arc::new(HttpWorkerClient::from_config(&cfg.workers)?);
    let max_backoff = cfg.retry.max_backoff_seconds as i64;
    let callback = cfg.audio_callback_url();

    let (dispatcher, queue) = Dispatcher::new(
        pool.clone(),
        Arc::clone(&worker),
        DispatchPolicy {
            stagger: cfg.stagger(),
            max_retries: cfg.retry.max_retries as i32,
            max_backoff_secs: max_backoff,
            callback_url: Some(callback.clone()),
            lease: cfg.dispatch_lease(),
        },
    );
    let queue_task = tokio::spawn(queue.run());

    let report = sweep::run_sweep(&pool, &dispatcher, Utc::now()).await;
    info!(
        failed = report.timed_out_failed,
        completed = report.timed_out_completed,
        recovered = report.recovered,
        promoted = report.partial_promoted,
        audio_completed = report.audio_completed,
        dispatched = report.dispatched,
        redispatched = report.redispatched,
        errors = report.errors,
        "sweep complete"
    );

    // Dropping the last handle lets the queue send what was enqueued, wait for
    // those sends and stop.
    drop(dispatcher);
    queue_task.await?;

    if !args.skip_retries {
        let handled = retry::drain_due(&pool, worker.as_ref(), Some(callback.as_str()), max_backoff).await?;
        let open = db::count_open_retries(&pool).await?;
        info!(handled, open, "retry ledger drained");
        if open > 0 {
            warn!(open, "retry entries remain in backoff");
        }
    }

    if report.errors > 0 {
        warn!(errors = report.errors, "some batches could not be reconciled; see log above");
    }
    Ok(())
}
