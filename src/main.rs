use anyhow::{Context, Result};
use briefcast_orchestrator::dispatcher::{DispatchPolicy, Dispatcher};
use briefcast_orchestrator::scheduler::PeriodicTask;
use briefcast_orchestrator::server::{self, AppState};
use briefcast_orchestrator::worker::{HttpWorkerClient, WorkerService};
use briefcast_orchestrator::{config, db, generation, retry, sweep};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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
    let audio_callback = cfg.audio_callback_url();

    let (dispatcher, queue) = Dispatcher::new(
        pool.clone(),
        Arc::clone(&worker),
        DispatchPolicy {
            stagger: cfg.stagger(),
            max_retries: cfg.retry.max_retries as i32,
            max_backoff_secs: max_backoff,
            callback_url: Some(audio_callback.clone()),
            lease: cfg.dispatch_lease(),
        },
    );
    tokio::spawn(queue.run());

    // Retry ledger worker (single-threaded)
    {
        let pool = pool.clone();
        let worker = Arc::clone(&worker);
        let poll_sleep = Duration::from_millis(cfg.retry.poll_interval_ms);
        let callback = audio_callback.clone();
        tokio::spawn(async move {
            loop {
                match retry::process_next_retry(&pool, worker.as_ref(), Some(callback.as_str()), max_backoff)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => tokio::time::sleep(poll_sleep).await,
                    Err(err) => {
                        error!(?err, "retry worker error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    {
        let pool = pool.clone();
        let dispatcher = dispatcher.clone();
        PeriodicTask::new("maintenance-sweep", cfg.sweep_interval())
            .immediate(true)
            .spawn(move || {
                let pool = pool.clone();
                let dispatcher = dispatcher.clone();
                async move {
                    sweep::run_sweep(&pool, &dispatcher, Utc::now()).await;
                }
            });
    }

    if cfg.generation.enabled {
        let pool = pool.clone();
        let worker = Arc::clone(&worker);
        let user_ids = cfg.generation.user_ids.clone();
        let timeout = cfg.batch_timeout();
        let callback = cfg.summary_callback_url();
        PeriodicTask::new("summary-generation", cfg.generation_interval()).spawn(move || {
            let pool = pool.clone();
            let worker = Arc::clone(&worker);
            let user_ids = user_ids.clone();
            let callback = callback.clone();
            async move {
                if let Err(err) = generation::run_generation_cycle(
                    &pool,
                    worker.as_ref(),
                    &user_ids,
                    timeout,
                    Some(callback.as_str()),
                )
                .await
                {
                    error!(?err, "summary generation failed");
                }
            }
        });
    }

    let state = AppState {
        pool,
        dispatcher,
        batch_timeout: cfg.batch_timeout(),
    };
    let listener = tokio::net::TcpListener::bind(&cfg.app.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.app.bind_addr))?;
    info!(addr = %cfg.app.bind_addr, "starting ingress server");
    axum::serve(listener, server::build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    Ok(())
}
