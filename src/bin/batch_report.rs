use anyhow::{anyhow, Result};
use briefcast_orchestrator::{config, db};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(about = "Print batch lifecycle state")]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Show a single batch with its units
    #[arg(long)]
    batch_id: Option<String>,

    /// Number of recent batches to list when no batch id is given
    #[arg(long, default_value = "20")]
    limit: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let pool = db::init_pool(&cfg.database_url()).await?;

    if let Some(batch_id) = args.batch_id {
        let snapshot = db::fetch_snapshot(&pool, &batch_id)
            .await?
            .ok_or_else(|| anyhow!("batch {} not found", batch_id))?;
        let b = &snapshot.batch;
        println!("Batch {}", b.batch_id);
        println!("  status:    {}", b.status);
        println!("  received:  {}/{}", b.received_count, b.expected_count);
        println!(
            "  units:     {} persisted, {} with audio",
            snapshot.units.persisted, snapshot.units.with_artifact
        );
        println!("  created:   {}", b.created_at);
        println!("  deadline:  {}", b.timeout_at);
        if let Some(reason) = &b.failure_reason {
            println!("  failure:   {}", reason);
        }
        println!("Units:");
        for unit in db::list_units(&pool, &batch_id).await? {
            println!(
                "  {} user={} audio={} dispatched={}",
                unit.unit_id,
                unit.user_id,
                unit.artifact_url.as_deref().unwrap_or("-"),
                unit.dispatched_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".into())
            );
        }
        return Ok(());
    }

    for b in db::list_recent_batches(&pool, args.limit).await? {
        println!(
            "{}  {:<16} {:>3}/{:<3} created {}",
            b.batch_id,
            b.status.as_str(),
            b.received_count,
            b.expected_count,
            b.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}
