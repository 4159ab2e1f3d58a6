use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod poll;

use freem_core::config::Settings;
use freem_core::drain::Drainer;
use freem_core::pipeline::Pipeline;
use freem_crm::MauticClient;
use freem_queue::FileQueue;

#[derive(Debug, Parser)]
#[command(name = "freem-worker")]
#[command(about = "Drains the webhook queue into the CRM", version)]
struct Args {
    /// Run a single drain pass and exit.
    #[arg(long)]
    once: bool,
    /// Seconds between passes; overrides FREEM_POLL_INTERVAL_SECS.
    #[arg(long)]
    interval_secs: Option<u64>,
    /// Skip the CRM field mapping check at startup.
    #[arg(long)]
    skip_field_check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let args = Args::parse();
    let settings = Settings::from_env()?;

    let crm = MauticClient::new(&settings.mautic)?;
    let pipeline = Arc::new(Pipeline::from_settings(&settings, Arc::new(crm))?);

    if !args.skip_field_check {
        let missing = poll::check_field_mappings(&pipeline).await;
        if !missing.is_empty() {
            error!(?missing, "field mappings reference unknown crm fields");
        }
    }

    let queue = FileQueue::open(&settings.queue_dir)?;
    let drainer = Drainer::new(queue, pipeline, settings.max_attempts);

    if args.once {
        let report = poll::tick(&drainer).await?;
        info!(?report, "single pass finished");
        return Ok(());
    }

    let interval = Duration::from_secs(args.interval_secs.unwrap_or(settings.poll_interval_secs).max(1));
    info!(
        ?interval,
        queue_dir = %settings.queue_dir.display(),
        max_attempts = settings.max_attempts,
        "worker starting"
    );

    poll::run(&drainer, interval, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    })
    .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["freem-worker"]).unwrap();
        assert!(!args.once);
        assert_eq!(args.interval_secs, None);
        assert!(!args.skip_field_check);
    }

    #[test]
    fn test_args_with_all_options() {
        let args = Args::try_parse_from([
            "freem-worker",
            "--once",
            "--interval-secs", "5",
            "--skip-field-check",
        ])
        .unwrap();

        assert!(args.once);
        assert_eq!(args.interval_secs, Some(5));
        assert!(args.skip_field_check);
    }

    #[test]
    fn test_args_rejects_bad_interval() {
        let result = Args::try_parse_from(["freem-worker", "--interval-secs", "soon"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_args_rejects_unknown_flag() {
        let result = Args::try_parse_from(["freem-worker", "--forever"]);
        assert!(result.is_err());
    }
}
