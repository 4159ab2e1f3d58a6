use backoff::{backoff::Backoff, ExponentialBackoff};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use freem_core::drain::{DrainReport, Drainer};
use freem_core::pipeline::Pipeline;
use freem_core::queue::{Queue, QueueError};

/// Longest wait between retries after the queue store fails.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Compares the catalog's field mappings with the CRM's custom fields and
/// logs every mapped field the CRM does not know. Returns them as
/// `"<product>.<field>"`.
pub async fn check_field_mappings(pipeline: &Pipeline) -> Vec<String> {
    let fields = match pipeline.contacts().client().field_list().await {
        Ok(fields) => fields,
        Err(err) => {
            warn!(error = %err, "could not fetch crm field list, skipping mapping check");
            return Vec::new();
        }
    };
    let known: HashSet<&str> = fields.iter().map(|f| f.alias.as_str()).collect();

    let mut missing = Vec::new();
    for product in pipeline.catalog().products() {
        for crm_field in product.fields.keys() {
            if !known.contains(crm_field.as_str()) {
                error!(
                    product = %product.slug,
                    field = %crm_field,
                    "mapped field does not exist in the crm"
                );
                missing.push(format!("{}.{crm_field}", product.slug));
            }
        }
    }
    missing
}

/// One drain pass, logged.
pub async fn tick<Q: Queue>(drainer: &Drainer<Q>) -> Result<DrainReport, QueueError> {
    let report = drainer.drain_once().await?;
    match &report {
        DrainReport::Busy => debug!("drain already running"),
        DrainReport::Empty => debug!("queue empty"),
        DrainReport::Processed { key, .. } => info!(%key, "processed queue item"),
        DrainReport::Retained { key, attempts, .. } => {
            warn!(%key, attempts, "queue item failed, will retry")
        }
        DrainReport::DeadLettered { key, reason } => {
            error!(%key, %reason, "queue item dead-lettered")
        }
    }
    Ok(report)
}

/// Runs one pass per `interval` until `shutdown` resolves. Queue store
/// errors back off exponentially instead of waiting the full interval.
pub async fn run<Q, F>(drainer: &Drainer<Q>, interval: Duration, shutdown: F)
where
    Q: Queue,
    F: Future<Output = ()>,
{
    let mut backoff = ExponentialBackoff {
        max_elapsed_time: None,
        max_interval: MAX_RETRY_DELAY,
        ..Default::default()
    };
    tokio::pin!(shutdown);

    loop {
        let delay = match tick(drainer).await {
            Ok(_) => {
                backoff.reset();
                interval
            }
            Err(err) => {
                let delay = backoff.next_backoff().unwrap_or(MAX_RETRY_DELAY);
                error!(error = %err, ?delay, "queue store failure");
                delay
            }
        };

        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
