use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

mod error;
mod middleware;
mod routes;
mod state;

use freem_core::config::Settings;
use freem_core::drain::Drainer;
use freem_core::pipeline::Pipeline;
use freem_crm::MauticClient;
use freem_queue::FileQueue;

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let settings = Settings::from_env()?;

    let crm = MauticClient::new(&settings.mautic)?;
    let pipeline = Pipeline::from_settings(&settings, Arc::new(crm))?;
    let queue = FileQueue::open(&settings.queue_dir)?;

    let state = AppState {
        drainer: Arc::new(Drainer::new(queue, Arc::new(pipeline), settings.max_attempts)),
        mode: settings.mode,
        webhook_secret: settings.webhook_secret.as_deref().map(Arc::from),
    };

    let app = routes::app(state);

    let addr: SocketAddr = settings.api_bind.parse()?;

    info!(
        %addr,
        mode = ?settings.mode,
        queue_dir = %settings.queue_dir.display(),
        signed = settings.webhook_secret.is_some(),
        "starting api"
    );

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
