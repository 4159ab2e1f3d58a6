use std::sync::Arc;

use freem_core::config::ProcessingMode;
use freem_core::drain::Drainer;
use freem_queue::FileQueue;

#[derive(Clone)]
pub struct AppState {
    pub drainer: Arc<Drainer<FileQueue>>,
    pub mode: ProcessingMode,
    /// When set, every webhook must carry a valid `x-signature`.
    pub webhook_secret: Option<Arc<str>>,
}

#[derive(Debug, Clone)]
pub struct RequestId(pub String);
