use crate::market::pipeline::StatusStore;
use crate::market::types::ChartStreamKey;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct ChartStreamHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
}

pub struct AppState {
    pub started_at: Instant,
    pub chart_streams: Mutex<HashMap<ChartStreamKey, ChartStreamHandle>>,
    pub chart_status: StatusStore,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            chart_streams: Mutex::new(HashMap::new()),
            chart_status: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
