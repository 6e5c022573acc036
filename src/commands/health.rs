use crate::state::AppState;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub chart_streams: usize,
}

pub fn build_health_response(started_at: Instant, chart_streams: usize) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime_ms: started_at.elapsed().as_millis(),
        chart_streams,
    }
}

pub async fn health(state: &AppState) -> HealthResponse {
    let running = state.chart_streams.lock().await.len();
    build_health_response(state.started_at, running)
}
