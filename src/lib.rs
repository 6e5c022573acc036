pub mod commands;
pub mod error;
pub mod market;
pub mod state;

use commands::chart_stream::{start_chart_stream, stop_all_chart_streams};
use error::AppError;
use market::series::{ChartFrame, SeriesPayload};
use market::types::{ChartKind, StartChartStreamArgs};
use state::AppState;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Runs both chart kinds for the configured pair and scale, logging every
/// rendered frame until Ctrl-C.
pub async fn run(args: StartChartStreamArgs) -> Result<(), AppError> {
    let state = AppState::new();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<ChartFrame>();

    for kind in [ChartKind::AveragePrice, ChartKind::Kline] {
        let session =
            start_chart_stream(&state, Some(args.clone().with_kind(kind)), frames_tx.clone())
                .await?;
        info!(
            kind = session.kind.as_str(),
            symbol = %session.symbol,
            scale = %session.scale,
            bucket_width_secs = session.bucket_width_secs,
            "chart session running"
        );
    }
    drop(frames_tx);

    // Ends once every session has dropped its renderer.
    let frame_logger = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            log_frame(&frame);
        }
    });

    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "ctrl-c handler unavailable, shutting down");
    }

    let stopped = stop_all_chart_streams(&state).await?;
    frame_logger.await?;
    info!(stopped, "dashboard shut down");
    Ok(())
}

fn log_frame(frame: &ChartFrame) {
    let points = match &frame.payload {
        SeriesPayload::AveragePrice { buy, sell } => buy.len() + sell.len(),
        SeriesPayload::Kline { candles, .. } => candles.len(),
    };
    info!(
        event = frame.event,
        symbol = %frame.symbol,
        scale = %frame.scale,
        mode = ?frame.mode,
        points,
        "chart frame"
    );

    match simd_json::serde::to_string(frame) {
        Ok(json) => debug!(frame = %json, "chart frame payload"),
        Err(error) => warn!(error = %error, "chart frame not serializable"),
    }
}
