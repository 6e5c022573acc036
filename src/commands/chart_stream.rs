use crate::error::AppError;
use crate::market::aggregate::{AveragePoint, Averaging, OhlcvMerge, OhlcvPoint};
use crate::market::pipeline::run_chart_stream;
use crate::market::series::{ChannelRenderer, ChartFrame};
use crate::market::types::{
    ChartKind, ChartStreamKey, ChartStreamSession, ChartStreamStatus, ChartStreamStopResult,
    ConnectionState, StartChartStreamArgs,
};
use crate::state::{AppState, ChartStreamHandle};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Starts (or restarts) the session for the args' kind/pair/scale. Rendered
/// frames go to `frames`.
pub async fn start_chart_stream(
    state: &AppState,
    args: Option<StartChartStreamArgs>,
    frames: mpsc::UnboundedSender<ChartFrame>,
) -> Result<ChartStreamSession, AppError> {
    let config = args.unwrap_or_default().normalize()?;
    let key = config.key();

    let existing_handle = {
        let mut streams = state.chart_streams.lock().await;
        streams.remove(&key)
    };
    if let Some(handle) = existing_handle {
        handle.cancellation_token.cancel();
        handle.join_handle.await?;
    }

    let cancellation_token = CancellationToken::new();
    let task_token = cancellation_token.clone();
    let status_store = Arc::clone(&state.chart_status);
    let runtime_config = config.clone();

    let join_handle = match config.kind {
        ChartKind::AveragePrice => {
            let renderer = Box::new(ChannelRenderer::<AveragePoint>::new(
                &config.symbol,
                config.scale.as_str(),
                frames,
            ));
            tokio::spawn(run_chart_stream::<Averaging>(
                runtime_config,
                renderer,
                status_store,
                task_token,
            ))
        }
        ChartKind::Kline => {
            let renderer = Box::new(ChannelRenderer::<OhlcvPoint>::new(
                &config.symbol,
                config.scale.as_str(),
                frames,
            ));
            tokio::spawn(run_chart_stream::<OhlcvMerge>(
                runtime_config,
                renderer,
                status_store,
                task_token,
            ))
        }
    };

    let replaced = {
        let mut streams = state.chart_streams.lock().await;
        streams.insert(
            key.clone(),
            ChartStreamHandle {
                cancellation_token,
                join_handle,
            },
        )
    };
    // A concurrent start for the same key lost the race.
    if let Some(handle) = replaced {
        handle.cancellation_token.cancel();
    }

    info!(stream = %key, "chart stream started");
    Ok(ChartStreamSession::from_config(&config))
}

pub async fn stop_chart_stream(
    state: &AppState,
    key: &ChartStreamKey,
) -> Result<ChartStreamStopResult, AppError> {
    let existing_handle = {
        let mut streams = state.chart_streams.lock().await;
        streams.remove(key)
    };

    let stopped = if let Some(handle) = existing_handle {
        handle.cancellation_token.cancel();
        handle.join_handle.await?;
        true
    } else {
        false
    };

    {
        let mut writable = state.chart_status.write().await;
        if let Some(status) = writable.get_mut(key) {
            status.state = ConnectionState::Stopped;
            status.reason = Some("stream stopped by command".to_string());
        }
    }

    if stopped {
        info!(stream = %key, "chart stream stopped");
    }
    Ok(ChartStreamStopResult { stopped })
}

/// Stops every running session and returns how many there were.
pub async fn stop_all_chart_streams(state: &AppState) -> Result<usize, AppError> {
    let keys: Vec<ChartStreamKey> = {
        let streams = state.chart_streams.lock().await;
        streams.keys().cloned().collect()
    };

    let mut stopped = 0;
    for key in &keys {
        if stop_chart_stream(state, key).await?.stopped {
            stopped += 1;
        }
    }
    Ok(stopped)
}

pub async fn chart_stream_status(state: &AppState) -> Vec<ChartStreamStatus> {
    let readable = state.chart_status.read().await;
    let mut snapshots: Vec<ChartStreamStatus> = readable.values().cloned().collect();
    snapshots.sort_by(|lhs, rhs| {
        (lhs.kind.as_str(), &lhs.symbol, lhs.scale.as_str())
            .cmp(&(rhs.kind.as_str(), &rhs.symbol, rhs.scale.as_str()))
    });
    snapshots
}
