use crate::error::AppError;
use crate::market::types::{
    CandleRowWire, ChartKind, ChartStreamConfig, TimeScale, TradeWire, CANDLE_ROW_MIN_COLUMNS,
};
use reqwest::Client;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

pub type GateWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn trades_endpoint(rest_url: &str, symbol: &str, limit: u16) -> String {
    format!("{rest_url}/spot/trades?currency_pair={symbol}&limit={limit}")
}

fn candlesticks_endpoint(rest_url: &str, symbol: &str, scale: &TimeScale, limit: u16) -> String {
    format!(
        "{rest_url}/spot/candlesticks?currency_pair={symbol}&interval={}&limit={limit}",
        scale.as_str()
    )
}

pub fn subscription_payload(kind: ChartKind, symbol: &str, scale: &TimeScale) -> Vec<String> {
    match kind {
        ChartKind::AveragePrice => vec![symbol.to_string()],
        ChartKind::Kline => vec![scale.as_str().to_string(), symbol.to_string()],
    }
}

pub async fn connect_push_stream(ws_url: &str) -> Result<GateWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(ws_url, Some(ws_config), true).await?;
    Ok(stream)
}

pub async fn fetch_trade_history(
    client: &Client,
    config: &ChartStreamConfig,
) -> Result<Vec<TradeWire>, AppError> {
    let endpoint = trades_endpoint(&config.rest_url, &config.symbol, config.history_limit);
    let response = client.get(endpoint).send().await?.error_for_status()?;
    let payload = response.json::<Vec<TradeWire>>().await?;
    Ok(payload)
}

pub async fn fetch_candle_history(
    client: &Client,
    config: &ChartStreamConfig,
) -> Result<Vec<CandleRowWire>, AppError> {
    let endpoint = candlesticks_endpoint(
        &config.rest_url,
        &config.symbol,
        &config.scale,
        config.history_limit,
    );
    let response = client.get(endpoint).send().await?.error_for_status()?;
    let payload = response.json::<Vec<CandleRowWire>>().await?;
    validate_candle_rows(&payload)?;
    Ok(payload)
}

/// A short row means the whole response is untrustworthy.
fn validate_candle_rows(rows: &[CandleRowWire]) -> Result<(), AppError> {
    match rows
        .iter()
        .position(|row| row.0.len() < CANDLE_ROW_MIN_COLUMNS)
    {
        Some(index) => Err(AppError::MalformedHistory {
            index,
            reason: format!(
                "expected at least {CANDLE_ROW_MIN_COLUMNS} columns, found {}",
                rows[index].0.len()
            ),
        }),
        None => Ok(()),
    }
}
