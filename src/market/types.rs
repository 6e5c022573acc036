use crate::error::AppError;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

pub const DEFAULT_SYMBOL: &str = "MLP_USDT";
pub const DEFAULT_SCALE: &str = "1m";
pub const DEFAULT_WS_URL: &str = "wss://api.gateio.ws/ws/v4/";
pub const DEFAULT_REST_URL: &str = "https://api.gateio.ws/api/v4";
pub const DEFAULT_HISTORY_LIMIT: u16 = 1_000;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 500;
pub const MIN_HISTORY_LIMIT: u16 = 1;
pub const MAX_HISTORY_LIMIT: u16 = 1_000;
pub const MIN_RECONNECT_DELAY_MS: u64 = 1;
pub const MAX_RECONNECT_DELAY_MS: u64 = 60_000;

pub const SUBSCRIBE_EVENT: &str = "subscribe";
pub const UPDATE_EVENT: &str = "update";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ChartKind {
    AveragePrice,
    Kline,
}

impl ChartKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AveragePrice => "averagePrice",
            Self::Kline => "kline",
        }
    }

    pub fn channel(self) -> &'static str {
        match self {
            Self::AveragePrice => "spot.trades",
            Self::Kline => "spot.candlesticks",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimeScale {
    token: String,
    width_secs: i64,
}

impl TimeScale {
    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(AppError::InvalidArgument(
                "scale must not be empty".to_string(),
            ));
        }
        if trimmed.ends_with('M') {
            return Err(AppError::InvalidArgument(format!(
                "scale '{trimmed}' is not a fixed width"
            )));
        }

        let lowered = trimmed.to_ascii_lowercase();
        let split_at = lowered
            .find(|ch: char| !ch.is_ascii_digit())
            .unwrap_or(lowered.len());
        let (digits, unit) = lowered.split_at(split_at);

        let unit_secs = match unit {
            "" | "m" => 60,
            "s" => 1,
            "h" => 3_600,
            "d" => 86_400,
            "w" => 604_800,
            _ => {
                return Err(AppError::InvalidArgument(format!(
                    "scale '{trimmed}' has an unknown unit"
                )))
            }
        };

        let count = digits.parse::<i64>().map_err(|_| {
            AppError::InvalidArgument(format!("scale '{trimmed}' must start with a number"))
        })?;
        if count <= 0 {
            return Err(AppError::InvalidArgument(format!(
                "scale '{trimmed}' must be positive"
            )));
        }

        let unit = if unit.is_empty() { "m" } else { unit };
        Ok(Self {
            token: format!("{count}{unit}"),
            width_secs: count.saturating_mul(unit_secs),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }

    pub fn width_secs(&self) -> i64 {
        self.width_secs
    }
}

impl fmt::Display for TimeScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

impl Serialize for TimeScale {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.token)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn parse_str(value: &str) -> Option<Self> {
        match value {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradePoint {
    pub id: Option<u64>,
    pub timestamp_ms: i64,
    pub side: Side,
    pub price: f64,
}

impl TradePoint {
    pub fn time_secs(&self) -> i64 {
        self.timestamp_ms.div_euclid(1_000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandlePoint {
    pub timestamp_sec: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WireField {
    Number(f64),
    Text(String),
    Flag(bool),
}

impl WireField {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Text(text) => text.trim().parse::<f64>().ok(),
            Self::Flag(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(value) if value.is_finite() && *value >= 0.0 && value.fract() == 0.0 => {
                Some(*value as u64)
            }
            Self::Text(text) => text.trim().parse::<u64>().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradeWire {
    #[serde(default)]
    pub id: Option<WireField>,
    pub create_time_ms: WireField,
    pub side: String,
    pub price: WireField,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CandleTickWire {
    pub t: WireField,
    pub o: WireField,
    pub h: WireField,
    pub l: WireField,
    pub c: WireField,
    #[serde(default)]
    pub v: Option<WireField>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CandleRowWire(pub Vec<WireField>);

pub const CANDLE_ROW_MIN_COLUMNS: usize = 6;

#[derive(Debug, Deserialize)]
pub struct PushEnvelope {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub result: Option<simd_json::OwnedValue>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SubscribeFrame {
    pub time: i64,
    pub channel: String,
    pub event: String,
    pub payload: Vec<String>,
}

impl SubscribeFrame {
    pub fn new(time: i64, channel: &str, payload: Vec<String>) -> Self {
        Self {
            time,
            channel: channel.to_string(),
            event: SUBSCRIBE_EVENT.to_string(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Live,
    Reconnecting,
    Stopped,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChartStreamKey {
    pub kind: ChartKind,
    pub symbol: String,
    pub scale: TimeScale,
}

impl fmt::Display for ChartStreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.kind.as_str(), self.symbol, self.scale)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartStreamStatus {
    pub state: ConnectionState,
    pub kind: ChartKind,
    pub symbol: String,
    pub scale: TimeScale,
    pub epoch: u64,
    pub last_event_time: Option<i64>,
    /// Most recent error reason; kept after the state moves on.
    pub last_error: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StartChartStreamArgs {
    pub kind: Option<ChartKind>,
    pub symbol: Option<String>,
    pub scale: Option<String>,
    pub ws_url: Option<String>,
    pub rest_url: Option<String>,
    pub history_limit: Option<u16>,
    pub reconnect_delay_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ChartStreamConfig {
    pub kind: ChartKind,
    pub symbol: String,
    pub scale: TimeScale,
    pub ws_url: String,
    pub rest_url: String,
    pub history_limit: u16,
    pub reconnect_delay_ms: u64,
}

impl ChartStreamConfig {
    pub fn key(&self) -> ChartStreamKey {
        ChartStreamKey {
            kind: self.kind,
            symbol: self.symbol.clone(),
            scale: self.scale.clone(),
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>, AppError> {
    match env_value(name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| AppError::InvalidArgument(format!("{name} has invalid value '{raw}'"))),
        None => Ok(None),
    }
}

impl StartChartStreamArgs {
    pub fn from_env() -> Result<Self, AppError> {
        Ok(Self {
            kind: None,
            symbol: env_value("DASHBOARD_SYMBOL"),
            scale: env_value("DASHBOARD_SCALE"),
            ws_url: env_value("DASHBOARD_WS_URL"),
            rest_url: env_value("DASHBOARD_REST_URL"),
            history_limit: env_parsed("DASHBOARD_HISTORY_LIMIT")?,
            reconnect_delay_ms: env_parsed("DASHBOARD_RECONNECT_DELAY_MS")?,
        })
    }

    pub fn with_kind(mut self, kind: ChartKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn normalize(self) -> Result<ChartStreamConfig, AppError> {
        let kind = self.kind.unwrap_or(ChartKind::Kline);

        let symbol = self
            .symbol
            .unwrap_or_else(|| DEFAULT_SYMBOL.to_string())
            .trim()
            .to_ascii_uppercase();
        if symbol.is_empty()
            || !symbol
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return Err(AppError::InvalidArgument(
                "symbol must be non-empty ASCII alphanumerics or '_'".to_string(),
            ));
        }

        let scale = TimeScale::parse_str(self.scale.as_deref().unwrap_or(DEFAULT_SCALE))?;

        let ws_url = self.ws_url.unwrap_or_else(|| DEFAULT_WS_URL.to_string());
        if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
            return Err(AppError::InvalidArgument(
                "wsUrl must use ws:// or wss://".to_string(),
            ));
        }

        let rest_url = self
            .rest_url
            .unwrap_or_else(|| DEFAULT_REST_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        if !(rest_url.starts_with("http://") || rest_url.starts_with("https://")) {
            return Err(AppError::InvalidArgument(
                "restUrl must use http:// or https://".to_string(),
            ));
        }

        let history_limit = self.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        if !(MIN_HISTORY_LIMIT..=MAX_HISTORY_LIMIT).contains(&history_limit) {
            return Err(AppError::InvalidArgument(format!(
                "historyLimit must be between {MIN_HISTORY_LIMIT} and {MAX_HISTORY_LIMIT}"
            )));
        }

        let reconnect_delay_ms = self
            .reconnect_delay_ms
            .unwrap_or(DEFAULT_RECONNECT_DELAY_MS);
        if !(MIN_RECONNECT_DELAY_MS..=MAX_RECONNECT_DELAY_MS).contains(&reconnect_delay_ms) {
            return Err(AppError::InvalidArgument(format!(
                "reconnectDelayMs must be between {MIN_RECONNECT_DELAY_MS} and {MAX_RECONNECT_DELAY_MS}"
            )));
        }

        Ok(ChartStreamConfig {
            kind,
            symbol,
            scale,
            ws_url,
            rest_url,
            history_limit,
            reconnect_delay_ms,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartStreamSession {
    pub running: bool,
    pub kind: ChartKind,
    pub symbol: String,
    pub scale: TimeScale,
    pub bucket_width_secs: i64,
    pub history_limit: u16,
    pub reconnect_delay_ms: u64,
}

impl ChartStreamSession {
    pub fn from_config(config: &ChartStreamConfig) -> Self {
        Self {
            running: true,
            kind: config.kind,
            symbol: config.symbol.clone(),
            scale: config.scale.clone(),
            bucket_width_secs: config.scale.width_secs(),
            history_limit: config.history_limit,
            reconnect_delay_ms: config.reconnect_delay_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartStreamStopResult {
    pub stopped: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scale_tokens_into_bucket_widths() {
        assert_eq!(TimeScale::parse_str("1m").unwrap().width_secs(), 60);
        assert_eq!(TimeScale::parse_str("5m").unwrap().width_secs(), 300);
        assert_eq!(TimeScale::parse_str("15m").unwrap().width_secs(), 900);
        assert_eq!(TimeScale::parse_str("1h").unwrap().width_secs(), 3_600);
        assert_eq!(TimeScale::parse_str("4H").unwrap().width_secs(), 14_400);
        assert_eq!(TimeScale::parse_str("1d").unwrap().width_secs(), 86_400);
        assert_eq!(TimeScale::parse_str("10s").unwrap().width_secs(), 10);
    }

    #[test]
    fn bare_integer_scale_means_minutes() {
        let scale = TimeScale::parse_str("5").unwrap();
        assert_eq!(scale.width_secs(), 300);
        assert_eq!(scale.as_str(), "5m");
    }

    #[test]
    fn rejects_month_and_malformed_scales() {
        assert!(TimeScale::parse_str("1M").is_err());
        assert!(TimeScale::parse_str("").is_err());
        assert!(TimeScale::parse_str("m").is_err());
        assert!(TimeScale::parse_str("0m").is_err());
        assert!(TimeScale::parse_str("5x").is_err());
        assert!(TimeScale::parse_str("5mm").is_err());
    }

    #[test]
    fn wire_field_accepts_strings_and_numbers() {
        assert_eq!(WireField::Text("1.5".to_string()).as_f64(), Some(1.5));
        assert_eq!(WireField::Number(2.0).as_f64(), Some(2.0));
        assert_eq!(WireField::Text("broken".to_string()).as_f64(), None);
        assert_eq!(WireField::Flag(true).as_f64(), None);
    }

    #[test]
    fn wire_field_reads_trade_ids() {
        assert_eq!(WireField::Text("5665192737".to_string()).as_u64(), Some(5_665_192_737));
        assert_eq!(WireField::Number(42.0).as_u64(), Some(42));
        assert_eq!(WireField::Number(-1.0).as_u64(), None);
        assert_eq!(WireField::Number(1.5).as_u64(), None);
        assert_eq!(WireField::Text("x".to_string()).as_u64(), None);
    }

    #[test]
    fn decodes_candle_row_with_trailing_columns() {
        let mut payload =
            br#"[["1700000000","12.5","1.2","1.3","1.1","1.15","10.4","true"]]"#.to_vec();
        let rows: Vec<CandleRowWire> =
            simd_json::serde::from_slice(&mut payload).expect("candle rows should decode");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0.len(), 8);
        assert_eq!(rows[0].0[2].as_f64(), Some(1.2));
    }

    #[test]
    fn subscribe_frame_serializes_expected_shape() {
        let frame = SubscribeFrame::new(
            1_700_000_000,
            ChartKind::Kline.channel(),
            vec!["5m".to_string(), "MLP_USDT".to_string()],
        );
        let encoded = simd_json::serde::to_string(&frame).expect("frame should encode");
        assert!(encoded.contains(r#""time":1700000000"#));
        assert!(encoded.contains(r#""channel":"spot.candlesticks""#));
        assert!(encoded.contains(r#""event":"subscribe""#));
        assert!(encoded.contains(r#""payload":["5m","MLP_USDT"]"#));
    }

    #[test]
    fn normalizes_start_args_defaults() {
        let config = StartChartStreamArgs::default()
            .normalize()
            .expect("defaults should be valid");

        assert_eq!(config.kind, ChartKind::Kline);
        assert_eq!(config.symbol, DEFAULT_SYMBOL);
        assert_eq!(config.scale.as_str(), DEFAULT_SCALE);
        assert_eq!(config.ws_url, DEFAULT_WS_URL);
        assert_eq!(config.rest_url, DEFAULT_REST_URL);
        assert_eq!(config.history_limit, DEFAULT_HISTORY_LIMIT);
        assert_eq!(config.reconnect_delay_ms, DEFAULT_RECONNECT_DELAY_MS);
    }

    #[test]
    fn validates_history_limit_range() {
        let result = StartChartStreamArgs {
            history_limit: Some(5_000),
            ..Default::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_symbol_and_urls() {
        let bad_symbol = StartChartStreamArgs {
            symbol: Some("MLP-USDT".to_string()),
            ..Default::default()
        }
        .normalize();
        assert!(bad_symbol.is_err());

        let bad_ws = StartChartStreamArgs {
            ws_url: Some("https://api.gateio.ws".to_string()),
            ..Default::default()
        }
        .normalize();
        assert!(bad_ws.is_err());

        let trimmed = StartChartStreamArgs {
            symbol: Some(" mlp_usdt ".to_string()),
            rest_url: Some("http://127.0.0.1:8080/api/v4/".to_string()),
            ..Default::default()
        }
        .normalize()
        .expect("args should normalize");
        assert_eq!(trimmed.symbol, "MLP_USDT");
        assert_eq!(trimmed.rest_url, "http://127.0.0.1:8080/api/v4");
    }
}
