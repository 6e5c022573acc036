use crate::error::AppError;
use crate::market::aggregate::{
    Averaging, Bucket, FoldOutcome, FoldPolicy, OhlcvMerge, TimeBucketAggregator,
};
use crate::market::connection::{
    ConnectionEpoch, InboundMessage, ResilientConnection, StreamSignal, StreamSubscription,
};
use crate::market::gateio::{fetch_candle_history, fetch_trade_history, subscription_payload};
use crate::market::normalize::{normalize_candle_row, normalize_candle_tick, normalize_trade};
use crate::market::series::{plan_emission, render, MergeOutcome, Series, SeriesRenderer};
use crate::market::types::{
    CandleRowWire, CandleTickWire, ChartKind, ChartStreamConfig, ChartStreamKey,
    ChartStreamStatus, ConnectionState, PushEnvelope, TradeWire, UPDATE_EVENT,
};
use parking_lot::Mutex;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

const STATUS_ERROR_THROTTLE_MS: u64 = 500;
const SIGNAL_CHANNEL_CAPACITY: usize = 1_024;
const MAX_DRAIN_BATCH: usize = 512;
const UNDECODABLE_FRAME_REASON: &str = "undecodable push frame";

pub type StatusStore = Arc<RwLock<HashMap<ChartStreamKey, ChartStreamStatus>>>;

pub trait ChartStream: FoldPolicy + Send + 'static {
    type History: Send + 'static;
    type Push: DeserializeOwned;

    const KIND: ChartKind;

    fn fetch_history(
        client: &Client,
        config: &ChartStreamConfig,
    ) -> impl Future<Output = Result<Vec<Self::History>, AppError>> + Send;

    fn normalize_history(row: &Self::History) -> Option<Self::Event>;
    fn normalize_push(push: &Self::Push) -> Option<Self::Event>;
}

impl ChartStream for Averaging {
    type History = TradeWire;
    type Push = TradeWire;

    const KIND: ChartKind = ChartKind::AveragePrice;

    fn fetch_history(
        client: &Client,
        config: &ChartStreamConfig,
    ) -> impl Future<Output = Result<Vec<TradeWire>, AppError>> + Send {
        fetch_trade_history(client, config)
    }

    fn normalize_history(row: &TradeWire) -> Option<Self::Event> {
        normalize_trade(row)
    }

    fn normalize_push(push: &TradeWire) -> Option<Self::Event> {
        normalize_trade(push)
    }
}

impl ChartStream for OhlcvMerge {
    type History = CandleRowWire;
    type Push = CandleTickWire;

    const KIND: ChartKind = ChartKind::Kline;

    fn fetch_history(
        client: &Client,
        config: &ChartStreamConfig,
    ) -> impl Future<Output = Result<Vec<CandleRowWire>, AppError>> + Send {
        fetch_candle_history(client, config)
    }

    fn normalize_history(row: &CandleRowWire) -> Option<Self::Event> {
        normalize_candle_row(row)
    }

    fn normalize_push(push: &CandleTickWire) -> Option<Self::Event> {
        normalize_candle_tick(push)
    }
}

#[derive(Debug, Default)]
struct StatusTracker {
    epoch: u64,
    last_event_time: Option<i64>,
    last_error: Option<String>,
    last_state: Option<ConnectionState>,
    last_reason: Option<String>,
    last_emit: Option<Instant>,
}

pub struct StatusPublisher {
    key: ChartStreamKey,
    store: StatusStore,
    tracker: Mutex<StatusTracker>,
}

impl StatusPublisher {
    pub fn new(key: ChartStreamKey, store: StatusStore) -> Self {
        Self {
            key,
            store,
            tracker: Mutex::new(StatusTracker::default()),
        }
    }

    fn set_epoch(&self, epoch: u64) {
        self.tracker.lock().epoch = epoch;
    }

    fn note_event_time(&self, event_time_secs: i64) {
        self.tracker.lock().last_event_time = Some(event_time_secs);
    }

    fn allow(&self, state: ConnectionState, reason: &Option<String>) -> bool {
        let mut tracker = self.tracker.lock();
        let now = Instant::now();
        let throttled = matches!(
            state,
            ConnectionState::Error | ConnectionState::Reconnecting
        );

        if throttled
            && tracker.last_state == Some(state)
            && tracker.last_reason == *reason
            && tracker
                .last_emit
                .map(|instant| {
                    now.duration_since(instant) < Duration::from_millis(STATUS_ERROR_THROTTLE_MS)
                })
                .unwrap_or(false)
        {
            return false;
        }

        tracker.last_state = Some(state);
        tracker.last_reason = reason.clone();
        tracker.last_emit = Some(now);
        true
    }

    pub async fn publish(&self, state: ConnectionState, reason: Option<String>) {
        let snapshot = {
            let mut tracker = self.tracker.lock();
            if state == ConnectionState::Error {
                tracker.last_error = reason.clone();
            }
            ChartStreamStatus {
                state,
                kind: self.key.kind,
                symbol: self.key.symbol.clone(),
                scale: self.key.scale.clone(),
                epoch: tracker.epoch,
                last_event_time: tracker.last_event_time,
                last_error: tracker.last_error.clone(),
                reason,
            }
        };

        match state {
            ConnectionState::Error => {
                warn!(stream = %self.key, epoch = snapshot.epoch, reason = ?snapshot.reason, "chart stream error")
            }
            _ => debug!(stream = %self.key, state = ?state, epoch = snapshot.epoch, reason = ?snapshot.reason, "chart stream status"),
        }

        let mut writable = self.store.write().await;
        writable.insert(self.key.clone(), snapshot);
    }

    pub async fn publish_throttled(&self, state: ConnectionState, reason: Option<String>) {
        if !self.allow(state, &reason) {
            return;
        }
        self.publish(state, reason).await;
    }

    pub async fn current_state(&self) -> ConnectionState {
        let readable = self.store.read().await;
        readable
            .get(&self.key)
            .map(|status| status.state)
            .unwrap_or(ConnectionState::Connecting)
    }
}

pub struct ChartSession<S: ChartStream> {
    aggregator: TimeBucketAggregator<S>,
    series: Series<S::Aggregate>,
    candidate: Vec<Bucket<S::Aggregate>>,
    renderer: Box<dyn SeriesRenderer<S::Aggregate>>,
    epoch: Arc<ConnectionEpoch>,
    publisher: Arc<StatusPublisher>,
    stale_dropped: u64,
    invalid_dropped: u64,
}

impl<S: ChartStream> ChartSession<S> {
    pub fn new(
        config: &ChartStreamConfig,
        renderer: Box<dyn SeriesRenderer<S::Aggregate>>,
        epoch: Arc<ConnectionEpoch>,
        publisher: Arc<StatusPublisher>,
    ) -> Self {
        Self {
            aggregator: TimeBucketAggregator::new(config.scale.width_secs()),
            series: Series::new(),
            candidate: Vec::new(),
            renderer,
            epoch,
            publisher,
            stale_dropped: 0,
            invalid_dropped: 0,
        }
    }

    pub fn series(&self) -> &Series<S::Aggregate> {
        &self.series
    }

    async fn apply_history(&mut self, rows: Vec<S::History>) -> Result<(), AppError> {
        self.flush()?;

        let total = rows.len();
        let events: Vec<S::Event> = rows.iter().filter_map(S::normalize_history).collect();
        let dropped = total - events.len();
        if let Some(last) = events.iter().map(S::event_time_secs).max() {
            self.publisher.note_event_time(last);
        }

        let buckets = self.aggregator.bootstrap(events);
        self.series.replace_all(buckets);
        self.renderer.replace_all(self.series.buckets())?;

        info!(
            kind = S::KIND.as_str(),
            rows = total,
            dropped,
            buckets = self.series.len(),
            "historical snapshot applied"
        );
        let state = self.publisher.current_state().await;
        self.publisher
            .publish(state, Some("historical rows loaded".to_string()))
            .await;
        Ok(())
    }

    async fn handle_signal(&mut self, signal: StreamSignal) -> Result<(), AppError> {
        match signal {
            StreamSignal::Message(message) => self.handle_message(message).await,
            StreamSignal::Subscribed { epoch } => {
                if self.epoch.is_current(epoch) {
                    self.publisher.set_epoch(epoch);
                    self.publisher
                        .publish(ConnectionState::Live, Some("subscribed".to_string()))
                        .await;
                }
                Ok(())
            }
            StreamSignal::Disconnected { epoch, reason } => {
                if self.epoch.is_current(epoch) {
                    self.flush()?;
                    self.publisher
                        .publish_throttled(ConnectionState::Reconnecting, Some(reason))
                        .await;
                }
                Ok(())
            }
        }
    }

    async fn handle_message(&mut self, message: InboundMessage) -> Result<(), AppError> {
        if !self.epoch.is_current(message.epoch) {
            self.stale_dropped = self.stale_dropped.saturating_add(1);
            debug!(epoch = message.epoch, "message from replaced connection dropped");
            return Ok(());
        }

        let push = match decode_push::<S::Push>(S::KIND, message.payload) {
            Ok(Some(push)) => push,
            Ok(None) => return Ok(()),
            Err(error) => {
                self.invalid_dropped = self.invalid_dropped.saturating_add(1);
                debug!(error = %error, "undecodable push frame dropped");
                self.publisher
                    .publish_throttled(
                        ConnectionState::Error,
                        Some(UNDECODABLE_FRAME_REASON.to_string()),
                    )
                    .await;
                return Ok(());
            }
        };

        let Some(event) = S::normalize_push(&push) else {
            self.invalid_dropped = self.invalid_dropped.saturating_add(1);
            debug!(kind = S::KIND.as_str(), "push result failed normalization");
            return Ok(());
        };

        self.publisher.note_event_time(S::event_time_secs(&event));
        self.apply_live(&event)
    }

    fn apply_live(&mut self, event: &S::Event) -> Result<(), AppError> {
        let bucket = match self.aggregator.apply(event) {
            FoldOutcome::Late { key, open_key } => {
                debug!(key, open_key, "late event dropped");
                return Ok(());
            }
            FoldOutcome::Duplicate { key, id } => {
                debug!(key, id, "re-delivered event skipped");
                return Ok(());
            }
            FoldOutcome::Folded(bucket) => bucket,
            FoldOutcome::Opened { opened, .. } => opened,
        };

        // One key per candidate batch: the final state of a closed bucket is
        // always rendered before its successor opens.
        if self
            .candidate
            .last()
            .is_some_and(|last| last.start != bucket.start)
        {
            self.flush()?;
        }

        match self.series.merge(bucket.clone()) {
            MergeOutcome::Rejected { key, tail } => {
                debug!(key, tail, "bucket behind series tail rejected");
                Ok(())
            }
            MergeOutcome::ReplacedTail | MergeOutcome::Appended => {
                self.candidate.push(bucket);
                Ok(())
            }
        }
    }

    fn flush(&mut self) -> Result<(), AppError> {
        let candidate = std::mem::take(&mut self.candidate);
        if let Some(emission) = plan_emission(&candidate, &self.series) {
            render(self.renderer.as_mut(), &emission)?;
        }
        Ok(())
    }
}

fn decode_push<T: DeserializeOwned>(kind: ChartKind, payload: Vec<u8>) -> Result<Option<T>, AppError> {
    let mut payload = payload;
    let envelope: PushEnvelope = simd_json::serde::from_slice(&mut payload)?;
    if envelope.event != UPDATE_EVENT || envelope.channel != kind.channel() {
        return Ok(None);
    }
    let Some(result) = envelope.result else {
        return Ok(None);
    };
    let push = simd_json::serde::from_owned_value::<T>(result)?;
    Ok(Some(push))
}

/// Single consumer of history and connection signals.
pub async fn drive_session<S: ChartStream>(
    session: &mut ChartSession<S>,
    mut signals: mpsc::Receiver<StreamSignal>,
    mut history: oneshot::Receiver<Vec<S::History>>,
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    let mut history_pending = true;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            rows = &mut history, if history_pending => {
                history_pending = false;
                match rows {
                    Ok(rows) => session.apply_history(rows).await?,
                    Err(_) => debug!("no historical snapshot for this session"),
                }
            }
            signal = signals.recv() => {
                let Some(signal) = signal else {
                    session.flush()?;
                    return Ok(());
                };
                session.handle_signal(signal).await?;

                let mut drained = 1;
                while drained < MAX_DRAIN_BATCH {
                    match signals.try_recv() {
                        Ok(next) => {
                            session.handle_signal(next).await?;
                            drained += 1;
                        }
                        Err(_) => break,
                    }
                }
                session.flush()?;
            }
        }
    }
}

pub async fn run_chart_stream<S: ChartStream>(
    config: ChartStreamConfig,
    renderer: Box<dyn SeriesRenderer<S::Aggregate>>,
    status_store: StatusStore,
    cancel_token: CancellationToken,
) {
    let span = info_span!(
        "chart_stream",
        kind = S::KIND.as_str(),
        symbol = %config.symbol,
        scale = %config.scale
    );
    run_session::<S>(config, renderer, status_store, cancel_token)
        .instrument(span)
        .await;
}

async fn run_session<S: ChartStream>(
    config: ChartStreamConfig,
    renderer: Box<dyn SeriesRenderer<S::Aggregate>>,
    status_store: StatusStore,
    cancel_token: CancellationToken,
) {
    let publisher = Arc::new(StatusPublisher::new(config.key(), status_store));
    publisher
        .publish(
            ConnectionState::Connecting,
            Some("opening push stream while history loads".to_string()),
        )
        .await;

    let epoch = Arc::new(ConnectionEpoch::new());
    let (signals_tx, signals_rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
    let connection_cancel = cancel_token.child_token();
    let connection = ResilientConnection::new(
        config.ws_url.clone(),
        StreamSubscription {
            channel: S::KIND.channel().to_string(),
            payload: subscription_payload(S::KIND, &config.symbol, &config.scale),
        },
        Duration::from_millis(config.reconnect_delay_ms),
        Arc::clone(&epoch),
    );
    let connection_handle = tokio::spawn(
        connection
            .run(signals_tx, connection_cancel.clone())
            .in_current_span(),
    );

    let (history_tx, history_rx) = oneshot::channel();
    let history_handle = {
        let client = Client::new();
        let config = config.clone();
        let publisher = Arc::clone(&publisher);
        let cancel = cancel_token.clone();

        tokio::spawn(
            async move {
                let fetched = tokio::select! {
                    _ = cancel.cancelled() => return,
                    fetched = S::fetch_history(&client, &config) => fetched,
                };

                match fetched {
                    Ok(rows) => {
                        let _ = history_tx.send(rows);
                    }
                    Err(error) => {
                        publisher
                            .publish(
                                ConnectionState::Error,
                                Some(format!("historical rows unavailable: {error}")),
                            )
                            .await;
                    }
                }
            }
            .in_current_span(),
        )
    };

    let mut session = ChartSession::<S>::new(&config, renderer, epoch, Arc::clone(&publisher));
    let outcome = drive_session(&mut session, signals_rx, history_rx, &cancel_token).await;

    connection_cancel.cancel();
    history_handle.abort();
    if let Err(error) = connection_handle.await {
        warn!(error = %error, "connection task ended abnormally");
    }

    info!(
        buckets = session.series().len(),
        late_dropped = session.aggregator.late_dropped(),
        duplicates_dropped = session.aggregator.duplicates_dropped(),
        stale_dropped = session.stale_dropped,
        invalid_dropped = session.invalid_dropped,
        "chart session finished"
    );

    let reason = match outcome {
        Ok(()) => "stream stopped".to_string(),
        Err(AppError::RendererClosed) => "renderer closed".to_string(),
        Err(error) => format!("stream ended: {error}"),
    };
    publisher.publish(ConnectionState::Stopped, Some(reason)).await;
}
