use crate::market::gateio::{connect_push_stream, GateWsStream};
use crate::market::types::SubscribeFrame;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Advanced on every connect. Messages tagged with an older value are stale.
#[derive(Debug, Default)]
pub struct ConnectionEpoch(AtomicU64);

impl ConnectionEpoch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel).saturating_add(1)
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.current() == epoch
    }
}

#[derive(Debug, Clone)]
pub struct StreamSubscription {
    pub channel: String,
    pub payload: Vec<String>,
}

impl StreamSubscription {
    pub fn frame(&self, now_secs: i64) -> SubscribeFrame {
        SubscribeFrame::new(now_secs, &self.channel, self.payload.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub epoch: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    Subscribed { epoch: u64 },
    Message(InboundMessage),
    Disconnected { epoch: u64, reason: String },
}

enum SessionEnd {
    Cancelled,
    ConsumerGone,
    Disconnected(String),
}

pub struct ResilientConnection {
    endpoint: String,
    subscription: StreamSubscription,
    reconnect_delay: Duration,
    epoch: Arc<ConnectionEpoch>,
}

impl ResilientConnection {
    pub fn new(
        endpoint: impl Into<String>,
        subscription: StreamSubscription,
        reconnect_delay: Duration,
        epoch: Arc<ConnectionEpoch>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            subscription,
            reconnect_delay,
            epoch,
        }
    }

    pub async fn run(self, signals: mpsc::Sender<StreamSignal>, cancel: CancellationToken) {
        info!(
            endpoint = %self.endpoint,
            channel = %self.subscription.channel,
            "starting push subscription"
        );

        while !cancel.is_cancelled() {
            let epoch = self.epoch.advance();

            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                connected = connect_push_stream(&self.endpoint) => connected,
            };

            let reason = match connected {
                Ok(stream) => match self.drive(stream, epoch, &signals, &cancel).await {
                    SessionEnd::Cancelled => break,
                    SessionEnd::ConsumerGone => {
                        debug!(epoch, "signal receiver dropped, stopping subscription");
                        return;
                    }
                    SessionEnd::Disconnected(reason) => reason,
                },
                Err(error) => format!("connect failed: {error}"),
            };

            warn!(
                endpoint = %self.endpoint,
                epoch,
                reason = %reason,
                delay_ms = self.reconnect_delay.as_millis() as u64,
                "push stream lost, reconnecting"
            );
            if signals
                .send(StreamSignal::Disconnected { epoch, reason })
                .await
                .is_err()
            {
                return;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        info!(endpoint = %self.endpoint, "push subscription stopped");
    }

    async fn drive(
        &self,
        stream: GateWsStream,
        epoch: u64,
        signals: &mpsc::Sender<StreamSignal>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let (mut write, mut read) = stream.split();

        let frame = self.subscription.frame(now_unix_secs());
        let text = match simd_json::serde::to_string(&frame) {
            Ok(text) => text,
            Err(error) => return SessionEnd::Disconnected(format!("encode subscribe: {error}")),
        };
        if let Err(error) = write.send(Message::Text(text)).await {
            return SessionEnd::Disconnected(format!("send subscribe: {error}"));
        }
        if signals.send(StreamSignal::Subscribed { epoch }).await.is_err() {
            if let Err(error) = write.close().await {
                debug!(epoch, error = %error, "close after consumer left failed");
            }
            return SessionEnd::ConsumerGone;
        }

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(error) = write.close().await {
                        debug!(epoch, error = %error, "close on teardown failed");
                    }
                    return SessionEnd::Cancelled;
                }
                next = read.next() => next,
            };

            let payload = match next {
                None => return SessionEnd::Disconnected("stream ended".to_string()),
                Some(Err(error)) => return SessionEnd::Disconnected(format!("read: {error}")),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|close| format!("server closed ({}) {}", close.code, close.reason))
                        .unwrap_or_else(|| "server closed".to_string());
                    return SessionEnd::Disconnected(reason);
                }
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Binary(bytes))) => bytes,
                Some(Ok(_)) => continue,
            };

            let message = StreamSignal::Message(InboundMessage { epoch, payload });
            if signals.send(message).await.is_err() {
                if let Err(error) = write.close().await {
                    debug!(epoch, error = %error, "close after consumer left failed");
                }
                return SessionEnd::ConsumerGone;
            }
        }
    }
}

fn now_unix_secs() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_secs().min(i64::MAX as u64) as i64,
        Err(_) => 0,
    }
}
