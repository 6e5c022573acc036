use crate::error::AppError;
use crate::market::aggregate::{AveragePoint, Bucket, OhlcvPoint};
use crate::market::types::Side;
use crate::market::{SERIES_REPLACE_EVENT, SERIES_UPSERT_EVENT};
use serde::Serialize;
use std::marker::PhantomData;
use tokio::sync::mpsc;

pub const FULL_REPLACE_THRESHOLD: usize = 100;

#[derive(Debug, Clone)]
pub struct Series<A> {
    buckets: Vec<Bucket<A>>,
}

impl<A> Default for Series<A> {
    fn default() -> Self {
        Self {
            buckets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    ReplacedTail,
    Appended,
    Rejected { key: i64, tail: i64 },
}

impl<A: Clone> Series<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buckets(&self) -> &[Bucket<A>] {
        &self.buckets
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn tail(&self) -> Option<&Bucket<A>> {
        self.buckets.last()
    }

    pub fn replace_all(&mut self, mut buckets: Vec<Bucket<A>>) {
        buckets.sort_by_key(|bucket| bucket.start);
        let mut ordered: Vec<Bucket<A>> = Vec::with_capacity(buckets.len());
        for bucket in buckets {
            match ordered.last_mut() {
                Some(last) if last.start == bucket.start => *last = bucket,
                _ => ordered.push(bucket),
            }
        }
        self.buckets = ordered;
    }

    pub fn merge(&mut self, bucket: Bucket<A>) -> MergeOutcome {
        match self.buckets.last_mut() {
            Some(tail) if bucket.start < tail.start => MergeOutcome::Rejected {
                key: bucket.start,
                tail: tail.start,
            },
            Some(tail) if bucket.start == tail.start => {
                *tail = bucket;
                MergeOutcome::ReplacedTail
            }
            _ => {
                self.buckets.push(bucket);
                MergeOutcome::Appended
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EmissionMode {
    ReplaceAll,
    UpsertTail,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Emission<A> {
    ReplaceAll(Vec<Bucket<A>>),
    UpsertTail(Vec<Bucket<A>>),
}

impl<A> Emission<A> {
    pub fn mode(&self) -> EmissionMode {
        match self {
            Self::ReplaceAll(_) => EmissionMode::ReplaceAll,
            Self::UpsertTail(_) => EmissionMode::UpsertTail,
        }
    }
}

/// Decides between a full replace and a tail upsert for one candidate batch.
pub fn plan_emission<A: Clone>(candidate: &[Bucket<A>], series: &Series<A>) -> Option<Emission<A>> {
    if candidate.is_empty() {
        return None;
    }

    if candidate.len() >= FULL_REPLACE_THRESHOLD {
        return Some(Emission::ReplaceAll(series.buckets().to_vec()));
    }

    let latest = candidate.iter().map(|bucket| bucket.start).max()?;
    let tail = candidate
        .iter()
        .filter(|bucket| bucket.start == latest)
        .cloned()
        .collect();
    Some(Emission::UpsertTail(tail))
}

pub trait SeriesRenderer<A>: Send {
    fn replace_all(&mut self, buckets: &[Bucket<A>]) -> Result<(), AppError>;
    fn upsert_tail(&mut self, buckets: &[Bucket<A>]) -> Result<(), AppError>;
}

pub fn render<A, R>(renderer: &mut R, emission: &Emission<A>) -> Result<(), AppError>
where
    R: SeriesRenderer<A> + ?Sized,
{
    match emission {
        Emission::ReplaceAll(buckets) => renderer.replace_all(buckets),
        Emission::UpsertTail(buckets) => renderer.upsert_tail(buckets),
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UiLinePoint {
    pub time: i64,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UiCandle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UiVolumeBar {
    pub time: i64,
    pub value: f64,
    pub up: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SeriesPayload {
    AveragePrice {
        buy: Vec<UiLinePoint>,
        sell: Vec<UiLinePoint>,
    },
    Kline {
        candles: Vec<UiCandle>,
        volume: Vec<UiVolumeBar>,
    },
}

pub trait RenderAggregate: Sized {
    fn payload(buckets: &[Bucket<Self>]) -> SeriesPayload;
}

impl RenderAggregate for AveragePoint {
    fn payload(buckets: &[Bucket<Self>]) -> SeriesPayload {
        let side_points = |side: Side| {
            buckets
                .iter()
                .filter_map(|bucket| {
                    bucket.aggregate.side(side).map(|mean| UiLinePoint {
                        time: bucket.start,
                        value: mean.value(),
                    })
                })
                .collect::<Vec<_>>()
        };

        SeriesPayload::AveragePrice {
            buy: side_points(Side::Buy),
            sell: side_points(Side::Sell),
        }
    }
}

impl RenderAggregate for OhlcvPoint {
    fn payload(buckets: &[Bucket<Self>]) -> SeriesPayload {
        let candles = buckets
            .iter()
            .map(|bucket| UiCandle {
                time: bucket.start,
                open: bucket.aggregate.open,
                high: bucket.aggregate.high,
                low: bucket.aggregate.low,
                close: bucket.aggregate.close,
            })
            .collect();
        let volume = buckets
            .iter()
            .map(|bucket| UiVolumeBar {
                time: bucket.start,
                value: bucket.aggregate.value,
                up: bucket.aggregate.is_up(),
            })
            .collect();

        SeriesPayload::Kline { candles, volume }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartFrame {
    pub event: &'static str,
    pub symbol: String,
    pub scale: String,
    pub mode: EmissionMode,
    pub payload: SeriesPayload,
}

pub struct ChannelRenderer<A> {
    symbol: String,
    scale: String,
    frames: mpsc::UnboundedSender<ChartFrame>,
    _aggregate: PhantomData<fn(A)>,
}

impl<A> ChannelRenderer<A> {
    pub fn new(symbol: &str, scale: &str, frames: mpsc::UnboundedSender<ChartFrame>) -> Self {
        Self {
            symbol: symbol.to_string(),
            scale: scale.to_string(),
            frames,
            _aggregate: PhantomData,
        }
    }

    fn send(&self, event: &'static str, mode: EmissionMode, payload: SeriesPayload) -> Result<(), AppError> {
        let frame = ChartFrame {
            event,
            symbol: self.symbol.clone(),
            scale: self.scale.clone(),
            mode,
            payload,
        };
        self.frames
            .send(frame)
            .map_err(|_| AppError::RendererClosed)
    }
}

impl<A: RenderAggregate> SeriesRenderer<A> for ChannelRenderer<A> {
    fn replace_all(&mut self, buckets: &[Bucket<A>]) -> Result<(), AppError> {
        self.send(
            SERIES_REPLACE_EVENT,
            EmissionMode::ReplaceAll,
            A::payload(buckets),
        )
    }

    fn upsert_tail(&mut self, buckets: &[Bucket<A>]) -> Result<(), AppError> {
        self.send(
            SERIES_UPSERT_EVENT,
            EmissionMode::UpsertTail,
            A::payload(buckets),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::aggregate::MeanAccumulator;

    fn candle_bucket(start: i64, close: f64) -> Bucket<OhlcvPoint> {
        Bucket {
            start,
            aggregate: OhlcvPoint {
                open: 1.0,
                high: close.max(1.0),
                low: close.min(1.0),
                close,
                value: 5.0,
            },
        }
    }

    #[test]
    fn merge_replaces_tail_in_place_and_appends_on_advance() {
        let mut series = Series::new();
        assert_eq!(series.merge(candle_bucket(60, 1.1)), MergeOutcome::Appended);
        assert_eq!(
            series.merge(candle_bucket(60, 1.3)),
            MergeOutcome::ReplacedTail
        );
        assert_eq!(series.merge(candle_bucket(120, 0.9)), MergeOutcome::Appended);

        assert_eq!(series.len(), 2);
        assert_eq!(series.buckets()[0].aggregate.close, 1.3);
        assert_eq!(series.tail().map(|b| b.start), Some(120));
    }

    #[test]
    fn merge_rejects_bucket_behind_tail() {
        let mut series = Series::new();
        let _ = series.merge(candle_bucket(120, 1.0));
        assert_eq!(
            series.merge(candle_bucket(60, 2.0)),
            MergeOutcome::Rejected { key: 60, tail: 120 }
        );
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn replace_all_orders_and_dedups_keys() {
        let mut series = Series::new();
        series.replace_all(vec![
            candle_bucket(120, 1.0),
            candle_bucket(60, 1.0),
            candle_bucket(120, 2.0),
        ]);
        let keys: Vec<i64> = series.buckets().iter().map(|b| b.start).collect();
        assert_eq!(keys, vec![60, 120]);
        assert_eq!(series.tail().map(|b| b.aggregate.close), Some(2.0));
    }

    #[test]
    fn large_candidate_batch_replaces_everything() {
        let buckets: Vec<_> = (0..150).map(|index| candle_bucket(index * 60, 1.0)).collect();
        let mut series = Series::new();
        series.replace_all(buckets.clone());

        let emission = plan_emission(&buckets, &series).expect("emission expected");
        assert_eq!(emission.mode(), EmissionMode::ReplaceAll);
        match emission {
            Emission::ReplaceAll(all) => assert_eq!(all.len(), 150),
            other => panic!("expected full replace, got {other:?}"),
        }
    }

    #[test]
    fn small_batch_upserts_latest_key_in_arrival_order() {
        let candidate = vec![
            candle_bucket(60, 1.0),
            candle_bucket(120, 1.1),
            candle_bucket(120, 1.4),
        ];
        let series = Series::new();

        match plan_emission(&candidate, &series) {
            Some(Emission::UpsertTail(tail)) => {
                assert_eq!(tail.len(), 2);
                assert!(tail.iter().all(|b| b.start == 120));
                assert_eq!(tail.last().map(|b| b.aggregate.close), Some(1.4));
            }
            other => panic!("expected incremental update, got {other:?}"),
        }
    }

    #[test]
    fn threshold_boundary_is_inclusive() {
        let series = Series::new();
        let ninety_nine: Vec<_> = (0..99).map(|i| candle_bucket(i * 60, 1.0)).collect();
        let hundred: Vec<_> = (0..100).map(|i| candle_bucket(i * 60, 1.0)).collect();
        assert_eq!(
            plan_emission(&ninety_nine, &series).map(|e| e.mode()),
            Some(EmissionMode::UpsertTail)
        );
        assert_eq!(
            plan_emission(&hundred, &series).map(|e| e.mode()),
            Some(EmissionMode::ReplaceAll)
        );
        assert!(plan_emission::<OhlcvPoint>(&[], &series).is_none());
    }

    #[test]
    fn average_payload_omits_empty_sides() {
        let buckets = vec![
            Bucket {
                start: 60,
                aggregate: AveragePoint {
                    buy: Some(MeanAccumulator { sum: 30.0, count: 2 }),
                    sell: None,
                },
            },
            Bucket {
                start: 120,
                aggregate: AveragePoint {
                    buy: None,
                    sell: Some(MeanAccumulator::from_value(4.0)),
                },
            },
        ];

        match AveragePoint::payload(&buckets) {
            SeriesPayload::AveragePrice { buy, sell } => {
                assert_eq!(buy, vec![UiLinePoint { time: 60, value: 15.0 }]);
                assert_eq!(sell, vec![UiLinePoint { time: 120, value: 4.0 }]);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn channel_renderer_forwards_frames_and_reports_closed_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut renderer = ChannelRenderer::<OhlcvPoint>::new("MLP_USDT", "5m", tx);

        renderer
            .upsert_tail(&[candle_bucket(300, 0.5)])
            .expect("send should succeed");
        let frame = rx.try_recv().expect("frame should be queued");
        assert_eq!(frame.event, SERIES_UPSERT_EVENT);
        assert_eq!(frame.mode, EmissionMode::UpsertTail);
        match frame.payload {
            SeriesPayload::Kline { candles, volume } => {
                assert_eq!(candles.len(), 1);
                assert!(!volume[0].up);
            }
            other => panic!("unexpected payload {other:?}"),
        }

        drop(rx);
        assert!(matches!(
            renderer.replace_all(&[]),
            Err(AppError::RendererClosed)
        ));
    }
}
