use crate::market::types::{CandlePoint, Side, TradePoint};
use std::collections::HashSet;
use std::fmt::Debug;
use std::marker::PhantomData;

/// `floor(event_time / width) * width`, flooring toward negative infinity.
pub fn bucket_key(event_time_secs: i64, width_secs: i64) -> i64 {
    if width_secs <= 0 {
        return event_time_secs;
    }
    event_time_secs - event_time_secs.rem_euclid(width_secs)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bucket<A> {
    pub start: i64,
    pub aggregate: A,
}

pub trait FoldPolicy {
    type Event: Debug + Send;
    type Aggregate: Clone + Debug + PartialEq + Send + 'static;

    fn event_time_secs(event: &Self::Event) -> i64;

    fn event_id(_event: &Self::Event) -> Option<u64> {
        None
    }

    fn seed(event: &Self::Event) -> Self::Aggregate;
    fn fold(aggregate: &mut Self::Aggregate, event: &Self::Event);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeanAccumulator {
    pub sum: f64,
    pub count: u32,
}

impl MeanAccumulator {
    pub fn from_value(value: f64) -> Self {
        Self {
            sum: value,
            count: 1,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.sum += value;
        self.count = self.count.saturating_add(1);
    }

    pub fn value(&self) -> f64 {
        self.sum / f64::from(self.count.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AveragePoint {
    pub buy: Option<MeanAccumulator>,
    pub sell: Option<MeanAccumulator>,
}

impl AveragePoint {
    pub fn side(&self, side: Side) -> Option<&MeanAccumulator> {
        match side {
            Side::Buy => self.buy.as_ref(),
            Side::Sell => self.sell.as_ref(),
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut Option<MeanAccumulator> {
        match side {
            Side::Buy => &mut self.buy,
            Side::Sell => &mut self.sell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OhlcvPoint {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub value: f64,
}

impl OhlcvPoint {
    pub fn is_up(&self) -> bool {
        self.close >= self.open
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Averaging;

impl FoldPolicy for Averaging {
    type Event = TradePoint;
    type Aggregate = AveragePoint;

    fn event_time_secs(event: &TradePoint) -> i64 {
        event.time_secs()
    }

    fn event_id(event: &TradePoint) -> Option<u64> {
        event.id
    }

    fn seed(event: &TradePoint) -> AveragePoint {
        let mut point = AveragePoint::default();
        *point.side_mut(event.side) = Some(MeanAccumulator::from_value(event.price));
        point
    }

    fn fold(aggregate: &mut AveragePoint, event: &TradePoint) {
        let slot = aggregate.side_mut(event.side);
        match slot.as_mut() {
            Some(mean) => mean.push(event.price),
            None => *slot = Some(MeanAccumulator::from_value(event.price)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OhlcvMerge;

impl FoldPolicy for OhlcvMerge {
    type Event = CandlePoint;
    type Aggregate = OhlcvPoint;

    fn event_time_secs(event: &CandlePoint) -> i64 {
        event.timestamp_sec
    }

    fn seed(event: &CandlePoint) -> OhlcvPoint {
        OhlcvPoint {
            open: event.open,
            high: event.high.max(event.open).max(event.close),
            low: event.low.min(event.open).min(event.close),
            close: event.close,
            value: event.volume,
        }
    }

    fn fold(aggregate: &mut OhlcvPoint, event: &CandlePoint) {
        aggregate.high = aggregate.high.max(event.high).max(event.close);
        aggregate.low = aggregate.low.min(event.low).min(event.close);
        aggregate.close = event.close;
        aggregate.value = event.volume;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FoldOutcome<A> {
    Folded(Bucket<A>),
    Opened {
        closed: Option<Bucket<A>>,
        opened: Bucket<A>,
    },
    Late { key: i64, open_key: i64 },
    Duplicate { key: i64, id: u64 },
}

#[derive(Debug)]
pub struct TimeBucketAggregator<P: FoldPolicy> {
    width_secs: i64,
    open: Option<Bucket<P::Aggregate>>,
    seen_ids: HashSet<u64>,
    late_dropped: u64,
    duplicates_dropped: u64,
    _policy: PhantomData<P>,
}

impl<P: FoldPolicy> TimeBucketAggregator<P> {
    pub fn new(width_secs: i64) -> Self {
        Self {
            width_secs,
            open: None,
            seen_ids: HashSet::new(),
            late_dropped: 0,
            duplicates_dropped: 0,
            _policy: PhantomData,
        }
    }

    pub fn width_secs(&self) -> i64 {
        self.width_secs
    }

    pub fn open_bucket(&self) -> Option<&Bucket<P::Aggregate>> {
        self.open.as_ref()
    }

    pub fn late_dropped(&self) -> u64 {
        self.late_dropped
    }

    pub fn duplicates_dropped(&self) -> u64 {
        self.duplicates_dropped
    }

    pub fn apply(&mut self, event: &P::Event) -> FoldOutcome<P::Aggregate> {
        let key = bucket_key(P::event_time_secs(event), self.width_secs);

        match self.open.as_mut() {
            Some(current) if key < current.start => {
                self.late_dropped = self.late_dropped.saturating_add(1);
                FoldOutcome::Late {
                    key,
                    open_key: current.start,
                }
            }
            Some(current) if key == current.start => {
                if let Some(id) = P::event_id(event) {
                    if !self.seen_ids.insert(id) {
                        self.duplicates_dropped = self.duplicates_dropped.saturating_add(1);
                        return FoldOutcome::Duplicate { key, id };
                    }
                }
                P::fold(&mut current.aggregate, event);
                FoldOutcome::Folded(current.clone())
            }
            _ => {
                // Ids are tracked for the open bucket only.
                self.seen_ids.clear();
                if let Some(id) = P::event_id(event) {
                    self.seen_ids.insert(id);
                }
                let opened = Bucket {
                    start: key,
                    aggregate: P::seed(event),
                };
                let closed = self.open.replace(opened.clone());
                FoldOutcome::Opened { closed, opened }
            }
        }
    }

    /// Rebuilds state from a snapshot; the last bucket stays open.
    pub fn bootstrap(&mut self, mut events: Vec<P::Event>) -> Vec<Bucket<P::Aggregate>> {
        self.open = None;
        self.seen_ids.clear();
        events.sort_by_key(|event| P::event_time_secs(event));

        let mut buckets: Vec<Bucket<P::Aggregate>> = Vec::new();
        for event in &events {
            match self.apply(event) {
                FoldOutcome::Folded(bucket) => {
                    if let Some(last) = buckets.last_mut() {
                        *last = bucket;
                    }
                }
                FoldOutcome::Opened { opened, .. } => buckets.push(opened),
                FoldOutcome::Late { .. } | FoldOutcome::Duplicate { .. } => {}
            }
        }
        buckets
    }
}
