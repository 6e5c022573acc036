use crate::market::types::{
    CandlePoint, CandleRowWire, CandleTickWire, Side, TradePoint, TradeWire, WireField,
    CANDLE_ROW_MIN_COLUMNS,
};

fn finite(field: &WireField) -> Option<f64> {
    field.as_f64().filter(|value| value.is_finite())
}

fn timestamp(field: &WireField) -> Option<i64> {
    let value = finite(field)?;
    if value < 0.0 || value > i64::MAX as f64 {
        return None;
    }
    Some(value.floor() as i64)
}

fn volume_or_zero(field: Option<&WireField>) -> f64 {
    field.and_then(finite).unwrap_or(0.0)
}

pub fn normalize_trade(wire: &TradeWire) -> Option<TradePoint> {
    let side = Side::parse_str(&wire.side)?;
    let price = finite(&wire.price)?;
    let timestamp_ms = timestamp(&wire.create_time_ms)?;

    Some(TradePoint {
        id: wire.id.as_ref().and_then(WireField::as_u64),
        timestamp_ms,
        side,
        price,
    })
}

fn candle_from_parts(
    time: &WireField,
    open: &WireField,
    high: &WireField,
    low: &WireField,
    close: &WireField,
    volume: Option<&WireField>,
) -> Option<CandlePoint> {
    let close = finite(close)?;
    let timestamp_sec = timestamp(time)?;
    // open/high/low borrow close when unreadable so the fold invariants hold.
    let open = finite(open).unwrap_or(close);
    let high = finite(high).unwrap_or(close).max(open).max(close);
    let low = finite(low).unwrap_or(close).min(open).min(close);

    Some(CandlePoint {
        timestamp_sec,
        open,
        high,
        low,
        close,
        volume: volume_or_zero(volume),
    })
}

pub fn normalize_candle_tick(wire: &CandleTickWire) -> Option<CandlePoint> {
    candle_from_parts(&wire.t, &wire.o, &wire.h, &wire.l, &wire.c, wire.v.as_ref())
}

pub fn normalize_candle_row(row: &CandleRowWire) -> Option<CandlePoint> {
    let columns = &row.0;
    if columns.len() < CANDLE_ROW_MIN_COLUMNS {
        return None;
    }
    candle_from_parts(
        &columns[0],
        &columns[5],
        &columns[3],
        &columns[4],
        &columns[2],
        Some(&columns[1]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(value: &str) -> WireField {
        WireField::Text(value.to_string())
    }

    fn trade(ts: &str, side: &str, price: &str) -> TradeWire {
        TradeWire {
            id: Some(text("7")),
            create_time_ms: text(ts),
            side: side.to_string(),
            price: text(price),
        }
    }

    fn tick(c: &str, v: Option<&str>) -> CandleTickWire {
        CandleTickWire {
            t: text("1700000100"),
            o: text("1.0"),
            h: text("1.4"),
            l: text("0.9"),
            c: text(c),
            v: v.map(text),
        }
    }

    #[test]
    fn widens_fractional_millisecond_timestamps() {
        let point = normalize_trade(&trade("1606292218213.4578", "sell", "0.4705"))
            .expect("trade should normalize");
        assert_eq!(point.timestamp_ms, 1_606_292_218_213);
        assert_eq!(point.side, Side::Sell);
        assert_eq!(point.id, Some(7));
        assert_eq!(point.price, 0.4705);
        assert_eq!(point.time_secs(), 1_606_292_218);
    }

    #[test]
    fn drops_trades_with_unknown_side_or_bad_price() {
        assert!(normalize_trade(&trade("1000", "hold", "1.0")).is_none());
        assert!(normalize_trade(&trade("1000", "BUY", "1.0")).is_none());
        assert!(normalize_trade(&trade("1000", "buy", "broken")).is_none());
        assert!(normalize_trade(&trade("1000", "buy", "NaN")).is_none());
        assert!(normalize_trade(&trade("1000", "buy", "inf")).is_none());
        assert!(normalize_trade(&trade("-5", "buy", "1.0")).is_none());
    }

    #[test]
    fn accepts_numeric_trade_fields() {
        let wire = TradeWire {
            id: None,
            create_time_ms: WireField::Number(1_700_000_000_123.0),
            side: "buy".to_string(),
            price: WireField::Number(2.5),
        };
        let point = normalize_trade(&wire).expect("numeric fields should normalize");
        assert_eq!(point.timestamp_ms, 1_700_000_000_123);
        assert_eq!(point.price, 2.5);
    }

    #[test]
    fn bad_volume_keeps_candle_with_zero_volume() {
        let point = normalize_candle_tick(&tick("1.2", Some("n/a"))).expect("candle should stay");
        assert_eq!(point.volume, 0.0);
        assert_eq!(point.close, 1.2);

        let missing = normalize_candle_tick(&tick("1.2", None)).expect("candle should stay");
        assert_eq!(missing.volume, 0.0);
    }

    #[test]
    fn bad_close_drops_candle() {
        assert!(normalize_candle_tick(&tick("oops", Some("3.0"))).is_none());
    }

    #[test]
    fn maps_historical_row_columns() {
        let row = CandleRowWire(vec![
            text("1700000000"),
            text("250.5"),
            text("1.2"),
            text("1.3"),
            text("1.1"),
            text("1.15"),
            text("10.4"),
            WireField::Flag(true),
        ]);
        let point = normalize_candle_row(&row).expect("row should normalize");
        assert_eq!(point.timestamp_sec, 1_700_000_000);
        assert_eq!(point.volume, 250.5);
        assert_eq!(point.close, 1.2);
        assert_eq!(point.high, 1.3);
        assert_eq!(point.low, 1.1);
        assert_eq!(point.open, 1.15);
    }

    #[test]
    fn short_historical_row_is_dropped() {
        let row = CandleRowWire(vec![text("1700000000"), text("1.0")]);
        assert!(normalize_candle_row(&row).is_none());
    }
}
