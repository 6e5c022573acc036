pub mod aggregate;
pub mod connection;
pub mod gateio;
pub mod normalize;
pub mod pipeline;
pub mod series;
pub mod types;

pub const SERIES_REPLACE_EVENT: &str = "series_replace";
pub const SERIES_UPSERT_EVENT: &str = "series_upsert";
