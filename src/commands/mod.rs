pub mod chart_stream;
pub mod health;
