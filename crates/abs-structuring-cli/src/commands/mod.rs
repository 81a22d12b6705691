pub mod optimize;
pub mod rates;
pub mod stress;
pub mod structuring;
