pub mod error;
pub mod rates;
pub mod schedule;
pub mod types;

#[cfg(feature = "waterfall")]
pub mod waterfall;

#[cfg(feature = "stress")]
pub mod stress;

#[cfg(feature = "calibration")]
pub mod calibration;

#[cfg(feature = "optimizer")]
pub mod optimizer;

pub use error::StructuringError;
pub type StructuringResult<T> = Result<T, StructuringError>;
