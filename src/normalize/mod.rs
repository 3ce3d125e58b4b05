//! Normalization library — ambiguous bank-SMS encodings to exact values.
//!
//! No dependencies on the rest of the pipeline; everything here is pure.

pub mod amount;
pub mod card;
pub mod datetime;

pub use amount::parse_amount;
pub use card::mask_card;
pub use datetime::parse_datetime;
