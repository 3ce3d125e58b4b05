//! SMS Ledger — bank-notification transaction pipeline.

pub mod bus;
pub mod classify;
pub mod config;
pub mod error;
pub mod extract;
pub mod inspector;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod store;
pub mod writer;
