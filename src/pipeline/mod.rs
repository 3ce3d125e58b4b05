//! Pipeline stages: validation rules and the parser worker.

pub mod validate;
pub mod worker;

pub use validate::{ValidationFailure, validate_transaction};
pub use worker::{Outcome, ParserWorker, ProcessingNote};
