#![forbid(unsafe_code)]

pub mod avatar;
pub mod common;

pub use common::{ContractViolation, FieldViolations, SchemaVersion, Validate};
