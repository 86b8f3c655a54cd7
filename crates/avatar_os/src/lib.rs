#![forbid(unsafe_code)]

pub mod context;
pub mod lookup;
pub mod pipeline;

#[cfg(test)]
pub(crate) mod fakes;
