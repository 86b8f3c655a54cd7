#![forbid(unsafe_code)]

pub mod records;
pub mod repo;
pub mod sealer;
