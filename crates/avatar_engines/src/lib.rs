#![forbid(unsafe_code)]

pub mod http;
pub mod identity;
pub mod provisioning;

#[cfg(test)]
pub(crate) mod test_support;
