#![forbid(unsafe_code)]

use std::time::Duration;

pub const USER_AGENT: &str = concat!("avatar-provisioner/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl HttpTimeouts {
    pub const fn new(connect_timeout_ms: u64, request_timeout_ms: u64) -> Self {
        Self {
            connect_timeout_ms,
            request_timeout_ms,
        }
    }
}

/// Blocking agent whose whole call, body included, ends within the request
/// timeout. A zero timeout is raised to 100ms.
pub fn build_http_agent(timeouts: HttpTimeouts) -> ureq::Agent {
    let connect = Duration::from_millis(timeouts.connect_timeout_ms.max(100));
    let request = Duration::from_millis(timeouts.request_timeout_ms.max(100));
    ureq::AgentBuilder::new()
        .timeout_connect(connect)
        .timeout(request)
        .user_agent(USER_AGENT)
        .try_proxy_from_env(false)
        .build()
}

pub fn transport_error_kind(transport: &ureq::Transport) -> &'static str {
    let combined = format!("{:?} {}", transport.kind(), transport);
    classify_transport_error_kind(&combined)
}

/// Kind for an I/O failure while reading a response body.
pub fn body_read_error_kind(err: &std::io::Error) -> Option<&'static str> {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Some("timeout"),
        _ => None,
    }
}

fn classify_transport_error_kind(raw: &str) -> &'static str {
    let lower = raw.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        "timeout"
    } else if lower.contains("tls") || lower.contains("ssl") {
        "tls"
    } else if lower.contains("dns") {
        "dns"
    } else if lower.contains("connection") || lower.contains("connect") {
        "connection"
    } else {
        "transport"
    }
}
