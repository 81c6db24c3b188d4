use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::warn;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};

pub const HTTP_TIMEOUT_ENV: &str = "CERT_RECONCILER_HTTP_TIMEOUT_SECS";
const USER_AGENT: &str = concat!("cert-reconciler/", env!("CARGO_PKG_VERSION"));

pub struct HttpClient;

impl HttpClient {
    /// Process-wide client shared by the ACME, DNS-over-HTTPS and provider clients.
    pub fn shared() -> &'static Client {
        static CLIENT: OnceLock<Client> = OnceLock::new();
        CLIENT.get_or_init(|| {
            Client::builder()
                .timeout(resolve_timeout())
                .user_agent(USER_AGENT)
                .build()
                .unwrap_or_else(|err| {
                    warn!("[http] failed to build shared client: {err}");
                    Client::new()
                })
        })
    }
}

pub fn resolve_timeout() -> Duration {
    const DEFAULT_TIMEOUT_SECS: u64 = 15;
    let timeout = std::env::var(HTTP_TIMEOUT_ENV)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    if timeout == 0 {
        warn!("[http] invalid timeout value; using default");
        return Duration::from_secs(DEFAULT_TIMEOUT_SECS);
    }
    Duration::from_secs(timeout)
}

/// Coarse classification of an HTTP response status for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Unauthorized,
    RateLimited,
    NotFound,
    ServerError,
    ClientError,
}

pub fn classify(status: StatusCode) -> StatusClass {
    if status.is_success() {
        StatusClass::Success
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        StatusClass::Unauthorized
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        StatusClass::RateLimited
    } else if status == StatusCode::NOT_FOUND {
        StatusClass::NotFound
    } else if status.is_server_error() {
        StatusClass::ServerError
    } else {
        StatusClass::ClientError
    }
}

/// Reads `Retry-After` as delay-seconds or an HTTP date.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    parse_retry_after_value(raw, Utc::now())
}

fn parse_retry_after_value(raw: &str, now: DateTime<Utc>) -> Option<Duration> {
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
