pub mod cache;

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(reqwest::header::CONTENT_TYPE.as_str())
    }

    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.header(RETRY_AFTER.as_str())
            .and_then(|value| parse_retry_after(value, now))
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid server ip: {0}")]
    InvalidIp(String),
}

/// One client per outbound IP, plus a default one when none is configured.
#[derive(Debug, Clone)]
pub struct HttpClients {
    default: reqwest::Client,
    by_ip: Vec<(String, reqwest::Client)>,
}

impl HttpClients {
    pub fn new(
        user_agent: &str,
        timeout: Duration,
        server_ips: &[String],
    ) -> Result<Self, FetchError> {
        let default = build_client(user_agent, timeout, None)?;
        let mut by_ip = Vec::with_capacity(server_ips.len());
        for ip in server_ips {
            let address: IpAddr = ip
                .parse()
                .map_err(|_| FetchError::InvalidIp(ip.clone()))?;
            by_ip.push((ip.clone(), build_client(user_agent, timeout, Some(address))?));
        }
        Ok(Self { default, by_ip })
    }

    /// Configured IPs, or a single `None` when requests use the default route.
    pub fn ips(&self) -> Vec<Option<&str>> {
        if self.by_ip.is_empty() {
            return vec![None];
        }
        self.by_ip.iter().map(|(ip, _)| Some(ip.as_str())).collect()
    }

    pub fn client_for(&self, ip: Option<&str>) -> &reqwest::Client {
        ip.and_then(|ip| {
            self.by_ip
                .iter()
                .find(|(candidate, _)| candidate == ip)
                .map(|(_, client)| client)
        })
        .unwrap_or(&self.default)
    }
}

pub fn build_client(
    user_agent: &str,
    timeout: Duration,
    local_address: Option<IpAddr>,
) -> Result<reqwest::Client, FetchError> {
    let client = reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .local_address(local_address)
        .build()?;
    Ok(client)
}

/// Performs a GET. Any status is returned as a response; only transport
/// failures are errors.
pub async fn fetch_url(client: &reqwest::Client, url: &str) -> Result<HttpResponse, FetchError> {
    let response = client.get(url).send().await?;
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();
    let body = response.bytes().await?.to_vec();

    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}

/// Accepts delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<i64>() {
        return Some(now + chrono::Duration::seconds(seconds.max(0)));
    }
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}
