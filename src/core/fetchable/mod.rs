use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// HTTP codes worth another attempt. `0` stands for a transport failure
/// (timeout, DNS, connection reset) where no status was received.
pub const RETRYABLE_CODES: [u16; 13] = [
    0, 408, 425, 429, 500, 503, 504, 509, 520, 521, 522, 523, 524,
];

pub const MAX_FETCH_ATTEMPTS: u32 = 9;
const BASE_RETRY_DELAY_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Link,
    Feed,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Link => "link",
            Self::Feed => "feed",
        }
    }
}

/// A disjoint shard of resources: ids where `id % total == number`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Serie {
    pub number: u32,
    pub total: u32,
}

impl Serie {
    pub fn new(number: u32, total: u32) -> Option<Self> {
        if total == 0 || number >= total {
            return None;
        }
        Some(Self { number, total })
    }

    /// Parses `"<number>/<total>"`.
    pub fn parse(value: &str) -> Option<Self> {
        let (number, total) = value.trim().split_once('/')?;
        Self::new(number.trim().parse().ok()?, total.trim().parse().ok()?)
    }

    pub fn owns(&self, id: i64) -> bool {
        id.rem_euclid(i64::from(self.total)) == i64::from(self.number)
    }
}

/// Fetch bookkeeping shared by links and feed collections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchableState {
    pub fetched_at: Option<DateTime<Utc>>,
    pub fetched_code: u16,
    pub fetched_error: Option<String>,
    pub fetched_count: u32,
    pub fetched_retry_at: Option<DateTime<Utc>>,
}

impl FetchableState {
    pub fn is_fetched(&self) -> bool {
        self.fetched_at.is_some()
    }

    pub fn is_in_error(&self) -> bool {
        self.is_fetched() && !(200..300).contains(&self.fetched_code)
    }

    pub fn should_be_fetched_again(&self) -> bool {
        if !self.is_fetched() {
            return true;
        }
        is_retryable_code(self.fetched_code) && self.fetched_count < MAX_FETCH_ATTEMPTS
    }

    pub fn fetch_again_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.should_be_fetched_again() {
            return None;
        }
        Some(now + retry_delay(self.fetched_count))
    }

    /// Records the outcome of one attempt. The counter is bumped before the
    /// backoff is computed.
    pub fn record_fetch(
        &mut self,
        now: DateTime<Utc>,
        code: u16,
        error: Option<String>,
        retry_after: Option<DateTime<Utc>>,
    ) {
        self.fetched_at = Some(now);
        self.fetched_code = code;
        self.fetched_error = error;
        self.fetched_count = self.fetched_count.saturating_add(1);
        self.fetched_retry_at = match (self.fetch_again_after(now), retry_after) {
            (Some(backoff), Some(hint)) => Some(backoff.max(hint)),
            (Some(backoff), None) => Some(backoff),
            (None, _) => None,
        };
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match (self.fetched_at, self.fetched_retry_at) {
            (None, _) => true,
            (Some(_), Some(retry_at)) => retry_at <= now,
            (Some(_), None) => false,
        }
    }
}

pub fn is_retryable_code(code: u16) -> bool {
    RETRYABLE_CODES.contains(&code)
}

/// `60 + (count - 1)^4` seconds.
pub fn retry_delay(fetched_count: u32) -> Duration {
    let base = i64::from(fetched_count.saturating_sub(1));
    Duration::seconds(BASE_RETRY_DELAY_SECS + base.pow(4))
}
