use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use tracing::warn;

use super::HttpResponse;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupted cache entry {0}")]
    Corrupted(String),
}

/// SHA-256 hex digest of raw bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    format!("{digest:x}")
}

/// Raw responses stored on disk, one file per URL hash.
#[derive(Debug, Clone)]
pub struct HttpCache {
    path: PathBuf,
}

impl HttpCache {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.path.join(key)
    }

    /// Returns the entry when it was written less than `max_age` ago.
    pub fn get(
        &self,
        key: &str,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<HttpResponse>, CacheError> {
        let path = self.entry_path(key);
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        let modified = DateTime::<Utc>::from(metadata.modified()?);
        if modified + max_age <= now {
            return Ok(None);
        }

        let raw = fs::read(&path)?;
        decode(&raw)
            .map(Some)
            .ok_or_else(|| CacheError::Corrupted(key.to_string()))
    }

    pub fn save(&self, key: &str, response: &HttpResponse) -> Result<(), CacheError> {
        let tmp_path = self.entry_path(&format!("{key}.tmp"));
        fs::write(&tmp_path, encode(response))?;
        fs::rename(&tmp_path, self.entry_path(key))?;
        Ok(())
    }

    /// Deletes entries last written before `before`; returns how many went.
    pub fn clean(&self, before: DateTime<Utc>) -> Result<usize, CacheError> {
        let cutoff = SystemTime::from(before);
        let mut deleted = 0;
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() || metadata.modified()? >= cutoff {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => deleted += 1,
                Err(error) => {
                    warn!(path = %entry.path().display(), error = %error, "failed to delete cache file");
                }
            }
        }
        Ok(deleted)
    }
}

fn encode(response: &HttpResponse) -> Vec<u8> {
    let mut raw = format!("HTTP {}\n", response.status).into_bytes();
    for (name, value) in &response.headers {
        raw.extend_from_slice(format!("{}: {}\n", name.to_lowercase(), value).as_bytes());
    }
    raw.push(b'\n');
    raw.extend_from_slice(&response.body);
    raw
}

fn decode(raw: &[u8]) -> Option<HttpResponse> {
    let separator = raw.windows(2).position(|window| window == b"\n\n")?;
    let head = std::str::from_utf8(&raw[..separator]).ok()?;
    let body = raw[separator + 2..].to_vec();

    let mut lines = head.lines();
    let status = lines.next()?.strip_prefix("HTTP ")?.trim().parse().ok()?;
    let headers = lines
        .filter_map(|line| line.split_once(": "))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();

    Some(HttpResponse {
        status,
        headers,
        body,
    })
}
