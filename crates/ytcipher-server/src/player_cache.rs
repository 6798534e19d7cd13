//! On-disk cache of player script files.
//!
//! Player sources are cached under `{cache_dir}/{key}.js`, keyed by the
//! policy in `ytcipher_common::player_url`. Concurrent downloads of the
//! same target coalesce onto a single upstream fetch; late arrivals wait on
//! a watch channel for the leader's outcome. Writes go through a temp
//! directory inside the cache dir and land with an atomic rename, so a
//! reader never observes a partially written file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::{watch, Mutex};

use ytcipher_common::player_url::{self, KeyMode};
use ytcipher_common::CipherError;

/// Total budget for one upstream fetch.
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Cache entries unused for longer than this are deleted at startup.
const MAX_ENTRY_AGE: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Gauge name for the on-disk cache.
const PLAYER_CACHE_NAME: &str = "player";

/// Outcome published to waiters of an in-flight fetch. Waiters that see a
/// failure clear the entry and retry on their own.
type FetchOutcome = Result<(), String>;

pub struct PlayerFileCache {
    cache_dir: PathBuf,
    key_mode: KeyMode,
    client: reqwest::Client,
    in_flight: Mutex<HashMap<PathBuf, watch::Receiver<Option<FetchOutcome>>>>,
}

enum FlightRole {
    Leader(watch::Sender<Option<FetchOutcome>>),
    Waiter(watch::Receiver<Option<FetchOutcome>>),
}

impl PlayerFileCache {
    pub fn new(cache_dir: PathBuf, key_mode: KeyMode) -> Result<Self, CipherError> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| CipherError::HttpClient(e.to_string()))?;
        Ok(Self {
            cache_dir,
            key_mode,
            client,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Resolves a normalized player URL to a local file containing its
    /// source, downloading it on a cache miss. At most one download per
    /// target file is in flight at any time.
    pub async fn player_file_path(&self, player_url: &str) -> Result<PathBuf, CipherError> {
        let key = player_url::cache_key(player_url, self.key_mode);
        let path = self.cache_dir.join(format!("{key}.js"));

        loop {
            if file_exists(&path).await {
                touch(&path);
                return Ok(path);
            }

            let role = {
                let mut map = self.in_flight.lock().await;
                match map.get(&path) {
                    Some(rx) => FlightRole::Waiter(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        map.insert(path.clone(), rx);
                        FlightRole::Leader(tx)
                    }
                }
            };

            match role {
                FlightRole::Waiter(rx) => {
                    if await_flight(rx).await.is_err() {
                        // The leader failed or vanished; clear the entry so
                        // the retry below can start a fresh flight.
                        self.in_flight.lock().await.remove(&path);
                    }
                    continue;
                }
                FlightRole::Leader(tx) => {
                    let result = self.download(player_url, &path).await;
                    let outcome = match &result {
                        Ok(()) => Ok(()),
                        Err(e) => Err(e.to_string()),
                    };
                    // Drop the registration before publishing, so new
                    // arrivals start a fresh flight instead of observing a
                    // finished one.
                    self.in_flight.lock().await.remove(&path);
                    let _ = tx.send(Some(outcome));
                    result?;
                    return Ok(path);
                }
            }
        }
    }

    async fn download(&self, url: &str, path: &Path) -> Result<(), CipherError> {
        tracing::info!(url, "downloading player script");

        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                ytcipher_metrics::record_player_fetch(url, "request failed");
                return Err(CipherError::PlayerFetchFailed {
                    status: 0,
                    status_text: e.to_string(),
                });
            }
        };

        let status = response.status();
        let status_text = status.canonical_reason().unwrap_or("unknown");
        ytcipher_metrics::record_player_fetch(url, status_text);

        if !status.is_success() {
            return Err(CipherError::PlayerFetchFailed {
                status: status.as_u16(),
                status_text: status_text.to_string(),
            });
        }

        let body = response.bytes().await.map_err(|e| CipherError::PlayerFetchFailed {
            status: status.as_u16(),
            status_text: format!("body read failed: {e}"),
        })?;

        // Temp dir inside the cache dir: same filesystem, so the rename is
        // atomic; the TempDir guard removes it on every exit path.
        let tmp = tempfile::tempdir_in(&self.cache_dir)?;
        let tmp_file = tmp.path().join("player.js");
        tokio::fs::write(&tmp_file, &body).await?;

        if file_exists(path).await {
            let _ = tokio::fs::remove_file(path).await;
        }
        tokio::fs::rename(&tmp_file, path).await?;

        tracing::info!(path = %path.display(), bytes = body.len(), "player script cached");
        self.publish_size().await;
        Ok(())
    }

    async fn publish_size(&self) {
        match count_entries(&self.cache_dir).await {
            Ok(count) => ytcipher_metrics::set_cache_size(PLAYER_CACHE_NAME, count),
            Err(e) => tracing::warn!(error = %e, "failed to count player cache entries"),
        }
    }

    /// Startup sweep: ensures the cache directory exists, deletes entries
    /// unused for more than 14 days, and publishes the size gauge.
    /// Per-entry failures are logged and skipped.
    pub fn sweep(&self) -> Result<usize, CipherError> {
        std::fs::create_dir_all(&self.cache_dir)?;
        let cutoff = SystemTime::now() - MAX_ENTRY_AGE;

        let mut kept = 0usize;
        for entry in std::fs::read_dir(&self.cache_dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "unreadable cache entry; skipping");
                    continue;
                }
            };
            match sweep_entry(&entry.path(), cutoff) {
                Ok(Swept::Kept) => kept += 1,
                Ok(Swept::Deleted) => {
                    tracing::info!(path = %entry.path().display(), "evicted stale player file");
                }
                Ok(Swept::NotAFile) => {}
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "sweep failed for entry; skipping");
                }
            }
        }

        ytcipher_metrics::set_cache_size(PLAYER_CACHE_NAME, kept);
        Ok(kept)
    }
}

enum Swept {
    Kept,
    Deleted,
    NotAFile,
}

fn sweep_entry(path: &Path, cutoff: SystemTime) -> std::io::Result<Swept> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_file() {
        return Ok(Swept::NotAFile);
    }
    if newest_use(&meta) < cutoff {
        std::fs::remove_file(path)?;
        return Ok(Swept::Deleted);
    }
    Ok(Swept::Kept)
}

/// The most recent of atime, mtime and creation time, for platforms that
/// track each. Falls back to `UNIX_EPOCH` when none are reported.
fn newest_use(meta: &std::fs::Metadata) -> SystemTime {
    [meta.accessed(), meta.modified(), meta.created()]
        .into_iter()
        .filter_map(|t| t.ok())
        .max()
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Marks a cache entry as recently used. Best-effort; a failed touch only
/// accelerates eviction.
fn touch(path: &Path) {
    let result = std::fs::File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(SystemTime::now()));
    if let Err(e) = result {
        tracing::debug!(path = %path.display(), error = %e, "failed to touch player file");
    }
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

async fn count_entries(dir: &Path) -> std::io::Result<usize> {
    let mut count = 0usize;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.metadata().await.map(|m| m.is_file()).unwrap_or(false) {
            count += 1;
        }
    }
    Ok(count)
}

/// Waits for the leader's published outcome. `Err` covers both a reported
/// failure and a leader that vanished without publishing.
async fn await_flight(mut rx: watch::Receiver<Option<FetchOutcome>>) -> Result<(), ()> {
    loop {
        let outcome = rx.borrow_and_update().clone();
        if let Some(outcome) = outcome {
            return outcome.map_err(|_| ());
        }
        if rx.changed().await.is_err() {
            return Err(());
        }
    }
}
