//! Solver orchestration: file cache → LRU tiers → worker pool.
//!
//! For a given player URL this produces the runnable solver pair, walking
//! the cache tiers cheapest-first. Preprocessing is not single-flighted:
//! the pool bounds parallelism and a duplicate insert into an LRU is
//! idempotent, so concurrent misses for the same player are tolerated.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

use ytcipher_common::player_url::player_id_label;
use ytcipher_common::CipherError;

use crate::cache::MeteredCache;
use crate::player_cache::PlayerFileCache;
use crate::pool::WorkerPool;
use crate::runtime::SolverSet;

static STS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:signatureTimestamp|sts):(\d+)").expect("constant regex pattern is valid")
});

/// Capacities for the in-memory cache tiers.
#[derive(Clone, Copy, Debug)]
pub struct CacheSizes {
    pub preprocessed: usize,
    pub solvers: usize,
    pub sts: usize,
}

impl Default for CacheSizes {
    fn default() -> Self {
        Self {
            preprocessed: 150,
            solvers: 50,
            sts: 150,
        }
    }
}

pub struct SolverOrchestrator {
    pool: WorkerPool,
    player_cache: PlayerFileCache,
    preprocessed: MeteredCache<String>,
    solvers: MeteredCache<SolverSet>,
    sts: MeteredCache<String>,
}

impl SolverOrchestrator {
    pub fn new(pool: WorkerPool, player_cache: PlayerFileCache, sizes: CacheSizes) -> Self {
        Self {
            pool,
            player_cache,
            preprocessed: MeteredCache::new("preprocessed", sizes.preprocessed),
            solvers: MeteredCache::new("solvers", sizes.solvers),
            sts: MeteredCache::new("sts", sizes.sts),
        }
    }

    pub fn player_cache(&self) -> &PlayerFileCache {
        &self.player_cache
    }

    /// Produces the solver pair for a normalized player URL, or `None` when
    /// the player defines no solvers at all.
    ///
    /// # Errors
    ///
    /// Fetch failures, pool failures, and prepared-script evaluation
    /// failures all surface here. Pool rejections are also counted into
    /// `worker_errors_total` attributed to the player id.
    pub async fn solvers_for(&self, player_url: &str) -> Result<Option<SolverSet>, CipherError> {
        let path = self.player_cache.player_file_path(player_url).await?;

        if let Some(set) = self.solvers.get(&path) {
            return Ok(Some(set));
        }

        let prepared = match self.preprocessed.get(&path) {
            Some(prepared) => prepared,
            None => {
                let source = tokio::fs::read_to_string(&path).await?;
                let prepared = match self.pool.submit(source).await {
                    Ok(prepared) => prepared,
                    Err(e) => {
                        ytcipher_metrics::record_worker_error(
                            player_id_label(player_url),
                            &e.to_string(),
                        );
                        return Err(e);
                    }
                };
                self.preprocessed.insert(path.clone(), prepared.clone());
                prepared
            }
        };

        match SolverSet::from_prepared(&prepared)? {
            Some(set) => {
                self.solvers.insert(path, set.clone());
                Ok(Some(set))
            }
            None => Ok(None),
        }
    }

    /// Returns the signature timestamp embedded in the player, plus whether
    /// it was served from cache.
    ///
    /// # Errors
    ///
    /// `CipherError::NotFound` when the player contains no timestamp.
    pub async fn sts_for(&self, player_url: &str) -> Result<(String, bool), CipherError> {
        let path = self.player_cache.player_file_path(player_url).await?;

        if let Some(sts) = self.sts.get(&path) {
            return Ok((sts, true));
        }

        let source = tokio::fs::read_to_string(&path).await?;
        let sts = extract_sts(&source).ok_or_else(|| {
            CipherError::NotFound("signature timestamp not found in player".to_string())
        })?;
        self.sts.insert(path, sts.clone());
        Ok((sts, false))
    }

    /// Resolves the on-disk path for a player, downloading on miss.
    pub async fn player_file_path(&self, player_url: &str) -> Result<PathBuf, CipherError> {
        self.player_cache.player_file_path(player_url).await
    }
}

fn extract_sts(source: &str) -> Option<String> {
    STS_RE
        .captures(source)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_sts_long_form() {
        let source = "var a=1;signatureTimestamp:19834,b:2";
        assert_eq!(extract_sts(source).as_deref(), Some("19834"));
    }

    #[test]
    fn test_extract_sts_short_form() {
        assert_eq!(extract_sts("{sts:20001}").as_deref(), Some("20001"));
    }

    #[test]
    fn test_extract_sts_first_match_wins() {
        let source = "sts:111,signatureTimestamp:222";
        assert_eq!(extract_sts(source).as_deref(), Some("111"));
    }

    #[test]
    fn test_extract_sts_missing() {
        assert_eq!(extract_sts("no timestamp here"), None);
        assert_eq!(extract_sts("sts:notdigits"), None);
    }

    #[test]
    fn test_default_cache_sizes() {
        let sizes = CacheSizes::default();
        assert_eq!(sizes.preprocessed, 150);
        assert_eq!(sizes.solvers, 50);
        assert_eq!(sizes.sts, 150);
    }
}
