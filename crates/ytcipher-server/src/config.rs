//! Environment-derived service configuration.
//!
//! Everything is read once at startup into an immutable `Config`; invalid
//! values fall back to defaults with a warning rather than failing the
//! process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use ytcipher_common::player_url::KeyMode;

use crate::orchestrator::CacheSizes;
use crate::pool::PoolConfig;

const DEFAULT_PORT: u16 = 8001;
const DEFAULT_HOST: &str = "0.0.0.0";

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Empty or unset disables authentication.
    pub api_token: Option<String>,
    pub max_threads: usize,
    pub messages_limit: u32,
    pub preprocessed_cache_size: usize,
    pub solver_cache_size: usize,
    pub sts_cache_size: usize,
    pub ignore_script_region: bool,
    /// Override for the embedded preprocessor bundle.
    pub preprocessor_path: Option<PathBuf>,
    pub cache_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            host: env_var("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse_or("PORT", env_var("PORT"), DEFAULT_PORT),
            api_token: env_var("API_TOKEN").filter(|t| !t.is_empty()),
            max_threads: parse_or("MAX_THREADS", env_var("MAX_THREADS"), default_threads())
                .max(1),
            messages_limit: parse_or("MESSAGES_LIMIT", env_var("MESSAGES_LIMIT"), 10_000).max(1),
            preprocessed_cache_size: parse_or(
                "PREPROCESSED_CACHE_SIZE",
                env_var("PREPROCESSED_CACHE_SIZE"),
                150,
            ),
            solver_cache_size: parse_or("SOLVER_CACHE_SIZE", env_var("SOLVER_CACHE_SIZE"), 50),
            sts_cache_size: parse_or("STS_CACHE_SIZE", env_var("STS_CACHE_SIZE"), 150),
            ignore_script_region: flag(env_var("IGNORE_SCRIPT_REGION").as_deref()),
            preprocessor_path: env_var("PREPROCESSOR_PATH").map(PathBuf::from),
            cache_dir: default_cache_dir(),
        }
    }

    pub fn key_mode(&self) -> KeyMode {
        if self.ignore_script_region {
            KeyMode::RegionIgnoring
        } else {
            KeyMode::RegionAware
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            concurrency: self.max_threads,
            messages_limit: self.messages_limit,
            ..PoolConfig::default()
        }
    }

    pub fn cache_sizes(&self) -> CacheSizes {
        CacheSizes {
            preprocessed: self.preprocessed_cache_size,
            solvers: self.solver_cache_size,
            sts: self.sts_cache_size,
        }
    }

    /// The socket address to bind, bracketing bare IPv6 hosts as needed so
    /// `[::]` and `::` both work for dual-stack binds.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!("{host}:{}", self.port).parse()
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn default_threads() -> usize {
    num_cpus::get().max(1)
}

/// Platform cache prefix, `{prefix}/yt-cipher/player_cache/`. Falls back to
/// the system temp dir when no cache dir is resolvable.
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("yt-cipher")
        .join("player_cache")
}

fn parse_or<T: FromStr + Copy>(name: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "invalid value; using default");
                default
            }
        },
    }
}

fn flag(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}
