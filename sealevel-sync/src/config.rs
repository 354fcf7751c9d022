use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.sealevelsensors.org/v1.0";
const DEFAULT_PAGE_SIZE: u32 = 100;
const DEFAULT_BATCH_SIZE: usize = 1000;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRY_ATTEMPTS: u32 = 5;

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub base_url: String,
    /// Explicit database file; `None` means the per-user data directory.
    pub database_path: Option<PathBuf>,
    pub page_size: u32,
    pub batch_size: usize,
    pub http_timeout: Duration,
    pub retry_attempts: u32,
}

impl SyncConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let base_url =
            std::env::var("SEALEVEL_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let database_path = std::env::var("SEALEVEL_DB_PATH").ok().map(PathBuf::from);
        let page_size =
            read_u64_env("SEALEVEL_PAGE_SIZE", u64::from(DEFAULT_PAGE_SIZE)).max(1) as u32;
        let batch_size =
            read_u64_env("SEALEVEL_BATCH_SIZE", DEFAULT_BATCH_SIZE as u64).max(1) as usize;
        let http_timeout = Duration::from_secs(read_u64_env(
            "SEALEVEL_HTTP_TIMEOUT_SECS",
            DEFAULT_HTTP_TIMEOUT_SECS,
        ));
        let retry_attempts =
            read_u64_env("SEALEVEL_RETRY_ATTEMPTS", u64::from(DEFAULT_RETRY_ATTEMPTS)).max(1)
                as u32;

        Ok(Self {
            base_url,
            database_path,
            page_size,
            batch_size,
            http_timeout,
            retry_attempts,
        })
    }
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
