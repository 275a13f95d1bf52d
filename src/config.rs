use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Upper bound for every TTL in seconds.
const MAX_TTL_SECS: u64 = 365 * 24 * 60 * 60;
/// Upper bound for `credentials.max_token_age_days`.
const MAX_TOKEN_AGE_DAYS: u64 = 10 * 365;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Engine configuration.  Every section is optional; an empty YAML document
/// yields a usable configuration pointed at github.com.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub listing: ListingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub branches: BranchesConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Full URL to the forge API root (e.g. `https://api.github.com`).
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Base URL serving raw file contents by `{owner}/{repo}/{branch}/{path}`.
    #[serde(default = "default_raw_url")]
    pub raw_url: String,
    /// Base URL serving raw gist files by `{user}/{id}/raw/{file}`.
    #[serde(default = "default_gist_raw_url")]
    pub gist_raw_url: String,
    /// `Accept` header sent with API requests.
    #[serde(default = "default_accept")]
    pub accept: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            raw_url: default_raw_url(),
            gist_raw_url: default_gist_raw_url(),
            accept: default_accept(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_raw_url() -> String {
    "https://raw.githubusercontent.com".to_string()
}

fn default_gist_raw_url() -> String {
    "https://gist.githubusercontent.com".to_string()
}

fn default_accept() -> String {
    "application/vnd.github+json".to_string()
}

fn default_user_agent() -> String {
    "reposync/0.1".to_string()
}

// ---------------------------------------------------------------------------
// Listing strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ListingConfig {
    /// Folder enumerated when a branch has no override.
    #[serde(default = "default_listing_path")]
    pub default_path: String,
    /// Per-branch folder overrides.
    #[serde(default = "default_branch_paths")]
    pub branch_paths: HashMap<String, String>,
    /// Concurrent subdirectory requests per recursion level in the contents
    /// walk.
    #[serde(default = "default_contents_batch_size")]
    pub contents_batch_size: usize,
    /// Lifetime (seconds) of a directory listing in the contents-walk cache.
    #[serde(default = "default_dir_cache_ttl")]
    pub dir_cache_ttl_secs: u64,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            default_path: default_listing_path(),
            branch_paths: default_branch_paths(),
            contents_batch_size: default_contents_batch_size(),
            dir_cache_ttl_secs: default_dir_cache_ttl(),
        }
    }
}

impl ListingConfig {
    /// Folder to enumerate for `branch`.
    pub fn path_for_branch(&self, branch: &str) -> &str {
        self.branch_paths
            .get(branch)
            .map(String::as_str)
            .unwrap_or(&self.default_path)
    }

    pub fn dir_cache_ttl_millis(&self) -> i64 {
        secs_to_millis(self.dir_cache_ttl_secs)
    }
}

fn default_listing_path() -> String {
    "prompts".to_string()
}

fn default_branch_paths() -> HashMap<String, String> {
    HashMap::from([("web-captures".to_string(), "webcaptures".to_string())])
}

fn default_contents_batch_size() -> usize {
    3
}

fn default_dir_cache_ttl() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// JSON file used by the `file` backend.
    #[serde(default = "default_cache_path")]
    pub path: String,
    /// Hard ceiling on cached file listings.
    #[serde(default = "default_max_listing_entries")]
    pub max_listing_entries: usize,
    /// Age (seconds) after which a cached listing is served stale and
    /// revalidated in the background.
    #[serde(default = "default_listing_ttl")]
    pub listing_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_cache_path(),
            max_listing_entries: default_max_listing_entries(),
            listing_ttl_secs: default_listing_ttl(),
        }
    }
}

impl CacheConfig {
    pub fn listing_ttl_millis(&self) -> i64 {
        secs_to_millis(self.listing_ttl_secs)
    }
}

fn default_cache_path() -> String {
    ".reposync/cache.json".to_string()
}

fn default_max_listing_entries() -> usize {
    20
}

fn default_listing_ttl() -> u64 {
    15 * 60
}

// ---------------------------------------------------------------------------
// Branch pagination
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BranchesConfig {
    #[serde(default = "default_per_page")]
    pub per_page: usize,
    /// Hard cap on pages requested; `per_page * max_pages` bounds the result.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

impl Default for BranchesConfig {
    fn default() -> Self {
        Self {
            per_page: default_per_page(),
            max_pages: default_max_pages(),
        }
    }
}

fn default_per_page() -> usize {
    100
}

fn default_max_pages() -> usize {
    10
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsConfig {
    /// Store key holding the serialised `{token, timestamp}` record.
    #[serde(default = "default_token_key")]
    pub token_key: String,
    /// Durable JSON file holding the token record for file-backed front ends.
    #[serde(default = "default_credentials_path")]
    pub store_path: String,
    /// Identity provider the signed-in user must have authenticated with.
    #[serde(default = "default_expected_provider")]
    pub expected_provider: String,
    #[serde(default = "default_max_token_age_days")]
    pub max_token_age_days: u64,
    /// Providers of the signed-in identity, for front ends without a live
    /// identity session.  Empty means "nobody is signed in".
    #[serde(default)]
    pub signed_in_providers: Vec<String>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            token_key: default_token_key(),
            store_path: default_credentials_path(),
            expected_provider: default_expected_provider(),
            max_token_age_days: default_max_token_age_days(),
            signed_in_providers: Vec::new(),
        }
    }
}

impl CredentialsConfig {
    pub fn max_token_age_millis(&self) -> i64 {
        secs_to_millis(self.max_token_age_days.saturating_mul(24 * 60 * 60))
    }
}

fn default_token_key() -> String {
    "github_access_token".to_string()
}

fn default_credentials_path() -> String {
    ".reposync/credentials.json".to_string()
}

fn default_expected_provider() -> String {
    "github.com".to_string()
}

fn default_max_token_age_days() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}

/// Parse and validate a [`Config`] from YAML text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents)?
    };
    validate_config(&config)?;
    Ok(config)
}

/// Saturates instead of wrapping; validated configs never get near the limit.
fn secs_to_millis(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX).saturating_mul(1000)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.listing.contents_batch_size > 0,
        "contents_batch_size must be at least 1"
    );
    anyhow::ensure!(
        config.cache.max_listing_entries > 0,
        "max_listing_entries must be at least 1"
    );
    anyhow::ensure!(
        config.branches.per_page > 0 && config.branches.per_page <= 100,
        "branches.per_page must be 1-100"
    );
    anyhow::ensure!(
        config.branches.max_pages > 0,
        "branches.max_pages must be at least 1"
    );
    anyhow::ensure!(
        config.listing.dir_cache_ttl_secs <= MAX_TTL_SECS,
        "listing.dir_cache_ttl_secs must be at most {MAX_TTL_SECS}"
    );
    anyhow::ensure!(
        config.cache.listing_ttl_secs <= MAX_TTL_SECS,
        "cache.listing_ttl_secs must be at most {MAX_TTL_SECS}"
    );
    anyhow::ensure!(
        config.credentials.max_token_age_days <= MAX_TOKEN_AGE_DAYS,
        "credentials.max_token_age_days must be at most {MAX_TOKEN_AGE_DAYS}"
    );
    anyhow::ensure!(
        !config.credentials.token_key.is_empty(),
        "credentials.token_key must not be empty"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.upstream.api_url, "https://api.github.com");
        assert_eq!(config.listing.contents_batch_size, 3);
        assert_eq!(config.cache.max_listing_entries, 20);
        assert_eq!(config.cache.listing_ttl_secs, 900);
        assert_eq!(config.branches.per_page, 100);
        assert_eq!(config.branches.max_pages, 10);
        assert_eq!(config.credentials.max_token_age_days, 60);
        assert_eq!(config.cache.backend, StoreBackend::Memory);
    }

    #[test]
    fn partial_sections_fill_defaults() {
        let yaml = r#"
upstream:
  api_url: http://localhost:9000
cache:
  backend: file
  path: /tmp/cache.json
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.upstream.api_url, "http://localhost:9000");
        assert_eq!(config.upstream.raw_url, "https://raw.githubusercontent.com");
        assert_eq!(config.cache.backend, StoreBackend::File);
        assert_eq!(config.cache.path, "/tmp/cache.json");
        assert_eq!(config.cache.max_listing_entries, 20);
    }

    #[test]
    fn branch_path_override() {
        let config = Config::default();
        assert_eq!(config.listing.path_for_branch("main"), "prompts");
        assert_eq!(config.listing.path_for_branch("web-captures"), "webcaptures");
    }

    #[test]
    fn zero_batch_size_rejected() {
        let err = parse_config("listing:\n  contents_batch_size: 0\n").unwrap_err();
        assert!(err.to_string().contains("contents_batch_size"));
    }

    #[test]
    fn huge_durations_rejected() {
        let err = parse_config("cache:\n  listing_ttl_secs: 18446744073709551615\n").unwrap_err();
        assert!(err.to_string().contains("listing_ttl_secs"));
        let err = parse_config("listing:\n  dir_cache_ttl_secs: 9223372036854775807\n").unwrap_err();
        assert!(err.to_string().contains("dir_cache_ttl_secs"));
        let err = parse_config("credentials:\n  max_token_age_days: 106751991167300\n").unwrap_err();
        assert!(err.to_string().contains("max_token_age_days"));
    }

    #[test]
    fn duration_conversions_saturate() {
        let mut config = Config::default();
        assert_eq!(config.cache.listing_ttl_millis(), 900_000);
        assert_eq!(config.credentials.max_token_age_millis(), 60 * 24 * 60 * 60 * 1000);

        config.cache.listing_ttl_secs = u64::MAX;
        config.credentials.max_token_age_days = u64::MAX;
        assert_eq!(config.cache.listing_ttl_millis(), i64::MAX);
        assert_eq!(config.credentials.max_token_age_millis(), i64::MAX);
    }

    #[test]
    fn oversized_page_rejected() {
        assert!(parse_config("branches:\n  per_page: 500\n").is_err());
    }

    #[test]
    fn load_missing_file_fails_with_path() {
        let err = load_config("/nonexistent/reposync.yaml").unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/reposync.yaml"));
    }
}
