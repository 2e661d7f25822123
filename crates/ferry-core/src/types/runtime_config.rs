//! Runtime configuration types for migration parameters
//!
//! These types define every option that controls a migration run: archive
//! splitting, local workspace layout, disk headroom, worker counts, retry
//! policies, verification sampling and the remote destination prefix.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One gibibyte in bytes
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Complete runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FerryConfig {
    /// Archive construction and splitting
    #[serde(default)]
    pub archive: ArchiveSettings,

    /// Local scratch and state locations
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Free-space guard settings
    #[serde(default)]
    pub space: SpaceConfig,

    /// Worker pool sizes
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// Retry policy configurations
    #[serde(default)]
    pub retry_policies: RetryPoliciesConfig,

    /// Verification sampling
    #[serde(default)]
    pub verification: VerificationConfig,

    /// Remote destination layout
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Directory-backed store roots used by the CLI
    #[serde(default)]
    pub stores: StoresConfig,
}

/// Archive construction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ArchiveSettings {
    /// Maximum size of one archive part in bytes
    #[serde(default = "default_split_threshold")]
    pub split_threshold_bytes: u64,

    /// Container and compression format
    #[serde(default)]
    pub compression: CompressionFormat,

    /// Compression level, interpreted per format
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            split_threshold_bytes: default_split_threshold(),
            compression: CompressionFormat::default(),
            compression_level: default_compression_level(),
        }
    }
}

fn default_split_threshold() -> u64 {
    10 * GIB
}
fn default_compression_level() -> u32 {
    6
}

/// Archive container and compression format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionFormat {
    /// tar + gzip (default)
    #[default]
    TarGz,

    /// tar + zstd
    TarZst,

    /// Uncompressed tar, for data that is already compressed
    Tar,

    /// Zip with per-entry deflate
    Zip,
}

impl CompressionFormat {
    /// File extension used for the archive name
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionFormat::TarGz => "tar.gz",
            CompressionFormat::TarZst => "tar.zst",
            CompressionFormat::Tar => "tar",
            CompressionFormat::Zip => "zip",
        }
    }

    /// Whether the container is a tar stream
    pub fn is_tar(&self) -> bool {
        !matches!(self, CompressionFormat::Zip)
    }

    /// Inclusive range of valid compression levels
    pub fn level_range(&self) -> (u32, u32) {
        match self {
            CompressionFormat::TarGz => (1, 9),
            CompressionFormat::TarZst => (1, 21),
            CompressionFormat::Tar => (0, 0),
            CompressionFormat::Zip => (1, 9),
        }
    }
}

impl fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Local workspace locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkspaceConfig {
    /// Scratch space for downloads, parts and extraction
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: Utf8PathBuf,

    /// Durable progress document
    #[serde(default = "default_progress_file")]
    pub progress_file: Utf8PathBuf,

    /// Verification reports and deletion logs
    #[serde(default = "default_reports_dir")]
    pub reports_dir: Utf8PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            progress_file: default_progress_file(),
            reports_dir: default_reports_dir(),
        }
    }
}

fn default_scratch_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("./scratch")
}
fn default_progress_file() -> Utf8PathBuf {
    Utf8PathBuf::from("./state/migration_progress.json")
}
fn default_reports_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("./state/reports")
}

/// Free-space guard settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SpaceConfig {
    /// Required free bytes as a multiple of the unit's size
    #[serde(default = "default_space_multiplier")]
    pub multiplier: f64,

    /// Age after which a passed check must be repeated
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            multiplier: default_space_multiplier(),
            stale_after_secs: default_stale_after(),
        }
    }
}

fn default_space_multiplier() -> f64 {
    2.0
}
fn default_stale_after() -> u64 {
    300 // 5 minutes
}

/// Worker pool sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConcurrencyConfig {
    /// Units migrated concurrently
    #[serde(default = "default_unit_workers")]
    pub unit_workers: usize,

    /// Objects downloaded concurrently within one unit
    #[serde(default = "default_download_workers")]
    pub download_workers: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            unit_workers: default_unit_workers(),
            download_workers: default_download_workers(),
        }
    }
}

fn default_unit_workers() -> usize {
    2
}
fn default_download_workers() -> usize {
    8
}

/// Retry policy configurations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryPoliciesConfig {
    /// Default retry policy
    #[serde(default)]
    pub default: RetryPolicy,

    /// Per-operation retry policies (list, download, upload, delete)
    #[serde(default)]
    pub operations: HashMap<String, RetryPolicy>,
}

impl Default for RetryPoliciesConfig {
    fn default() -> Self {
        let mut operations = HashMap::new();

        // Archive parts are large; give uploads more headroom between attempts
        operations.insert(
            "upload".to_string(),
            RetryPolicy {
                max_attempts: 5,
                strategy: RetryStrategy::ExponentialBackoff,
                backoff_multiplier: 2.0,
                initial_delay_ms: 2000,
                max_delay_ms: 60000,
            },
        );

        Self {
            default: RetryPolicy::default(),
            operations,
        }
    }
}

impl RetryPoliciesConfig {
    /// Policy for a named remote operation, falling back to the default
    pub fn policy_for(&self, operation: &str) -> &RetryPolicy {
        self.operations.get(operation).unwrap_or(&self.default)
    }

    /// Override the attempt cap on every policy
    pub fn set_max_attempts(&mut self, max_attempts: u32) {
        self.default.max_attempts = max_attempts;
        for policy in self.operations.values_mut() {
            policy.max_attempts = max_attempts;
        }
    }
}

/// Retry policy for an operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Retry strategy
    #[serde(default)]
    pub strategy: RetryStrategy,

    /// Backoff multiplier for exponential strategies
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Initial delay in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            strategy: RetryStrategy::default(),
            backoff_multiplier: default_backoff_multiplier(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}

/// Retry strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RetryStrategy {
    /// No delay between attempts
    None,

    /// Fixed delay between retries
    FixedDelay,

    /// Exponential backoff (default)
    #[default]
    ExponentialBackoff,

    /// Linear backoff
    LinearBackoff,
}

/// Verification sampling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VerificationConfig {
    /// Units verified per run
    #[serde(default = "default_unit_sample_size")]
    pub unit_sample_size: usize,

    /// Files verified per unit
    #[serde(default = "default_file_sample_size")]
    pub file_sample_size: usize,

    /// How items are picked inside a stratum
    #[serde(default)]
    pub selection: SelectionMode,

    /// Seed for random selection
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            unit_sample_size: default_unit_sample_size(),
            file_sample_size: default_file_sample_size(),
            selection: SelectionMode::default(),
            seed: None,
        }
    }
}

fn default_unit_sample_size() -> usize {
    5
}
fn default_file_sample_size() -> usize {
    50
}

/// Selection inside a sampling stratum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionMode {
    /// Evenly spaced picks over the size-ordered stratum (reproducible)
    #[default]
    Stride,

    /// Uniform random picks
    Random,
}

/// Remote destination layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RemoteConfig {
    /// Prefix under which one folder per unit is created
    #[serde(default = "default_remote_root")]
    pub root: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            root: default_remote_root(),
        }
    }
}

fn default_remote_root() -> String {
    "/ferry-migration".to_string()
}

/// Directory-backed store roots
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoresConfig {
    /// Directory whose subdirectories are source units
    #[serde(default)]
    pub source_dir: Option<Utf8PathBuf>,

    /// Directory that receives the remote layout
    #[serde(default)]
    pub remote_dir: Option<Utf8PathBuf>,
}
