//! Engine configuration.
//!
//! Every knob has a default matching the remote side's limits, so
//! `TransferConfig::default()` is a working configuration. Overrides can be
//! loaded from an INI file:
//!
//! ```ini
//! [limits]
//! premium = true
//!
//! [download]
//! resource_limit = 8388608
//! mode = baseline
//!
//! [upload]
//! mode = greedy
//! ordered_dispatch = true
//!
//! [retry]
//! max_attempts = 5
//! cdn_token_refresh_limit = 1
//!
//! [paths]
//! temp_dir = /var/tmp/filexfer
//! files_dir = /srv/files
//! ```

use crate::parts::PartLimits;
use crate::policy::RetryPolicy;
use crate::resource::ResourceMode;
use ini::Ini;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default budget of one download resource manager (4 MiB in flight).
pub const DEFAULT_DOWNLOAD_RESOURCE_LIMIT: i64 = 4 << 20;

/// Default budget of the upload resource manager.
pub const DEFAULT_UPLOAD_RESOURCE_LIMIT: i64 = 4 << 20;

/// Files smaller than this are downloaded through a separate manager.
pub const DEFAULT_SMALL_FILE_THRESHOLD: i64 = 20 << 10;

/// Uploads larger than this use the big-file protocol.
pub const DEFAULT_BIG_FILE_THRESHOLD: i64 = 10 << 20;

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: ini::Error,
    },

    #[error("invalid value '{value}' for [{section}] {key}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },
}

/// Download side settings.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Bytes in flight per download resource manager.
    pub resource_limit: i64,
    pub mode: ResourceMode,
    pub small_file_threshold: i64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            resource_limit: DEFAULT_DOWNLOAD_RESOURCE_LIMIT,
            mode: ResourceMode::Baseline,
            small_file_threshold: DEFAULT_SMALL_FILE_THRESHOLD,
        }
    }
}

/// Upload side settings.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub resource_limit: i64,
    pub mode: ResourceMode,
    /// Forward prepared parts to the transport in part order.
    pub ordered_dispatch: bool,
    pub big_file_threshold: i64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            resource_limit: DEFAULT_UPLOAD_RESOURCE_LIMIT,
            mode: ResourceMode::Greedy,
            ordered_dispatch: false,
            big_file_threshold: DEFAULT_BIG_FILE_THRESHOLD,
        }
    }
}

/// Spacing of consecutive part requests of one loader.
///
/// The first requests of a transfer are spread out while the connection warms up,
/// then the gap shrinks geometrically down to `floor`.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayConfig {
    pub initial: Duration,
    pub decay: f64,
    pub floor: Duration,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            decay: 0.8,
            floor: Duration::from_millis(3),
        }
    }
}

impl DelayConfig {
    /// No spacing at all; used by tests and loopback transfers.
    pub fn none() -> Self {
        Self {
            initial: Duration::ZERO,
            decay: 0.0,
            floor: Duration::ZERO,
        }
    }

    /// Delay following `current`.
    pub fn next(&self, current: Duration) -> Duration {
        current.mul_f64(self.decay).max(self.floor)
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub limits: PartLimits,
    pub download: DownloadConfig,
    pub upload: UploadConfig,
    pub retry: RetryPolicy,
    /// Forced CDN token refreshes allowed per part.
    pub cdn_token_refresh_limit: u32,
    pub delay: DelayConfig,
    /// Close an open file after this long without part activity.
    pub fd_idle_timeout: Duration,
    /// Where partial downloads are written.
    pub temp_dir: PathBuf,
    /// Where finished downloads are published.
    pub files_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        let base = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("filexfer");
        Self {
            limits: PartLimits::regular(),
            download: DownloadConfig::default(),
            upload: UploadConfig::default(),
            retry: RetryPolicy::default(),
            cdn_token_refresh_limit: 1,
            delay: DelayConfig::default(),
            fd_idle_timeout: Duration::from_secs(5),
            temp_dir: base.join("temp"),
            files_dir: base.join("files"),
        }
    }
}

impl TransferConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use privileged account part limits.
    pub fn with_premium(mut self, premium: bool) -> Self {
        self.limits = if premium {
            PartLimits::premium()
        } else {
            PartLimits::regular()
        };
        self
    }

    pub fn with_download_resource_limit(mut self, limit: i64) -> Self {
        self.download.resource_limit = limit;
        self
    }

    pub fn with_upload_resource_limit(mut self, limit: i64) -> Self {
        self.upload.resource_limit = limit;
        self
    }

    pub fn with_download_mode(mut self, mode: ResourceMode) -> Self {
        self.download.mode = mode;
        self
    }

    pub fn with_upload_mode(mut self, mode: ResourceMode) -> Self {
        self.upload.mode = mode;
        self
    }

    pub fn with_ordered_upload_dispatch(mut self, ordered: bool) -> Self {
        self.upload.ordered_dispatch = ordered;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cdn_token_refresh_limit(mut self, limit: u32) -> Self {
        self.cdn_token_refresh_limit = limit;
        self
    }

    pub fn with_delay(mut self, delay: DelayConfig) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_fd_idle_timeout(mut self, timeout: Duration) -> Self {
        self.fd_idle_timeout = timeout;
        self
    }

    pub fn with_temp_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.temp_dir = path.into();
        self
    }

    pub fn with_files_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.files_dir = path.into();
        self
    }

    /// Loads defaults overridden by the INI file at `path`.
    pub fn from_ini_file(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ini(&ini)
    }

    /// Applies overrides from a parsed INI document. Unknown keys are ignored.
    pub fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(premium) = parse::<bool>(ini, "limits", "premium")? {
            config = config.with_premium(premium);
        }

        if let Some(limit) = parse(ini, "download", "resource_limit")? {
            config.download.resource_limit = limit;
        }
        if let Some(mode) = parse(ini, "download", "mode")? {
            config.download.mode = mode;
        }
        if let Some(threshold) = parse(ini, "download", "small_file_threshold")? {
            config.download.small_file_threshold = threshold;
        }

        if let Some(limit) = parse(ini, "upload", "resource_limit")? {
            config.upload.resource_limit = limit;
        }
        if let Some(mode) = parse(ini, "upload", "mode")? {
            config.upload.mode = mode;
        }
        if let Some(ordered) = parse(ini, "upload", "ordered_dispatch")? {
            config.upload.ordered_dispatch = ordered;
        }

        if let Some(max_attempts) = parse::<u32>(ini, "retry", "max_attempts")? {
            config.retry = RetryPolicy::exponential(max_attempts.max(1));
        }
        if let Some(limit) = parse(ini, "retry", "cdn_token_refresh_limit")? {
            config.cdn_token_refresh_limit = limit;
        }

        if let Some(secs) = parse::<u64>(ini, "download", "fd_idle_timeout_secs")? {
            config.fd_idle_timeout = Duration::from_secs(secs);
        }
        if let Some(dir) = get(ini, "paths", "temp_dir") {
            config.temp_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get(ini, "paths", "files_dir") {
            config.files_dir = PathBuf::from(dir);
        }

        Ok(config)
    }
}

fn get<'a>(ini: &'a Ini, section: &str, key: &str) -> Option<&'a str> {
    ini.section(Some(section))
        .and_then(|props| props.get(key))
        .map(str::trim)
}

fn parse<T: FromStr>(ini: &Ini, section: &str, key: &str) -> Result<Option<T>, ConfigError> {
    match get(ini, section, key) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                section: section.to_string(),
                key: key.to_string(),
                value: value.to_string(),
            }),
    }
}
