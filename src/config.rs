//! Player configuration module.
//!
//! Contains the runtime configuration for the beatstream daemon: cache
//! budgets, preload policy, crossfade timing, platform selection and the
//! location of the backend API.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Bytes in a mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Converts mebibytes to bytes, saturating on overflow.
pub fn mib(mb: u64) -> u64 {
    mb.saturating_mul(MIB)
}

/// Platform the player runs on.
///
/// Decides which playback backend is selected and which preload and
/// interaction thresholds apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Detect from the host environment.
    #[default]
    Auto,

    /// Desktop-class host: gapless engine, late preload, short gesture window.
    Desktop,

    /// Constrained mobile host (iOS Safari / PWA class): element backend,
    /// early preload, long gesture window.
    Mobile,
}

impl Platform {
    /// Returns the string representation of the platform.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Auto => "auto",
            Platform::Desktop => "desktop",
            Platform::Mobile => "mobile",
        }
    }

    /// Parses a platform from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(Platform::Auto),
            "desktop" => Some(Platform::Desktop),
            "mobile" | "ios" | "safari" => Some(Platform::Mobile),
            _ => None,
        }
    }

    /// Resolves `Auto` to a concrete platform.
    pub fn resolve(self) -> Platform {
        match self {
            Platform::Auto => {
                if cfg!(any(target_os = "ios", target_os = "android")) {
                    Platform::Mobile
                } else {
                    Platform::Desktop
                }
            }
            other => other,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runtime configuration for the player.
///
/// Loaded from defaults, then environment variables, then CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Byte budget of the in-memory blob tier.
    pub memory_budget_bytes: u64,

    /// Byte budget of the persistent blob tier.
    pub persistent_budget_bytes: u64,

    /// Entries not accessed for this long are removed by the expiry sweep.
    pub max_age_secs: u64,

    /// Directory of the persistent blob tier.
    /// If None, uses the platform-specific default cache location.
    pub cache_path: Option<PathBuf>,

    /// Base URL of the beats API (signed URL provider).
    pub api_base_url: String,

    /// Platform selection.
    pub platform: Platform,

    /// Force the memory tier on or off. None lets capability detection decide.
    pub memory_cache: Option<bool>,

    /// Number of upcoming playlist entries to preload.
    pub preload_count: usize,

    /// Maximum concurrent downloads in a preload batch.
    pub preload_concurrency: usize,

    /// Retries for a transient preload failure inside a batch.
    pub preload_retries: u32,

    /// Crossfade length in seconds for gapless transitions.
    pub crossfade_sec: f32,

    /// Playback fraction at which the next track is preloaded (desktop).
    pub desktop_preload_threshold: f32,

    /// Playback fraction at which the next track is preloaded (mobile).
    pub mobile_preload_threshold: f32,

    /// Seconds a user gesture keeps `play()` allowed (desktop).
    pub desktop_interaction_window_secs: u64,

    /// Seconds a user gesture keeps `play()` allowed (mobile).
    pub mobile_interaction_window_secs: u64,

    /// Milliseconds a load may stall before the URL is probed.
    pub stall_timeout_ms: u64,

    /// Seconds a failed URL is not refetched.
    pub failure_cooldown_secs: u64,

    /// Seconds a signed URL is reused before it is fetched again.
    pub signed_url_ttl_secs: u64,

    /// Output sample rate of the audio graph.
    pub sample_rate: u32,

    /// Output channel count of the audio graph.
    pub channels: u16,
}

impl PlayerConfig {
    /// Creates a new PlayerConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a PlayerConfig from environment variables.
    ///
    /// Reads the following environment variables:
    /// - `BEATSTREAM_MEMORY_BUDGET_MB` - Memory tier budget in MiB
    /// - `BEATSTREAM_PERSISTENT_BUDGET_MB` - Persistent tier budget in MiB
    /// - `BEATSTREAM_MAX_AGE_DAYS` - Expiry age in days
    /// - `BEATSTREAM_CACHE_PATH` - Persistent tier directory
    /// - `BEATSTREAM_API_URL` - Beats API base URL
    /// - `BEATSTREAM_PLATFORM` - Platform (auto, desktop, mobile)
    /// - `BEATSTREAM_MEMORY_CACHE` - Force memory tier (true/false)
    /// - `BEATSTREAM_PRELOAD_COUNT` - Upcoming tracks to preload
    /// - `BEATSTREAM_PRELOAD_CONCURRENCY` - Concurrent preload downloads
    /// - `BEATSTREAM_CROSSFADE_SEC` - Crossfade length in seconds
    ///
    /// Falls back to defaults for unset or invalid variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(mb) = env_parse::<u64>("BEATSTREAM_MEMORY_BUDGET_MB") {
            config.memory_budget_bytes = mib(mb);
        }

        if let Some(mb) = env_parse::<u64>("BEATSTREAM_PERSISTENT_BUDGET_MB") {
            config.persistent_budget_bytes = mib(mb);
        }

        if let Some(days) = env_parse::<u64>("BEATSTREAM_MAX_AGE_DAYS") {
            if days > 0 {
                config.max_age_secs = days.saturating_mul(24 * 60 * 60);
            }
        }

        if let Ok(path) = std::env::var("BEATSTREAM_CACHE_PATH") {
            config.cache_path = Some(PathBuf::from(path));
        }

        if let Ok(url) = std::env::var("BEATSTREAM_API_URL") {
            config.api_base_url = url.trim_end_matches('/').to_string();
        }

        if let Ok(platform_str) = std::env::var("BEATSTREAM_PLATFORM") {
            if let Some(platform) = Platform::parse(&platform_str) {
                config.platform = platform;
            }
        }

        if let Some(enabled) = env_parse::<bool>("BEATSTREAM_MEMORY_CACHE") {
            config.memory_cache = Some(enabled);
        }

        if let Some(count) = env_parse::<usize>("BEATSTREAM_PRELOAD_COUNT") {
            config.preload_count = count;
        }

        if let Some(workers) = env_parse::<usize>("BEATSTREAM_PRELOAD_CONCURRENCY") {
            if workers > 0 {
                config.preload_concurrency = workers;
            }
        }

        if let Some(secs) = env_parse::<f32>("BEATSTREAM_CROSSFADE_SEC") {
            if (0.0..=12.0).contains(&secs) {
                config.crossfade_sec = secs;
            }
        }

        config
    }

    /// Returns the effective cache path, using platform defaults if not specified.
    pub fn effective_cache_path(&self) -> PathBuf {
        if let Some(ref path) = self.cache_path {
            path.clone()
        } else {
            default_cache_path()
        }
    }

    /// Max age of a persistent entry before the sweep removes it.
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    /// Crossfade length as a Duration.
    pub fn crossfade(&self) -> Duration {
        Duration::from_secs_f32(self.crossfade_sec)
    }

    /// Stall timeout as a Duration.
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    /// Failure cool-down as a Duration.
    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.failure_cooldown_secs)
    }

    /// Signed URL reuse window as a Duration.
    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.signed_url_ttl_secs)
    }

    /// Preload threshold fraction for a resolved platform.
    pub fn preload_threshold(&self, platform: Platform) -> f32 {
        match platform.resolve() {
            Platform::Mobile => self.mobile_preload_threshold,
            _ => self.desktop_preload_threshold,
        }
    }

    /// User-gesture window for a resolved platform.
    pub fn interaction_window(&self, platform: Platform) -> Duration {
        match platform.resolve() {
            Platform::Mobile => Duration::from_secs(self.mobile_interaction_window_secs),
            _ => Duration::from_secs(self.desktop_interaction_window_secs),
        }
    }

    /// Validates the configuration.
    ///
    /// Returns an error message if validation fails, None otherwise.
    pub fn validate(&self) -> Option<String> {
        if self.memory_budget_bytes == 0 && self.memory_cache == Some(true) {
            return Some("memory budget must be > 0 when the memory cache is forced on".to_string());
        }

        if self.persistent_budget_bytes == 0 {
            return Some("persistent budget must be > 0".to_string());
        }

        if self.preload_concurrency == 0 {
            return Some("preload concurrency must be > 0".to_string());
        }

        for (name, value) in [
            ("desktop preload threshold", self.desktop_preload_threshold),
            ("mobile preload threshold", self.mobile_preload_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Some(format!("{} must be between 0 and 1, got {}", name, value));
            }
        }

        if self.crossfade_sec < 0.0 {
            return Some(format!("crossfade must be >= 0, got {}", self.crossfade_sec));
        }

        if self.sample_rate == 0 || self.channels == 0 {
            return Some("sample rate and channels must be > 0".to_string());
        }

        None
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 50 * MIB,
            persistent_budget_bytes: 200 * MIB,
            max_age_secs: 7 * 24 * 60 * 60,
            cache_path: None,
            api_base_url: "http://localhost:5000/api".to_string(),
            platform: Platform::Auto,
            memory_cache: None,
            preload_count: 3,
            preload_concurrency: 2,
            preload_retries: 2,
            crossfade_sec: 2.0,
            desktop_preload_threshold: 0.85,
            mobile_preload_threshold: 0.5,
            desktop_interaction_window_secs: 5,
            mobile_interaction_window_secs: 30,
            stall_timeout_ms: 4000,
            failure_cooldown_secs: 30,
            signed_url_ttl_secs: 50 * 60,
            sample_rate: 48000,
            channels: 2,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

/// Returns the platform-specific default cache storage path.
///
/// Uses the `directories` crate to find appropriate locations:
/// - macOS: ~/Library/Caches/beatstream/audio
/// - Linux: ~/.cache/beatstream/audio
/// - Windows: C:\Users\<user>\AppData\Local\beatstream\cache\audio
fn default_cache_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "beatstream") {
        proj_dirs.cache_dir().join("audio")
    } else {
        PathBuf::from("./audio-cache")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_parsing() {
        assert_eq!(Platform::parse("auto"), Some(Platform::Auto));
        assert_eq!(Platform::parse("Desktop"), Some(Platform::Desktop));
        assert_eq!(Platform::parse("mobile"), Some(Platform::Mobile));
        assert_eq!(Platform::parse("safari"), Some(Platform::Mobile));
        assert_eq!(Platform::parse("toaster"), None);
    }

    #[test]
    fn platform_resolve_is_concrete() {
        assert_ne!(Platform::Auto.resolve(), Platform::Auto);
        assert_eq!(Platform::Mobile.resolve(), Platform::Mobile);
    }

    #[test]
    fn defaults_match_budgets() {
        let config = PlayerConfig::new();
        assert_eq!(config.memory_budget_bytes, 50 * 1024 * 1024);
        assert_eq!(config.persistent_budget_bytes, 200 * 1024 * 1024);
        assert_eq!(config.max_age(), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.failure_cooldown(), Duration::from_secs(30));
    }

    #[test]
    fn mib_saturates() {
        assert_eq!(mib(2), 2 * MIB);
        assert_eq!(mib(u64::MAX), u64::MAX);
    }

    #[test]
    fn thresholds_per_platform() {
        let config = PlayerConfig::new();
        assert_eq!(config.preload_threshold(Platform::Desktop), 0.85);
        assert_eq!(config.preload_threshold(Platform::Mobile), 0.5);
        assert_eq!(
            config.interaction_window(Platform::Mobile),
            Duration::from_secs(30)
        );
        assert_eq!(
            config.interaction_window(Platform::Desktop),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn config_validation() {
        let mut config = PlayerConfig::new();
        assert!(config.validate().is_none());

        config.preload_concurrency = 0;
        assert!(config.validate().is_some());

        config.preload_concurrency = 2;
        config.mobile_preload_threshold = 1.5;
        assert!(config.validate().is_some());
    }

    #[test]
    fn effective_cache_path_non_empty() {
        let config = PlayerConfig::new();
        assert!(!config.effective_cache_path().as_os_str().is_empty());
    }
}
