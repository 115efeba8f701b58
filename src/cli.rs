//! Command-line arguments.
//!
//! Flags override the environment-derived configuration. Without `--daemon`
//! the binary runs one cache maintenance command and exits.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::{mib, Platform, PlayerConfig};

/// Platform selection on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum PlatformArg {
    /// Detect from the host
    #[default]
    Auto,
    /// Gapless playback with crossfades
    Desktop,
    /// Sequential element-style playback
    Mobile,
}

impl From<PlatformArg> for Platform {
    fn from(arg: PlatformArg) -> Self {
        match arg {
            PlatformArg::Auto => Platform::Auto,
            PlatformArg::Desktop => Platform::Desktop,
            PlatformArg::Mobile => Platform::Mobile,
        }
    }
}

/// beatstream-daemon: cached, gapless beat playback
#[derive(Parser, Debug)]
#[command(name = "beatstream-daemon")]
#[command(about = "Audio cache and gapless playback daemon for streamed beats")]
#[command(version)]
pub struct Cli {
    /// Run in daemon mode (JSON-RPC over stdio)
    #[arg(long)]
    pub daemon: bool,

    /// Print cache statistics and exit
    #[arg(long)]
    pub stats: bool,

    /// Remove expired cache entries and exit
    #[arg(long)]
    pub sweep: bool,

    /// Directory of the persistent blob cache
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Base URL of the beats API
    #[arg(long)]
    pub api_url: Option<String>,

    /// Playback platform
    #[arg(long, value_enum)]
    pub platform: Option<PlatformArg>,

    /// Memory tier budget in MiB
    #[arg(long)]
    pub memory_budget_mb: Option<u64>,

    /// Persistent tier budget in MiB
    #[arg(long)]
    pub persistent_budget_mb: Option<u64>,

    /// Disable the in-memory blob tier
    #[arg(long)]
    pub no_memory_cache: bool,

    /// Crossfade length in seconds (0-12)
    #[arg(long, value_parser = parse_crossfade)]
    pub crossfade: Option<f32>,

    /// Number of upcoming beats to preload
    #[arg(long)]
    pub preload_count: Option<usize>,
}

fn parse_crossfade(s: &str) -> Result<f32, String> {
    let secs: f32 = s.parse().map_err(|e| format!("{}", e))?;
    if (0.0..=12.0).contains(&secs) {
        Ok(secs)
    } else {
        Err(format!("crossfade must be between 0 and 12 seconds, got {}", secs))
    }
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Returns true if running in daemon mode.
    pub fn is_daemon_mode(&self) -> bool {
        self.daemon
    }

    /// Returns true if a one-shot maintenance command was requested.
    pub fn is_cli_mode(&self) -> bool {
        !self.daemon && (self.stats || self.sweep)
    }

    /// Applies flags on top of `config`.
    pub fn apply(&self, config: &mut PlayerConfig) {
        if let Some(ref dir) = self.cache_dir {
            config.cache_path = Some(dir.clone());
        }
        if let Some(ref url) = self.api_url {
            config.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(platform) = self.platform {
            config.platform = platform.into();
        }
        if let Some(mb) = self.memory_budget_mb {
            config.memory_budget_bytes = mib(mb);
        }
        if let Some(mb) = self.persistent_budget_mb {
            config.persistent_budget_bytes = mib(mb);
        }
        if self.no_memory_cache {
            config.memory_cache = Some(false);
        }
        if let Some(secs) = self.crossfade {
            config.crossfade_sec = secs;
        }
        if let Some(count) = self.preload_count {
            config.preload_count = count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let argv = std::iter::once("beatstream-daemon").chain(args.iter().copied());
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn mode_detection() {
        let daemon = parse(&["--daemon"]);
        assert!(daemon.is_daemon_mode());
        assert!(!daemon.is_cli_mode());

        let stats = parse(&["--stats"]);
        assert!(stats.is_cli_mode());
        assert!(!stats.is_daemon_mode());

        assert!(!parse(&[]).is_cli_mode());
    }

    #[test]
    fn flags_override_config() {
        let cli = parse(&[
            "--cache-dir",
            "/tmp/beats",
            "--api-url",
            "http://api.test/",
            "--platform",
            "mobile",
            "--memory-budget-mb",
            "8",
            "--no-memory-cache",
            "--crossfade",
            "3.5",
            "--preload-count",
            "1",
        ]);
        let mut config = PlayerConfig::default();
        cli.apply(&mut config);

        assert_eq!(config.cache_path, Some(PathBuf::from("/tmp/beats")));
        assert_eq!(config.api_base_url, "http://api.test");
        assert_eq!(config.platform, Platform::Mobile);
        assert_eq!(config.memory_budget_bytes, 8 * crate::config::MIB);
        assert_eq!(config.memory_cache, Some(false));
        assert_eq!(config.crossfade_sec, 3.5);
        assert_eq!(config.preload_count, 1);
    }

    #[test]
    fn unset_flags_keep_config() {
        let mut config = PlayerConfig::default();
        let before = config.clone();
        parse(&[]).apply(&mut config);
        assert_eq!(config.persistent_budget_bytes, before.persistent_budget_bytes);
        assert_eq!(config.platform, before.platform);
    }

    #[test]
    fn huge_budgets_saturate() {
        let cli = parse(&["--persistent-budget-mb", "18446744073709551615"]);
        let mut config = PlayerConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.persistent_budget_bytes, u64::MAX);
    }

    #[test]
    fn crossfade_is_bounded() {
        let result = Cli::try_parse_from(["beatstream-daemon", "--crossfade", "20"]);
        assert!(result.is_err());
    }
}
