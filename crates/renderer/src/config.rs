use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use log::{debug, warn};

/// Name of the emulator executable inside `dolphin_dir`
#[cfg(windows)]
pub const DOLPHIN_NAME: &str = "Dolphin.exe";
#[cfg(not(windows))]
pub const DOLPHIN_NAME: &str = "dolphin-emu";

/// How many games to render at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Parallelism {
    /// Explicit worker count
    Fixed(usize),
    /// Keyword form, e.g. `"recommended"`
    Keyword(ParallelKeyword),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelKeyword {
    /// One worker per physical core
    Recommended,
}

impl Parallelism {
    /// Resolve to a concrete worker count (always at least 1)
    pub fn worker_count(&self) -> usize {
        match self {
            Parallelism::Fixed(n) => (*n).max(1),
            Parallelism::Keyword(ParallelKeyword::Recommended) => physical_core_count(),
        }
    }
}

fn physical_core_count() -> usize {
    let system = sysinfo::System::new();
    match system.physical_core_count() {
        Some(n) if n > 0 => n,
        _ => {
            let fallback = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            warn!("Could not determine physical core count, using {} workers", fallback);
            fallback
        }
    }
}

/// Configuration for replay rendering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Path to the game ISO passed to the emulator with `-e`
    pub melee_iso: PathBuf,
    /// Directory containing the emulator executable
    pub dolphin_dir: PathBuf,
    /// Path to the ffmpeg binary
    pub ffmpeg: PathBuf,
    /// Internal resolution tier, e.g. "480p" or "1080p"
    pub resolution: String,
    /// Apply the 16:9 widescreen patch
    pub widescreen: bool,
    /// Frame dump bitrate in kbps
    #[serde(rename = "bitrateKbps")]
    pub bitrate_kbps: u32,
    /// Number of concurrent renders in batch mode
    pub parallel_games: Parallelism,
    /// Skip games shorter than 30 seconds
    pub remove_short: bool,
    /// Concatenate each directory's videos into one file after a batch
    pub combine: bool,
    /// Base emulator user directory; copied for every job, never written to
    pub user_dir: PathBuf,
    /// Where per-job workspaces and control files are created
    pub working_dir: PathBuf,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl RenderConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            melee_iso: PathBuf::from("~/games/melee/SSBM.iso"),
            dolphin_dir: PathBuf::from("~/slippi-dolphin"),
            ffmpeg: PathBuf::from("/usr/bin/ffmpeg"),
            resolution: "480p".to_string(),
            widescreen: false,
            bitrate_kbps: 16000,
            parallel_games: Parallelism::Keyword(ParallelKeyword::Recommended),
            remove_short: false,
            combine: false,
            user_dir: PathBuf::from("User"),
            working_dir: std::env::temp_dir().join("slp2mp4"),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            } else {
                warn!("Config file not found, using defaults: {}", config_path.display());
            }
        }

        config.expand_paths();
        Ok(config)
    }

    /// Full path of the emulator executable
    pub fn dolphin_bin(&self) -> PathBuf {
        self.dolphin_dir.join(DOLPHIN_NAME)
    }

    /// Fail fast if any external path the renderer depends on is missing
    pub fn validate(&self) -> Result<()> {
        check_path("melee_iso", &self.melee_iso)?;
        check_path("dolphin_dir", &self.dolphin_dir)?;
        check_path("dolphin binary", &self.dolphin_bin())?;
        check_path("ffmpeg", &self.ffmpeg)?;
        check_path("user_dir", &self.user_dir)?;
        if crate::workspace::nests_inside(&self.working_dir, &self.user_dir) {
            bail!(
                "working_dir {} must not be inside user_dir {}",
                self.working_dir.display(),
                self.user_dir.display()
            );
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        for path in [
            &mut self.melee_iso,
            &mut self.dolphin_dir,
            &mut self.ffmpeg,
            &mut self.user_dir,
            &mut self.working_dir,
        ] {
            *path = expand_home(path);
        }
    }
}

fn check_path(what: &str, path: &Path) -> Result<()> {
    if !path.exists() {
        bail!("{} does not exist: {}", what, path.display());
    }
    debug!("{} found: {}", what, path.display());
    Ok(())
}

/// Replace a leading `~` with the user's home directory
pub fn expand_home(path: &Path) -> PathBuf {
    let home = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"));
    match (path.strip_prefix("~"), home) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_json_config_with_documented_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{
            "melee_iso": "/isos/melee.iso",
            "dolphin_dir": "/opt/dolphin",
            "ffmpeg": "/usr/local/bin/ffmpeg",
            "resolution": "1080p",
            "widescreen": true,
            "bitrateKbps": 25000,
            "parallel_games": 3,
            "remove_short": true,
            "combine": true
        }"#).unwrap();

        let cfg = RenderConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.melee_iso, PathBuf::from("/isos/melee.iso"));
        assert_eq!(cfg.resolution, "1080p");
        assert!(cfg.widescreen);
        assert_eq!(cfg.bitrate_kbps, 25000);
        assert_eq!(cfg.parallel_games, Parallelism::Fixed(3));
        assert!(cfg.remove_short);
        assert!(cfg.combine);
        // Unspecified fields keep their defaults
        assert_eq!(cfg.user_dir, PathBuf::from("User"));
    }

    #[test]
    fn test_load_toml_config_with_recommended_parallelism() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "resolution = \"720p\"\nparallel_games = \"recommended\"\n").unwrap();

        let cfg = RenderConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.resolution, "720p");
        assert_eq!(cfg.parallel_games, Parallelism::Keyword(ParallelKeyword::Recommended));
        assert!(cfg.parallel_games.worker_count() >= 1);
    }

    #[test]
    fn test_missing_config_file_falls_back_to_defaults() {
        let cfg = RenderConfig::load_config(Some(Path::new("/nonexistent/slp2mp4.json"))).unwrap();
        assert_eq!(cfg.resolution, "480p");
        assert!(!cfg.combine);
    }

    #[test]
    fn test_fixed_parallelism_is_at_least_one() {
        assert_eq!(Parallelism::Fixed(0).worker_count(), 1);
        assert_eq!(Parallelism::Fixed(6).worker_count(), 6);
    }

    #[test]
    fn test_validate_fails_fast_on_missing_paths() {
        let cfg = RenderConfig {
            melee_iso: PathBuf::from("/nonexistent/melee.iso"),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("melee_iso"), "unexpected error: {}", err);
    }

    #[test]
    fn test_validate_accepts_existing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("melee.iso");
        let dolphin_dir = dir.path().join("dolphin");
        let ffmpeg = dir.path().join("ffmpeg");
        let user_dir = dir.path().join("User");
        fs::write(&iso, b"").unwrap();
        fs::create_dir_all(&dolphin_dir).unwrap();
        fs::write(dolphin_dir.join(DOLPHIN_NAME), b"").unwrap();
        fs::write(&ffmpeg, b"").unwrap();
        fs::create_dir_all(&user_dir).unwrap();

        let cfg = RenderConfig {
            melee_iso: iso,
            dolphin_dir,
            ffmpeg,
            user_dir,
            ..Default::default()
        };
        cfg.validate().unwrap();

        // Workspaces copied out of user_dir can't also live in it
        let nested = RenderConfig {
            working_dir: cfg.user_dir.join("work"),
            ..cfg
        };
        let err = nested.validate().unwrap_err();
        assert!(err.to_string().contains("must not be inside user_dir"), "unexpected error: {}", err);
    }

    #[test]
    fn test_expand_home_only_touches_leading_tilde() {
        let plain = PathBuf::from("/abs/path");
        assert_eq!(expand_home(&plain), plain);
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(
                expand_home(Path::new("~/games")),
                PathBuf::from(home).join("games")
            );
        }
    }
}
