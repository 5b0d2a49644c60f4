use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;

use crate::batch::RecyclePolicy;
use crate::chain::RenderToggles;
use crate::profile::{ProfileOptions, SmartMatch};
use crate::render::loudness::LoudnessTarget;
use crate::render::rolling::DEFAULT_LOG_CAPACITY;
use crate::render::RenderSettings;

/// Application configuration loaded from TOML config file.
/// All fields have sensible defaults, so the config file is optional.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Rendering engine binary (name on PATH or absolute path).
    pub engine_path: PathBuf,
    /// Where rendered files and the manifest go (CLI `--output` wins).
    pub output_dir: Option<PathBuf>,
    pub smart_match: SmartMatch,
    pub room_cleanup: bool,
    pub scene_blend: bool,
    pub noise_guard: bool,
    pub noise_reduction: bool,
    pub breath_control: bool,
    pub soften_harshness: bool,
    pub loudness: LoudnessConfig,
    pub render: RenderConfig,
    pub recycle: RecyclePolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        let toggles = RenderToggles::default();
        Self {
            engine_path: PathBuf::from("ffmpeg"),
            output_dir: None,
            smart_match: SmartMatch::default(),
            room_cleanup: toggles.room_cleanup,
            scene_blend: false,
            noise_guard: true,
            noise_reduction: toggles.noise_reduction,
            breath_control: toggles.breath_control,
            soften_harshness: toggles.soften_harshness,
            loudness: LoudnessConfig::default(),
            render: RenderConfig::default(),
            recycle: RecyclePolicy::default(),
        }
    }
}

/// Optional loudness-normalized variants.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoudnessConfig {
    pub enabled: bool,
    /// Integrated loudness target, LUFS.
    pub integrated: f64,
    pub true_peak: f64,
    pub range: f64,
}

impl Default for LoudnessConfig {
    fn default() -> Self {
        let target = LoudnessTarget::default();
        Self {
            enabled: false,
            integrated: target.integrated,
            true_peak: target.true_peak,
            range: target.range,
        }
    }
}

impl LoudnessConfig {
    pub fn target(&self) -> LoudnessTarget {
        LoudnessTarget {
            integrated: self.integrated,
            true_peak: self.true_peak,
            range: self.range,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Inputs at least this long get a segmented retry.
    pub segment_min_secs: f64,
    pub segment_secs: f64,
    pub sample_rate: u32,
    /// Engine log lines kept for failure summaries.
    pub log_capacity: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        let settings = RenderSettings::default();
        Self {
            segment_min_secs: settings.segment_min_secs,
            segment_secs: settings.segment_secs,
            sample_rate: settings.sample_rate,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/voxlevel/config.toml`.
    /// Returns default config if file doesn't exist.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Load a specific file. Logs a warning and falls back to defaults if it
    /// can't be read or parsed.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<AppConfig>(&contents) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn profile_options(&self) -> ProfileOptions {
        ProfileOptions {
            smart_match: self.smart_match,
            room_cleanup: self.room_cleanup,
            scene_blend: self.scene_blend,
            noise_guard: self.noise_guard,
        }
    }

    pub fn toggles(&self) -> RenderToggles {
        RenderToggles {
            noise_reduction: self.noise_reduction,
            breath_control: self.breath_control,
            soften_harshness: self.soften_harshness,
            room_cleanup: self.room_cleanup,
        }
    }

    pub fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            sample_rate: self.render.sample_rate.max(8_000),
            segment_min_secs: self.render.segment_min_secs,
            segment_secs: self.render.segment_secs,
        }
    }

    /// Get the config file path.
    pub fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            smart_match = "strong"
            scene_blend = true

            [loudness]
            enabled = true

            [recycle]
            every_files = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.smart_match, SmartMatch::Strong);
        assert!(config.scene_blend);
        assert!(config.room_cleanup);
        assert_eq!(config.engine_path, PathBuf::from("ffmpeg"));
        assert!(config.loudness.enabled);
        assert_eq!(config.loudness.target(), LoudnessTarget::default());
        assert_eq!(config.recycle.every_files, 2);
        assert_eq!(config.recycle.min_batch, RecyclePolicy::default().min_batch);
        assert_eq!(config.render.log_capacity, DEFAULT_LOG_CAPACITY);
    }

    #[test]
    fn test_unparseable_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "smart_match = [").unwrap();
        let config = AppConfig::load_from(&path);
        assert_eq!(config.smart_match, SmartMatch::Balanced);

        let missing = AppConfig::load_from(&dir.path().join("nope.toml"));
        assert_eq!(missing.render.sample_rate, 48_000);
    }
}
