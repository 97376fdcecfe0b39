//! Settings for the external tracker installation and the climate data tools.
//!
//! Configuration is layered with [`figment`]: built-in defaults first, then an optional
//! TOML file, then environment variables prefixed with `TRACK_RS_` (e.g.
//! `TRACK_RS_CHUNK_SIZE=62`). A minimal TOML file might look like:
//!
//! ```toml
//! track_dir = "/opt/track-1.5.2"
//! cdo = "/usr/local/bin/cdo"
//! ```
//!
//! The chunk size and the truncation threshold are limits built into the tracker, not
//! tuning knobs; they are exposed only so that a rebuilt tracker with different limits
//! can be driven without recompiling.
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::utils;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not load the configuration: {0}")]
    Load(String),
    #[error("Configuration value '{field}' is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("Could not locate the tracker installation: {0}")]
    TrackDir(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackConfig {
    /// Root of the tracker installation. If not given, `TRACK_DIR` or
    /// `$HOME/track-master` is used.
    #[serde(default)]
    pub track_dir: Option<PathBuf>,

    /// The tracker executable, relative to `track_dir`.
    #[serde(default = "default_tracker_exe")]
    pub tracker_exe: PathBuf,

    /// The tracker's chunked batch driver script, relative to `track_dir`.
    #[serde(default = "default_master_script")]
    pub master_script: PathBuf,

    #[serde(default = "default_count_utility")]
    pub count_utility: PathBuf,

    #[serde(default = "default_combine_utility")]
    pub combine_utility: PathBuf,

    #[serde(default = "default_tr2nc_utility")]
    pub tr2nc_utility: PathBuf,

    /// Number of time steps the tracker processes per chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Pressure fields with at least this many latitude rows are filtered at T63, others at T42.
    #[serde(default = "default_truncation_threshold")]
    pub truncation_threshold_rows: usize,

    /// Pressure level (Pa) at which vorticity is computed from the wind components.
    #[serde(default = "default_vorticity_level")]
    pub vorticity_level_pa: u32,

    /// Time step in hours assumed for climate model output.
    #[serde(default = "default_model_step_hours")]
    pub model_step_hours: i64,

    #[serde(default = "default_cdo")]
    pub cdo: String,
    #[serde(default = "default_ncks")]
    pub ncks: String,
    #[serde(default = "default_ncatted")]
    pub ncatted: String,
    #[serde(default = "default_ncdump")]
    pub ncdump: String,

    /// Statistics control-file template, under the tracker's `indat` directory.
    #[serde(default = "default_stats_template")]
    pub stats_template: String,

    /// Field-attachment control-file template, under `track_dir`.
    #[serde(default = "default_add_field_template")]
    pub add_field_template: String,

    /// Where `setup` finds the templates to install into the tracker directory.
    #[serde(default)]
    pub templates_dir: Option<PathBuf>,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            track_dir: None,
            tracker_exe: default_tracker_exe(),
            master_script: default_master_script(),
            count_utility: default_count_utility(),
            combine_utility: default_combine_utility(),
            tr2nc_utility: default_tr2nc_utility(),
            chunk_size: default_chunk_size(),
            truncation_threshold_rows: default_truncation_threshold(),
            vorticity_level_pa: default_vorticity_level(),
            model_step_hours: default_model_step_hours(),
            cdo: default_cdo(),
            ncks: default_ncks(),
            ncatted: default_ncatted(),
            ncdump: default_ncdump(),
            stats_template: default_stats_template(),
            add_field_template: default_add_field_template(),
            templates_dir: None,
        }
    }
}

impl TrackConfig {
    /// Load the configuration from the defaults, an optional TOML file, and the environment.
    pub fn load(toml_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(TrackConfig::default()));
        if let Some(p) = toml_file {
            if !p.exists() {
                return Err(ConfigError::Load(format!("configuration file {} does not exist", p.display())));
            }
            figment = figment.merge(Toml::file(p));
        }
        figment = figment.merge(Env::prefixed("TRACK_RS_"));

        let config: TrackConfig = figment.extract().map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from a TOML string, ignoring the environment.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: TrackConfig = Figment::from(Serialized::defaults(TrackConfig::default()))
            .merge(Toml::string(s))
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid { field: "chunk_size", reason: "must be > 0".to_string() });
        }
        if self.model_step_hours <= 0 {
            return Err(ConfigError::Invalid { field: "model_step_hours", reason: "must be > 0".to_string() });
        }
        Ok(())
    }

    /// Resolve the tracker installation directory and check that it exists.
    pub fn install(&self) -> Result<TrackInstall, ConfigError> {
        let root = match &self.track_dir {
            Some(p) if p.is_dir() => p.clone(),
            Some(p) => return Err(ConfigError::TrackDir(format!("{} is not a directory", p.display()))),
            None => utils::get_track_path().map_err(|e| ConfigError::TrackDir(e.to_string()))?,
        };
        Ok(TrackInstall { root, config: self.clone() })
    }
}

/// A located tracker installation, with helpers for the paths inside it that the
/// pipeline stages need.
#[derive(Debug, Clone)]
pub struct TrackInstall {
    pub root: PathBuf,
    pub config: TrackConfig,
}

impl TrackInstall {
    /// Use `root` as the tracker installation without checking it; mostly for tests.
    pub fn new_unchecked<P: Into<PathBuf>>(root: P, config: TrackConfig) -> Self {
        Self { root: root.into(), config }
    }

    /// The tracker's input area, where fields and control files are read from.
    pub fn indat(&self) -> PathBuf {
        self.root.join("indat")
    }

    /// The tracker's fixed output area.
    pub fn outdat(&self) -> PathBuf {
        self.root.join("outdat")
    }

    pub fn tracker_exe(&self) -> PathBuf {
        self.root.join(&self.config.tracker_exe)
    }

    pub fn master_script(&self) -> PathBuf {
        self.root.join(&self.config.master_script)
    }

    pub fn count_utility(&self) -> PathBuf {
        self.root.join(&self.config.count_utility)
    }

    pub fn combine_utility(&self) -> PathBuf {
        self.root.join(&self.config.combine_utility)
    }

    pub fn tr2nc_utility(&self) -> PathBuf {
        self.root.join(&self.config.tr2nc_utility)
    }

    pub fn stats_template(&self) -> PathBuf {
        self.indat().join(&self.config.stats_template)
    }

    pub fn add_field_template(&self) -> PathBuf {
        self.root.join(&self.config.add_field_template)
    }
}

fn default_tracker_exe() -> PathBuf {
    PathBuf::from("bin/track.linux")
}

fn default_master_script() -> PathBuf {
    PathBuf::from("master")
}

fn default_count_utility() -> PathBuf {
    PathBuf::from("utils/bin/count")
}

fn default_combine_utility() -> PathBuf {
    PathBuf::from("utils/bin/combine")
}

fn default_tr2nc_utility() -> PathBuf {
    PathBuf::from("utils/bin/tr2nc")
}

fn default_chunk_size() -> usize {
    62
}

fn default_truncation_threshold() -> usize {
    96
}

fn default_vorticity_level() -> u32 {
    85000
}

fn default_model_step_hours() -> i64 {
    6
}

fn default_cdo() -> String {
    "cdo".to_string()
}

fn default_ncks() -> String {
    "ncks".to_string()
}

fn default_ncatted() -> String {
    "ncatted".to_string()
}

fn default_ncdump() -> String {
    "ncdump".to_string()
}

fn default_stats_template() -> String {
    "STATS.in".to_string()
}

fn default_add_field_template() -> String {
    "addfld.in".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = TrackConfig::from_toml_str("").expect("deserialization should not fail");
        assert_eq!(cfg.chunk_size, 62);
        assert_eq!(cfg.truncation_threshold_rows, 96);
        assert_eq!(cfg.tracker_exe, PathBuf::from("bin/track.linux"));
        assert!(cfg.track_dir.is_none());
    }

    #[test]
    fn test_override_config() {
        let toml_str = r#"
        track_dir = "/opt/track"
        cdo = "/usr/local/bin/cdo"
        "#;
        let cfg = TrackConfig::from_toml_str(toml_str).expect("deserialization should not fail");
        assert_eq!(cfg.track_dir, Some(PathBuf::from("/opt/track")));
        assert_eq!(cfg.cdo, "/usr/local/bin/cdo");
        assert_eq!(cfg.ncks, "ncks");
    }

    #[test]
    fn test_invalid_config() {
        assert!(TrackConfig::from_toml_str("chunk_size = 0").is_err());
        assert!(TrackConfig::from_toml_str("not_a_field = 1").is_err());
    }

    #[test]
    fn test_install_paths() {
        let install = TrackInstall::new_unchecked("/opt/track", TrackConfig::default());
        assert_eq!(install.outdat(), PathBuf::from("/opt/track/outdat"));
        assert_eq!(install.stats_template(), PathBuf::from("/opt/track/indat/STATS.in"));
        assert_eq!(install.count_utility(), PathBuf::from("/opt/track/utils/bin/count"));
    }
}
