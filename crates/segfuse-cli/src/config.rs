//! Node configuration – reads/writes `~/.segfuse/config.toml`.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use segfuse_perception::EstimatorConfig;
use segfuse_runtime::{DetectorSettings, FusionConfig};
use serde::{Deserialize, Serialize};

/// Persisted node configuration stored in `~/.segfuse/config.toml`.
///
/// Every key is optional; missing keys take the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the segmentation model server.
    #[serde(default = "default_detector_url")]
    pub detector_url: String,

    /// Model configuration name passed to the server.
    #[serde(default = "default_detector_config")]
    pub detector_config: String,

    /// Minimum detector confidence.
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f64,

    /// rosbridge topic carrying `sensor_msgs/PointCloud2`.
    #[serde(default = "default_pointcloud_topic")]
    pub pointcloud_topic: String,

    /// Keep every n-th point.
    #[serde(default = "default_downsample_factor")]
    pub downsample_factor: usize,

    /// Minimum surviving points per obstacle.
    #[serde(default = "default_min_mask")]
    pub min_mask: usize,

    /// Class ids to keep; empty keeps every class.
    #[serde(default = "default_categories")]
    pub categories: Vec<u32>,

    /// Detector NMS IoU threshold.
    #[serde(default = "default_nms_filter")]
    pub nms_filter: f64,

    /// Gaussian density cut-off for outlier rejection.
    #[serde(default = "default_outlier_threshold")]
    pub outlier_threshold: f64,

    /// WebSocket port of the rosbridge endpoint.
    #[serde(default = "default_bridge_port")]
    pub bridge_port: u16,

    /// Publish the annotated image alongside the obstacles.
    #[serde(default = "default_publish_image")]
    pub publish_image: bool,
}

fn default_detector_url() -> String {
    "http://localhost:8500".to_string()
}
fn default_detector_config() -> String {
    segfuse_runtime::detector::DEFAULT_MODEL_CONFIG.to_string()
}
fn default_score_threshold() -> f64 {
    0.8
}
fn default_pointcloud_topic() -> String {
    "/realsense/camera/pointcloud".to_string()
}
fn default_downsample_factor() -> usize {
    16
}
fn default_min_mask() -> usize {
    20
}
fn default_categories() -> Vec<u32> {
    vec![0]
}
fn default_nms_filter() -> f64 {
    0.3
}
fn default_outlier_threshold() -> f64 {
    0.5
}
fn default_bridge_port() -> u16 {
    9090
}
fn default_publish_image() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            detector_url: default_detector_url(),
            detector_config: default_detector_config(),
            score_threshold: default_score_threshold(),
            pointcloud_topic: default_pointcloud_topic(),
            downsample_factor: default_downsample_factor(),
            min_mask: default_min_mask(),
            categories: default_categories(),
            nms_filter: default_nms_filter(),
            outlier_threshold: default_outlier_threshold(),
            bridge_port: default_bridge_port(),
            publish_image: default_publish_image(),
        }
    }
}

impl Config {
    /// Build the validated pipeline configuration.
    pub fn fusion_config(&self) -> Result<FusionConfig, String> {
        let cfg = FusionConfig {
            estimator: EstimatorConfig {
                downsample_factor: self.downsample_factor,
                min_mask: self.min_mask,
                categories: self.categories.iter().copied().collect::<BTreeSet<_>>(),
                outlier_threshold: self.outlier_threshold,
            },
            detector: DetectorSettings {
                score_threshold: self.score_threshold,
                nms_threshold: self.nms_filter,
                model_config: self.detector_config.clone(),
            },
            publish_image: self.publish_image,
        };
        cfg.validate().map_err(|e| e.to_string())?;
        Ok(cfg)
    }
}

/// Return the path to `~/.segfuse/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".segfuse").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Load the config, or the defaults when no file exists.  Environment
/// overrides apply in both cases.
pub fn load_or_default() -> Result<Config, String> {
    load_or_default_from(&config_path())
}

pub(crate) fn load_or_default_from(path: &Path) -> Result<Config, String> {
    if let Some(cfg) = load_from(path)? {
        return Ok(cfg);
    }
    let mut cfg = Config::default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Apply `SEGFUSE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SEGFUSE_DETECTOR_URL` | `detector_url` |
/// | `SEGFUSE_POINTCLOUD_TOPIC` | `pointcloud_topic` |
/// | `SEGFUSE_DOWNSAMPLE_FACTOR` | `downsample_factor` |
/// | `SEGFUSE_BRIDGE_PORT` | `bridge_port` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("SEGFUSE_DETECTOR_URL") {
        cfg.detector_url = v;
    }
    if let Ok(v) = std::env::var("SEGFUSE_POINTCLOUD_TOPIC") {
        cfg.pointcloud_topic = v;
    }
    if let Ok(v) = std::env::var("SEGFUSE_DOWNSAMPLE_FACTOR")
        && let Ok(k) = v.parse::<usize>()
    {
        cfg.downsample_factor = k;
    }
    if let Ok(v) = std::env::var("SEGFUSE_BRIDGE_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.bridge_port = port;
    }
}

/// Save the config to disk, creating `~/.segfuse/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
