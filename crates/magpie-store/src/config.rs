//! 配置文件加载
//!
//! 配置文件为 `~/.magpie/config.yaml`。容错约定：
//!
//! - 文件不存在：静默使用默认值（并不主动创建文件）；
//! - 文件损坏：告警后使用默认值——配置错误不应阻止程序启动；
//! - 未识别的键：忽略；
//! - 缺失的键：逐项取默认值。

use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 应用配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MagpieConfig {
    // 相机设置
    pub enable_realsense: bool,
    pub enable_cameras: bool,
    pub max_opencv_index: u32,

    // 机器人设置
    pub enable_can: bool,
    pub max_can_interfaces: usize,

    // 录制默认值
    pub default_dataset_name: String,
    pub default_freq: u32,
}

impl Default for MagpieConfig {
    fn default() -> Self {
        Self {
            enable_realsense: true,
            enable_cameras: true,
            max_opencv_index: 10,
            enable_can: false,
            max_can_interfaces: 4,
            default_dataset_name: "example_dataset".to_string(),
            default_freq: 30,
        }
    }
}

impl MagpieConfig {
    /// 从 YAML 文件加载；任何失败都退回默认配置
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Self::default();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read config file, using defaults");
                return Self::default();
            }
        };

        match serde_yaml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "malformed config file, using defaults; fix the file and restart"
                );
                Self::default()
            }
        }
    }

    /// 从默认路径（`~/.magpie/config.yaml`）加载
    pub fn load_default() -> Result<Self, StoreError> {
        Ok(Self::load(&home_dir()?.join("config.yaml")))
    }
}

/// 应用主目录 `~/.magpie/`，附带 `calibration/` 与 `recordings/` 子目录
///
/// 首次调用时创建整棵目录树。
pub fn home_dir() -> Result<PathBuf, StoreError> {
    let home = dirs::home_dir().ok_or(StoreError::NoHomeDir)?.join(".magpie");
    std::fs::create_dir_all(home.join("calibration"))?;
    std::fs::create_dir_all(home.join("recordings"))?;
    Ok(home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = MagpieConfig::load(&dir.path().join("absent.yaml"));
        assert_eq!(config, MagpieConfig::default());
    }

    #[test]
    fn partial_file_fills_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "default_freq: 10\nenable_can: true").unwrap();

        let config = MagpieConfig::load(&path);
        assert_eq!(config.default_freq, 10);
        assert!(config.enable_can);
        // 未出现的键取默认值
        assert_eq!(config.max_opencv_index, 10);
        assert!(config.enable_cameras);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "default_freq: 15\nsome_future_option: 42\n").unwrap();

        let config = MagpieConfig::load(&path);
        assert_eq!(config.default_freq, 15);
    }

    #[test]
    fn malformed_file_degrades_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, ": not [ valid yaml {{{").unwrap();

        let config = MagpieConfig::load(&path);
        assert_eq!(config, MagpieConfig::default());
    }
}
