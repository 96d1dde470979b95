//! 标定档案存储
//!
//! 每个物理设备一份档案，**只按硬件序列号索引**：同一台设备无论
//! 插在哪个总线地址上，永远解析到同一份档案。
//!
//! 持久化约定：
//! - 一个序列号一个 JSON 文件（`<serial>.json`）；
//! - 写入走 write-temp-then-rename，写到一半崩溃不会损坏旧档案；
//! - 覆盖写幂等；
//! - `load` 找不到档案时返回 `None`，**绝不**静默合成默认值——
//!   行程限位未知的机械臂不允许被下发运动指令。

use crate::{StoreError, timestamp::unix_time_s};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 每关节标定表（零位偏移 / 行程限位 / 符号约定）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointCalibration {
    /// 每关节零位偏移（原始编码器计数）
    pub offsets: SmallVec<[i32; 8]>,
    /// 每关节行程下限（弧度）
    pub mins: SmallVec<[f64; 8]>,
    /// 每关节行程上限（弧度）
    pub maxs: SmallVec<[f64; 8]>,
    /// 符号约定（+1 / -1）
    pub signs: SmallVec<[i8; 8]>,
}

impl JointCalibration {
    pub fn joint_count(&self) -> usize {
        self.offsets.len()
    }

    /// 目标角度是否全部落在标定行程内
    pub fn within_limits(&self, targets: &[f64]) -> bool {
        targets.len() == self.mins.len()
            && targets
                .iter()
                .zip(self.mins.iter().zip(self.maxs.iter()))
                .all(|(t, (lo, hi))| *t >= *lo && *t <= *hi)
    }
}

/// 相机内参
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// 畸变系数（模型相关，长度不定）
    pub distortion: Vec<f64>,
}

/// 标定数据载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CalibrationData {
    Joints(JointCalibration),
    Camera(CameraIntrinsics),
}

/// 一份标定档案（写入后不可变；重标定 = 原子覆盖）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    /// 硬件序列号（唯一键）
    pub serial: String,
    pub data: CalibrationData,
    /// 创建时间（Unix 秒）
    pub created_at: u64,
}

impl CalibrationProfile {
    pub fn joints(serial: impl Into<String>, calibration: JointCalibration) -> Self {
        Self {
            serial: serial.into(),
            data: CalibrationData::Joints(calibration),
            created_at: unix_time_s(),
        }
    }

    pub fn camera(serial: impl Into<String>, intrinsics: CameraIntrinsics) -> Self {
        Self {
            serial: serial.into(),
            data: CalibrationData::Camera(intrinsics),
            created_at: unix_time_s(),
        }
    }

    pub fn as_joints(&self) -> Option<&JointCalibration> {
        match &self.data {
            CalibrationData::Joints(j) => Some(j),
            _ => None,
        }
    }
}

/// 标定档案目录
pub struct CalibrationStore {
    dir: PathBuf,
}

impl CalibrationStore {
    /// 打开（必要时创建）档案目录
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// 默认位置 `~/.magpie/calibration/`
    pub fn open_default() -> Result<Self, StoreError> {
        Self::open(crate::config::home_dir()?.join("calibration"))
    }

    fn profile_path(&self, serial: &str) -> PathBuf {
        // 序列号可能含路径分隔符等垃圾字符，落盘前清洗
        let sanitized: String = serial
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", sanitized))
    }

    /// 读取档案；未标定返回 `Ok(None)`
    pub fn load(&self, serial: &str) -> Result<Option<CalibrationProfile>, StoreError> {
        let path = self.profile_path(serial);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content) {
            Ok(profile) => Ok(Some(profile)),
            Err(e) => {
                // 半写状态不可能出现（rename 原子性）；到这里说明文件被外部改坏
                warn!(path = %path.display(), error = %e, "calibration profile is corrupt");
                Err(e.into())
            }
        }
    }

    /// 原子写入档案（write-temp-then-rename）
    ///
    /// 先写临时文件并 fsync，再 rename 到最终路径。任何一步失败，
    /// 旧档案保持原样。
    pub fn save(&self, profile: &CalibrationProfile) -> Result<(), StoreError> {
        let path = self.profile_path(&profile.serial);
        let tmp_path = path.with_extension(format!("json.tmp.{}", std::process::id()));

        let payload = serde_json::to_vec_pretty(profile)?;
        let result = (|| -> Result<(), StoreError> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&payload)?;
            file.sync_all()?;
            std::fs::rename(&tmp_path, &path)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        } else {
            debug!(serial = %profile.serial, path = %path.display(), "calibration profile saved");
        }
        result
    }

    /// 列出已有档案的序列号（文件名裁剪，不读内容）
    pub fn list_serials(&self) -> Result<Vec<String>, StoreError> {
        let mut serials = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(serial) = name.strip_suffix(".json") {
                serials.push(serial.to_string());
            }
        }
        serials.sort();
        Ok(serials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn sample_calibration() -> JointCalibration {
        JointCalibration {
            offsets: smallvec![2048; 6],
            mins: smallvec![-1.5; 6],
            maxs: smallvec![1.5; 6],
            signs: smallvec![1; 6],
        }
    }

    #[test]
    fn within_limits_checks_range_and_arity() {
        let cal = sample_calibration();
        assert!(cal.within_limits(&[0.0, 1.2, 0.0, 0.0, 0.0, 0.0]));
        assert!(!cal.within_limits(&[0.0, 2.0, 0.0, 0.0, 0.0, 0.0]));
        // 关节数不匹配同样拒绝
        assert!(!cal.within_limits(&[0.0]));
    }

    #[test]
    fn load_unknown_serial_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::open(dir.path()).unwrap();
        assert!(store.load("NOPE-123").unwrap().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::open(dir.path()).unwrap();

        let profile = CalibrationProfile::joints("ARM-42", sample_calibration());
        store.save(&profile).unwrap();

        let loaded = store.load("ARM-42").unwrap().unwrap();
        assert_eq!(loaded, profile);
    }

    #[test]
    fn overwrite_is_idempotent_and_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::open(dir.path()).unwrap();

        let first = CalibrationProfile::joints("ARM-42", sample_calibration());
        store.save(&first).unwrap();

        let mut recalibrated = sample_calibration();
        recalibrated.maxs = smallvec![2.0; 6];
        let second = CalibrationProfile::joints("ARM-42", recalibrated);
        store.save(&second).unwrap();
        store.save(&second).unwrap();

        let loaded = store.load("ARM-42").unwrap().unwrap();
        assert_eq!(loaded.as_joints().unwrap().maxs[0], 2.0);
        // 临时文件不残留
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref().unwrap().file_name().to_string_lossy().contains(".tmp.")
            })
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn crashed_write_leaves_prior_profile_intact() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::open(dir.path()).unwrap();

        let profile = CalibrationProfile::joints("ARM-42", sample_calibration());
        store.save(&profile).unwrap();

        // 模拟崩溃：一个半写的临时文件躺在目录里
        std::fs::write(
            dir.path().join(format!("ARM-42.json.tmp.{}", std::process::id())),
            b"{\"serial\": \"ARM-4",
        )
        .unwrap();

        // 旧档案原样可读
        let loaded = store.load("ARM-42").unwrap().unwrap();
        assert_eq!(loaded, profile);
    }

    #[test]
    fn serial_with_path_characters_is_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::open(dir.path()).unwrap();

        let profile = CalibrationProfile::joints("../evil/serial", sample_calibration());
        store.save(&profile).unwrap();
        assert!(store.load("../evil/serial").unwrap().is_some());
        // 文件确实落在存储目录内
        assert!(dir.path().join("___evil_serial.json").exists());
    }
}
