//! # 片段（Episode）文件格式
//!
//! 一次 `start`/`stop` 之间录到的所有样本，落盘为一个列式文件：
//!
//! ```text
//! [MAGIC: 8 bytes "MAGPIE1\0"]
//! [Version: 1 byte]
//! [Data: bincode serialized EpisodeRecord]
//! ```
//!
//! 记录按列组织（逐列存 tick 序号、时间戳、各机器人关节列、各相机
//! 帧列），同一列内按 tick 严格有序。

use crate::{StoreError, timestamp::unix_time_s};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// 片段文件魔数
pub const MAGIC: &[u8; 8] = b"MAGPIE1\0";

/// 当前格式版本
pub const FORMAT_VERSION: u8 = 1;

/// 参与录制的一台机器人
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedRobot {
    pub serial: String,
    pub model: String,
    pub joint_count: usize,
}

/// 参与录制的一路相机
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedCamera {
    pub identifier: String,
    pub width: u32,
    pub height: u32,
}

/// 片段元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeMetadata {
    /// 数据集内片段序号（单调分配，永不复用）
    pub episode_index: u64,
    /// 所属数据集名
    pub dataset: String,
    /// 录制开始时间（Unix 秒）
    pub start_time: u64,
    /// 采样频率（Hz）
    pub freq_hz: u32,
    /// 设备集合
    pub robots: Vec<RecordedRobot>,
    pub cameras: Vec<RecordedCamera>,
    /// 录制平台
    pub platform: String,
}

impl EpisodeMetadata {
    pub fn new(dataset: impl Into<String>, freq_hz: u32) -> Self {
        Self {
            episode_index: 0,
            dataset: dataset.into(),
            start_time: unix_time_s(),
            freq_hz,
            robots: Vec::new(),
            cameras: Vec::new(),
            platform: std::env::consts::OS.to_string(),
        }
    }
}

/// 单台机器人的列数据
///
/// `positions`/`actions` 扁平存储，长度 = 样本数 × 关节数。
/// `action` 是该 tick 下发（或保持）的目标位置；读失败沿用上次值
/// 时对应 `stale[i] = true`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRobotTrack {
    pub serial: String,
    pub joint_count: usize,
    pub positions: Vec<f64>,
    pub actions: Vec<f64>,
    pub stale: Vec<bool>,
}

impl EpisodeRobotTrack {
    pub fn new(serial: impl Into<String>, joint_count: usize) -> Self {
        Self {
            serial: serial.into(),
            joint_count,
            positions: Vec::new(),
            actions: Vec::new(),
            stale: Vec::new(),
        }
    }

    /// 第 i 个样本的关节位置切片
    pub fn positions_at(&self, i: usize) -> &[f64] {
        &self.positions[i * self.joint_count..(i + 1) * self.joint_count]
    }
}

/// 单路相机的列数据
///
/// `held[i]` 为真表示该帧是复用的上一帧（HoldLast 策略下的降级），
/// 不是 tick i 窗口内的新鲜帧。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeCameraTrack {
    pub identifier: String,
    pub width: u32,
    pub height: u32,
    pub frames: Vec<Vec<u8>>,
    pub sequences: Vec<u64>,
    pub held: Vec<bool>,
}

impl EpisodeCameraTrack {
    pub fn new(identifier: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            identifier: identifier.into(),
            width,
            height,
            frames: Vec::new(),
            sequences: Vec::new(),
            held: Vec::new(),
        }
    }
}

/// 一个完整片段（列式）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub version: u8,
    pub metadata: EpisodeMetadata,
    /// tick 序号列（严格递增；AbortTick 策略下允许空洞）
    pub tick_index: Vec<u64>,
    /// 采样时刻列（单调时钟微秒）
    pub timestamp_us: Vec<u64>,
    /// 降级标记列（任一来源越过偏差窗口即为真）
    pub degraded: Vec<bool>,
    pub robots: Vec<EpisodeRobotTrack>,
    pub cameras: Vec<EpisodeCameraTrack>,
}

impl EpisodeRecord {
    pub fn new(metadata: EpisodeMetadata) -> Self {
        Self {
            version: FORMAT_VERSION,
            metadata,
            tick_index: Vec::new(),
            timestamp_us: Vec::new(),
            degraded: Vec::new(),
            robots: Vec::new(),
            cameras: Vec::new(),
        }
    }

    pub fn sample_count(&self) -> usize {
        self.tick_index.len()
    }

    /// 列长一致性检查（save 前调用）
    pub fn validate(&self) -> bool {
        let n = self.tick_index.len();
        self.timestamp_us.len() == n
            && self.degraded.len() == n
            && self.robots.iter().all(|r| {
                r.positions.len() == n * r.joint_count
                    && r.actions.len() == n * r.joint_count
                    && r.stale.len() == n
            })
            && self
                .cameras
                .iter()
                .all(|c| c.frames.len() == n && c.sequences.len() == n && c.held.len() == n)
    }

    /// 保存到文件
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), StoreError> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);

        writer.write_all(MAGIC)?;
        writer.write_all(&[self.version])?;

        let data = bincode::serialize(self)?;
        writer.write_all(&data)?;
        writer.flush()?;
        Ok(())
    }

    /// 从文件加载
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let file = File::open(path.as_ref())?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(StoreError::BadMagic);
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion(version[0]));
        }

        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Ok(bincode::deserialize(&data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> EpisodeRecord {
        let mut metadata = EpisodeMetadata::new("demo", 30);
        metadata.robots.push(RecordedRobot {
            serial: "ARM-1".into(),
            model: "mock-arm".into(),
            joint_count: 2,
        });
        metadata.cameras.push(RecordedCamera {
            identifier: "camera-0".into(),
            width: 4,
            height: 4,
        });

        let mut record = EpisodeRecord::new(metadata);
        let mut robot = EpisodeRobotTrack::new("ARM-1", 2);
        let mut camera = EpisodeCameraTrack::new("camera-0", 4, 4);

        for tick in 0..3u64 {
            record.tick_index.push(tick);
            record.timestamp_us.push(tick * 33_333);
            record.degraded.push(false);
            robot.positions.extend([tick as f64, -(tick as f64)]);
            robot.actions.extend([0.0, 0.0]);
            robot.stale.push(false);
            camera.frames.push(vec![tick as u8; 16]);
            camera.sequences.push(tick + 1);
            camera.held.push(false);
        }
        record.robots.push(robot);
        record.cameras.push(camera);
        record
    }

    #[test]
    fn validate_checks_column_lengths() {
        let mut record = sample_record();
        assert!(record.validate());
        record.degraded.pop();
        assert!(!record.validate());
    }

    #[test]
    fn save_and_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("episode_000000.bin");

        let record = sample_record();
        record.save(&path).unwrap();

        let loaded = EpisodeRecord::load(&path).unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.sample_count(), 3);
        assert_eq!(loaded.robots[0].positions_at(2), &[2.0, -2.0]);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.bin");
        std::fs::write(&path, b"NOTMAGPIExxxxxxxxxxx").unwrap();

        assert!(matches!(EpisodeRecord::load(&path), Err(StoreError::BadMagic)));
    }

    #[test]
    fn future_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("future.bin");
        let mut payload = Vec::new();
        payload.extend_from_slice(MAGIC);
        payload.push(99);
        std::fs::write(&path, &payload).unwrap();

        assert!(matches!(
            EpisodeRecord::load(&path),
            Err(StoreError::UnsupportedVersion(99))
        ));
    }
}
