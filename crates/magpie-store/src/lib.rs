//! # Magpie 存储层
//!
//! 所有 crate 共用的数据结构与磁盘持久化：
//!
//! - **时间戳** (`timestamp`): 进程级单调时钟与墙钟采样
//! - **配置** (`config`): `~/.magpie/config.yaml` 的加载与默认值
//! - **标定** (`calibration`): 按序列号存取的标定档案（原子写入）
//! - **片段格式** (`episode`): 列式片段记录与文件编解码
//! - **数据集** (`dataset`): 片段索引分配与数据集元数据
//!
//! 本 crate 不依赖任何硬件层，是 workspace 的叶子。

use thiserror::Error;

pub mod calibration;
pub mod config;
pub mod dataset;
pub mod episode;
pub mod timestamp;

pub use calibration::{CalibrationData, CalibrationProfile, CalibrationStore, JointCalibration};
pub use config::MagpieConfig;
pub use dataset::{DatasetMeta, DatasetWriter};
pub use episode::{EpisodeCameraTrack, EpisodeMetadata, EpisodeRecord, EpisodeRobotTrack};
pub use timestamp::{monotonic_us, unix_time_s};

/// 存储层错误类型
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("Invalid file format (bad magic)")]
    BadMagic,
    #[error("Unsupported file version: {0}")]
    UnsupportedVersion(u8),
    #[error("Home directory is not available")]
    NoHomeDir,
}
