//! # Magpie 相机层
//!
//! 成像设备抽象层，与硬件层的驱动接口对称：
//!
//! - [`CameraProvider`] 负责发现（枚举候选设备）与打开流；
//! - [`CameraBackend`] 是一条已打开的流，按需取最新帧。
//!
//! 通用相机（按索引探测）与深度相机（SDK 设备列表、可查询序列号）
//! 都实现同一对 trait，上层相机管理器不区分二者。

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod provider;

#[cfg(all(target_os = "linux", feature = "v4l2"))]
pub mod v4l2;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use provider::{CameraBackend, CameraProvider, ScanLimits};

/// 相机层统一错误类型
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame grab timeout")]
    Timeout,
    #[error("Stream closed")]
    Closed,
    #[error("Camera not found: {0}")]
    NotFound(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

/// 成像设备类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraKind {
    /// 通用相机（按系统索引探测，不保证有序列号）
    GenericIndex,
    /// 深度相机（SDK 枚举，序列号可查询）
    DepthSensor,
}

impl std::fmt::Display for CameraKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CameraKind::GenericIndex => write!(f, "generic"),
            CameraKind::DepthSensor => write!(f, "depth"),
        }
    }
}

/// 相机候选设备描述符
///
/// `identifier` 是稳定标识：深度相机用硬件序列号；无序列号的
/// 通用相机退化为操作者可读的 `camera-<index>`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraDescriptor {
    pub kind: CameraKind,
    /// 稳定标识（序列号或 `camera-<index>`）
    pub identifier: String,
    /// 系统索引（通用相机）
    pub index: Option<u32>,
    /// 硬件序列号（深度相机必有；通用相机可能为空）
    pub serial_number: Option<String>,
}

impl CameraDescriptor {
    /// 标定档案的键：优先硬件序列号，否则用操作者标识
    pub fn calibration_key(&self) -> &str {
        self.serial_number.as_deref().unwrap_or(&self.identifier)
    }
}

impl std::fmt::Display for CameraDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.identifier)
    }
}

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// MJPEG 压缩帧
    Mjpeg,
    /// RGB 8bit 裸帧
    Rgb8,
    /// 16bit 深度图
    Depth16,
}

/// 一帧图像
///
/// 像素数据放在 `Arc` 里：录制环会把"最新帧"发布给采样线程，
/// 克隆必须是 O(1) 的。
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// 采集时刻（单调时钟微秒，与机器人读取同一时间基准）
    pub captured_at_us: u64,
    /// 流内单调递增的帧序号
    pub sequence: u64,
}

impl Frame {
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        captured_at_us: u64,
        sequence: u64,
    ) -> Self {
        Self {
            data: Arc::new(data),
            width,
            height,
            format,
            captured_at_us,
            sequence,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// 帧抓取的默认超时
pub const DEFAULT_GRAB_TIMEOUT: Duration = Duration::from_millis(100);
