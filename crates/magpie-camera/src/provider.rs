//! 相机发现与后端接口

use crate::{CameraDescriptor, CameraError, Frame};
use std::time::Duration;

/// 枚举参数
#[derive(Debug, Clone)]
pub struct ScanLimits {
    /// 通用相机的最大探测索引（探测 0..max_index）
    pub max_index: u32,
    /// 单个索引的探测超时
    pub per_probe_timeout: Duration,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            max_index: 10,
            per_probe_timeout: Duration::from_millis(500),
        }
    }
}

/// 一条已打开的相机流
///
/// `grab` 返回设备缓冲区里最新的一帧（不是排队的旧帧），超时返回
/// [`CameraError::Timeout`]。`close` 幂等，之后 `grab` 返回
/// [`CameraError::Closed`]。
pub trait CameraBackend: Send {
    /// 稳定标识（与描述符一致）
    fn identifier(&self) -> &str;

    /// 硬件序列号（通用相机可能没有）
    fn serial_number(&self) -> Option<&str>;

    /// 流分辨率
    fn resolution(&self) -> (u32, u32);

    /// 标称帧率
    fn fps(&self) -> u32;

    /// 抓取最新一帧
    fn grab(&mut self, timeout: Duration) -> Result<Frame, CameraError>;

    /// 关闭流（幂等）
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// 相机发现与打开
///
/// 枚举失败（后端缺失、权限不足）返回空列表并由实现自行告警，
/// 永远不会让整次扫描失败。
pub trait CameraProvider: Send + Sync {
    /// 后端名（用于日志）
    fn name(&self) -> &'static str;

    /// 枚举候选设备
    fn enumerate(&self, limits: &ScanLimits) -> Vec<CameraDescriptor>;

    /// 打开一条流
    fn open(&self, descriptor: &CameraDescriptor) -> Result<Box<dyn CameraBackend>, CameraError>;
}
