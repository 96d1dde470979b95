//! 引擎层错误类型定义
//!
//! 这是面向命令层（CLI / API）的错误分类：每个变体对应一类
//! 用户可见的失败，并映射到固定的进程退出码。

use magpie_camera::CameraError;
use magpie_hw::HwError;
use magpie_store::StoreError;
use thiserror::Error;

/// 引擎层错误类型
#[derive(Error, Debug)]
pub enum EngineError {
    /// 指定槽位没有已连接的设备
    #[error("No device found: {0}")]
    DeviceNotFound(String),

    /// 连接尝试超时
    #[error("Connection timeout: {0}")]
    ConnectionTimeout(String),

    /// 设备未标定（行程限位未知的机械臂拒绝运动指令）
    #[error("Calibration missing for device {0}")]
    CalibrationMissing(String),

    /// 标定档案写入失败（旧档案保持原样）
    #[error("Calibration write failed: {0}")]
    CalibrationWriteFailed(#[source] StoreError),

    /// 已在录制中
    #[error("Recording already active")]
    RecordingAlreadyActive,

    /// 当前没有录制/没有待保存的片段
    #[error("No active recording")]
    RecordingNotActive,

    /// 帧偏差超过窗口（降级标记，AbortTick 策略下的 tick 丢弃原因；
    /// 永远不会作为命令结果返回给用户）
    #[error("Frame skew exceeded on camera {camera} at tick {tick}")]
    FrameSkewExceeded { camera: String, tick: u64 },

    /// 数据集写入失败（封存片段保留在内存中可重试）
    #[error("Dataset write failed: {0}")]
    DatasetWriteFailed(#[source] StoreError),

    /// 硬件层错误
    #[error("Hardware error: {0}")]
    Hw(#[from] HwError),

    /// 相机层错误
    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    /// 存储层错误
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    /// 进程退出码映射
    ///
    /// | 码 | 含义 |
    /// |----|------|
    /// | 0  | 成功 |
    /// | 1  | 一般 I/O 或内部错误 |
    /// | 2  | 未找到设备 |
    /// | 3  | 已在录制中 |
    /// | 4  | 设备未标定 |
    /// | 5  | 没有录制可停止/保存 |
    /// | 6  | 连接超时 |
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::DeviceNotFound(_) => 2,
            EngineError::RecordingAlreadyActive => 3,
            EngineError::CalibrationMissing(_) => 4,
            EngineError::RecordingNotActive => 5,
            EngineError::ConnectionTimeout(_) => 6,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinguished() {
        assert_eq!(EngineError::DeviceNotFound("slot 0".into()).exit_code(), 2);
        assert_eq!(EngineError::RecordingAlreadyActive.exit_code(), 3);
        assert_eq!(EngineError::CalibrationMissing("X".into()).exit_code(), 4);
        assert_eq!(EngineError::RecordingNotActive.exit_code(), 5);
        assert_eq!(
            EngineError::Store(StoreError::BadMagic).exit_code(),
            1,
            "storage failures fall into the generic range"
        );
    }

    #[test]
    fn frame_skew_is_a_non_fatal_marker() {
        let skew = EngineError::FrameSkewExceeded {
            camera: "camera-0".to_string(),
            tick: 42,
        };
        assert_eq!(skew.exit_code(), 1);
        assert_eq!(
            skew.to_string(),
            "Frame skew exceeded on camera camera-0 at tick 42"
        );
    }
}
