//! # Magpie 编排层
//!
//! 把硬件层、相机层与存储层装配成完整的采集系统：
//!
//! - **连接管理器** (`connection`): 总线扫描、驱动分发、槽位注册表、
//!   按序列号挂标定、读取线程与失败降级
//! - **相机管理器** (`camera_mgr`): 相机发现与流注册表、抓帧线程
//! - **录制引擎** (`recording`): 固定频率打拍采样、偏差窗口判定、
//!   片段缓冲与落盘
//! - **错误分类** (`error`): 面向命令层的错误枚举与退出码映射
//!
//! 所有注册表都由显式构造的管理器实例拥有，没有模块级全局状态；
//! `list()` 一律返回 ArcSwap 快照，读路径与设备状态变更完全无锁。

pub mod camera_mgr;
pub mod connection;
pub mod error;
pub mod recording;

pub use camera_mgr::{CameraHandle, CameraManager, CameraOptions, CameraSnapshot, CameraStatus};
pub use connection::{
    ConnectionEvent, ConnectionEventKind, ConnectionManager, ConnectionOptions, RobotHandle,
    RobotSnapshot, SlotStatus,
};
pub use error::EngineError;
pub use recording::{
    EngineConfig, RecorderState, RecorderStatus, RecordingEngine, StallPolicy,
};
