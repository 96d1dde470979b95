//! # Magpie 硬件层
//!
//! 机器人硬件抽象层，提供统一的总线扫描与驱动接口：
//!
//! - **总线扫描** (`scan`): 串口总线与 CAN 总线的候选设备枚举
//! - **驱动接口** (`driver`): 按能力集定义的 [`RobotDriver`] trait
//! - **具体驱动**: 串口舵机臂 (`feetech`)、CAN 机械臂 (`can_arm`)
//!
//! 每个驱动通过 [`DriverFactory::supports`] 声明自己能处理哪些
//! [`DeviceDescriptor`]，上层（连接管理器）只按能力集分发，
//! 不关心具体型号。

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

pub mod driver;
pub mod scan;

#[cfg(feature = "serial-bus")]
pub mod feetech;

#[cfg(target_os = "linux")]
pub mod can_arm;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use driver::{DriverFactory, RobotDriver};
// 标定表类型与时间基准来自存储层（全 workspace 共用同一单调零点）
pub use magpie_store::calibration::JointCalibration;
pub use magpie_store::timestamp::monotonic_us;

/// 驱动层统一错误类型
#[derive(Error, Debug)]
pub enum HwError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Device Error: {0}")]
    Device(#[from] HwDeviceError),
    #[error("Read timeout")]
    Timeout,
    #[error("Invalid response from device")]
    InvalidResponse,
    #[error("Device not connected")]
    NotConnected,
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

/// 设备/后端错误的结构化分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwDeviceErrorKind {
    Unknown,
    NotFound,
    NoDevice,
    AccessDenied,
    Busy,
    MissingSerial,
    InvalidResponse,
    Backend,
}

/// 结构化设备错误
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct HwDeviceError {
    pub kind: HwDeviceErrorKind,
    pub message: String,
}

impl HwDeviceError {
    pub fn new(kind: HwDeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// 是否为不可恢复错误（设备丢失/权限问题，重试无意义）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            HwDeviceErrorKind::NoDevice
                | HwDeviceErrorKind::AccessDenied
                | HwDeviceErrorKind::NotFound
        )
    }
}

impl From<String> for HwDeviceError {
    fn from(message: String) -> Self {
        Self::new(HwDeviceErrorKind::Unknown, message)
    }
}

impl From<&str> for HwDeviceError {
    fn from(message: &str) -> Self {
        Self::new(HwDeviceErrorKind::Unknown, message)
    }
}

/// 传输总线类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    /// USB 转串口（舵机总线）
    UsbSerial,
    /// CAN 总线（SocketCAN 接口）
    Can,
    /// 网络设备（预留，当前无内建驱动）
    Network,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::UsbSerial => write!(f, "usb-serial"),
            Transport::Can => write!(f, "can"),
            Transport::Network => write!(f, "network"),
        }
    }
}

/// 总线扫描产出的候选设备描述符
///
/// 描述符在 `resolve` 成功（变为活跃句柄）或被拒绝后即被丢弃，
/// 不作为长期标识使用；长期标识是探测后得到的硬件序列号。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// 传输总线
    pub transport: Transport,
    /// 总线地址（串口路径 "/dev/ttyUSB0"、CAN 接口名 "can0" 等）
    pub address: String,
    /// USB Vendor ID（CAN 接口等无 USB 信息时为空）
    pub vendor_id: Option<u16>,
    /// USB Product ID
    pub product_id: Option<u16>,
    /// 枚举阶段即可读到的序列号（未探测前可能为空）
    pub serial_number: Option<String>,
}

impl DeviceDescriptor {
    /// 稳定键，用于去重与 resolve 合并（同一描述符同时只允许一次探测）
    pub fn key(&self) -> String {
        format!("{}:{}", self.transport, self.address)
    }
}

impl std::fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.vendor_id, self.product_id) {
            (Some(vid), Some(pid)) => {
                write!(f, "{} [{:04x}:{:04x}]", self.key(), vid, pid)
            }
            _ => write!(f, "{}", self.key()),
        }
    }
}

/// 一次关节状态读取的结果
///
/// `positions` 单位为弧度；`captured_at_us` 为单调时钟微秒，
/// 用于录制环判定该读取是否在偏差窗口内。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointState {
    pub positions: SmallVec<[f64; 8]>,
    pub captured_at_us: u64,
}

impl JointState {
    pub fn new(positions: impl Into<SmallVec<[f64; 8]>>, captured_at_us: u64) -> Self {
        Self {
            positions: positions.into(),
            captured_at_us,
        }
    }

    pub fn joint_count(&self) -> usize {
        self.positions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_key_is_stable() {
        let desc = DeviceDescriptor {
            transport: Transport::UsbSerial,
            address: "/dev/ttyUSB0".to_string(),
            vendor_id: Some(0x1A86),
            product_id: Some(0x7523),
            serial_number: None,
        };
        assert_eq!(desc.key(), "usb-serial:/dev/ttyUSB0");
        assert_eq!(desc.key(), desc.clone().key());
    }

    #[test]
    fn monotonic_us_is_nondecreasing() {
        let a = monotonic_us();
        let b = monotonic_us();
        assert!(b >= a);
    }

    #[test]
    fn device_error_fatality() {
        let e = HwDeviceError::new(HwDeviceErrorKind::NoDevice, "gone");
        assert!(e.is_fatal());
        let e = HwDeviceError::new(HwDeviceErrorKind::Busy, "in use");
        assert!(!e.is_fatal());
    }
}
