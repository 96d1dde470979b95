//! 机器人驱动接口
//!
//! 每个机器人型号实现同一个能力接口 [`RobotDriver`]，通过
//! [`DriverFactory`] 按描述符签名分发，避免深层类型继承。

use crate::{DeviceDescriptor, HwError, JointState};
use magpie_store::calibration::JointCalibration;
use std::time::Duration;

/// 机器人硬件能力接口
///
/// 所有方法都接受显式超时：驱动内部不允许无限阻塞，超时返回
/// [`HwError::Timeout`]，由上层决定降级策略（跳过、用上次值等）。
///
/// 连接生命周期：工厂 `open()` 返回的驱动已处于连接态并持有有效
/// 序列号；`disconnect()` 幂等，之后所有读写返回
/// [`HwError::NotConnected`]。
pub trait RobotDriver: Send {
    /// 型号名（"feetech-arm"、"can-arm" 等）
    fn model(&self) -> &str;

    /// 硬件序列号（连接态下保证非空）
    fn serial_number(&self) -> &str;

    /// 关节数
    fn joint_count(&self) -> usize;

    /// 读取当前关节位置
    fn read_joints(&mut self, timeout: Duration) -> Result<JointState, HwError>;

    /// 下发关节目标位置（弧度）
    fn write_joints(&mut self, targets: &[f64], timeout: Duration) -> Result<(), HwError>;

    /// 力矩开关（失能后可手动拖动，用于标定扫程）
    fn set_torque(&mut self, enabled: bool, timeout: Duration) -> Result<(), HwError>;

    /// 执行标定扫程：逐关节走满行程并采样原始编码器值
    ///
    /// 这是一个长操作（秒级），只应在显式标定命令下调用，
    /// 不允许出现在录制环路径上。
    fn run_calibration(&mut self) -> Result<JointCalibration, HwError>;

    /// 断开连接（幂等）
    fn disconnect(&mut self);

    /// 是否仍处于连接态
    fn is_connected(&self) -> bool;
}

impl std::fmt::Debug for dyn RobotDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobotDriver")
            .field("model", &self.model())
            .field("serial_number", &self.serial_number())
            .finish()
    }
}

/// 驱动工厂：描述符 → 驱动实例
///
/// `resolve` 流程对每个描述符依注册顺序尝试各工厂：
/// `supports()` 为真才调用 `open()`；第一个成功连接且序列号非空的
/// 工厂胜出。`open()` 失败是常态（探测），必须在 `connect_timeout`
/// 内返回。
pub trait DriverFactory: Send + Sync {
    /// 工厂名（用于日志与 handle 元信息）
    fn name(&self) -> &'static str;

    /// 该工厂是否声明支持此描述符（传输类型 + VID/PID 签名）
    fn supports(&self, descriptor: &DeviceDescriptor) -> bool;

    /// 尝试建立连接；成功则返回已连接的驱动
    fn open(
        &self,
        descriptor: &DeviceDescriptor,
        connect_timeout: Duration,
    ) -> Result<Box<dyn RobotDriver>, HwError>;
}

