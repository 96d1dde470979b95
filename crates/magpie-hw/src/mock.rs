//! Mock 机器人驱动
//!
//! 无硬件环境下的测试替身：行为完全由 [`MockArmScript`] 控制，
//! 可注入读取延迟、连续失败、序列号缺失等故障模式。

use crate::driver::{DriverFactory, RobotDriver};
use crate::JointCalibration;
use crate::{
    DeviceDescriptor, HwDeviceError, HwDeviceErrorKind, HwError, JointState, Transport,
    monotonic_us,
};
use smallvec::{SmallVec, smallvec};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mock 驱动的行为脚本（测试侧持有同一份 Arc 随时修改）
#[derive(Debug)]
pub struct MockArmScript {
    /// 报告的序列号；`None` 模拟无序列号设备（resolve 应拒绝）
    pub serial: Option<String>,
    /// 关节数
    pub joint_count: usize,
    /// 当前关节位置（读取时返回）
    pub positions: Vec<f64>,
    /// 每次读取注入的延迟
    pub read_latency: Duration,
    /// 接下来 N 次读取返回超时
    pub fail_next_reads: usize,
    /// 连接尝试直接失败
    pub refuse_connect: bool,
    /// 标定扫程返回的行程半宽（弧度）
    pub travel_half_range: f64,
}

impl Default for MockArmScript {
    fn default() -> Self {
        Self {
            serial: Some("MOCK-0001".to_string()),
            joint_count: 6,
            positions: vec![0.0; 6],
            read_latency: Duration::ZERO,
            fail_next_reads: 0,
            refuse_connect: false,
            travel_half_range: 1.5,
        }
    }
}

/// Mock 机械臂
pub struct MockArm {
    script: Arc<Mutex<MockArmScript>>,
    serial: String,
    connected: bool,
}

impl MockArm {
    pub fn script(&self) -> Arc<Mutex<MockArmScript>> {
        Arc::clone(&self.script)
    }
}

impl RobotDriver for MockArm {
    fn model(&self) -> &str {
        "mock-arm"
    }

    fn serial_number(&self) -> &str {
        &self.serial
    }

    fn joint_count(&self) -> usize {
        self.script.lock().unwrap().joint_count
    }

    fn read_joints(&mut self, _timeout: Duration) -> Result<JointState, HwError> {
        if !self.connected {
            return Err(HwError::NotConnected);
        }
        let (latency, result) = {
            let mut script = self.script.lock().unwrap();
            if script.fail_next_reads > 0 {
                script.fail_next_reads -= 1;
                (script.read_latency, Err(HwError::Timeout))
            } else {
                let positions: SmallVec<[f64; 8]> =
                    SmallVec::from_slice(&script.positions);
                (script.read_latency, Ok(positions))
            }
        };
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        result.map(|positions| JointState::new(positions, monotonic_us()))
    }

    fn write_joints(&mut self, targets: &[f64], _timeout: Duration) -> Result<(), HwError> {
        if !self.connected {
            return Err(HwError::NotConnected);
        }
        let mut script = self.script.lock().unwrap();
        if targets.len() != script.joint_count {
            return Err(HwError::InvalidResponse);
        }
        script.positions = targets.to_vec();
        Ok(())
    }

    fn set_torque(&mut self, _enabled: bool, _timeout: Duration) -> Result<(), HwError> {
        if self.connected {
            Ok(())
        } else {
            Err(HwError::NotConnected)
        }
    }

    fn run_calibration(&mut self) -> Result<JointCalibration, HwError> {
        if !self.connected {
            return Err(HwError::NotConnected);
        }
        let script = self.script.lock().unwrap();
        let n = script.joint_count;
        let half = script.travel_half_range;
        Ok(JointCalibration {
            offsets: smallvec![2048; n],
            mins: (0..n).map(|_| -half).collect(),
            maxs: (0..n).map(|_| half).collect(),
            signs: smallvec![1; n],
        })
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Mock 工厂：认领地址以 `mock:` 开头的描述符
pub struct MockArmFactory {
    script: Arc<Mutex<MockArmScript>>,
}

impl MockArmFactory {
    pub fn new(script: MockArmScript) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
        }
    }

    pub fn script(&self) -> Arc<Mutex<MockArmScript>> {
        Arc::clone(&self.script)
    }

    /// 构造与本工厂匹配的描述符
    pub fn descriptor(address_suffix: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            transport: Transport::Network,
            address: format!("mock:{}", address_suffix),
            vendor_id: None,
            product_id: None,
            serial_number: None,
        }
    }
}

impl Default for MockArmFactory {
    fn default() -> Self {
        Self::new(MockArmScript::default())
    }
}

impl DriverFactory for MockArmFactory {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn supports(&self, descriptor: &DeviceDescriptor) -> bool {
        descriptor.address.starts_with("mock:")
    }

    fn open(
        &self,
        _descriptor: &DeviceDescriptor,
        _connect_timeout: Duration,
    ) -> Result<Box<dyn RobotDriver>, HwError> {
        let script = self.script.lock().unwrap();
        if script.refuse_connect {
            return Err(HwError::Timeout);
        }
        let serial = script.serial.clone().ok_or_else(|| {
            HwError::Device(HwDeviceError::new(
                HwDeviceErrorKind::MissingSerial,
                "mock device has no serial number",
            ))
        })?;
        drop(script);

        Ok(Box::new(MockArm {
            script: Arc::clone(&self.script),
            serial,
            connected: true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_arm_reads_scripted_positions() {
        let factory = MockArmFactory::default();
        let desc = MockArmFactory::descriptor("0");
        assert!(factory.supports(&desc));

        let mut arm = factory.open(&desc, Duration::from_millis(10)).unwrap();
        factory.script().lock().unwrap().positions = vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6];

        let state = arm.read_joints(Duration::from_millis(10)).unwrap();
        assert_eq!(state.joint_count(), 6);
        assert!((state.positions[2] - 0.3).abs() < 1e-12);
    }

    #[test]
    fn mock_arm_injects_read_failures() {
        let factory = MockArmFactory::default();
        let mut arm = factory
            .open(&MockArmFactory::descriptor("0"), Duration::from_millis(10))
            .unwrap();

        factory.script().lock().unwrap().fail_next_reads = 2;
        assert!(matches!(
            arm.read_joints(Duration::from_millis(10)),
            Err(HwError::Timeout)
        ));
        assert!(matches!(
            arm.read_joints(Duration::from_millis(10)),
            Err(HwError::Timeout)
        ));
        assert!(arm.read_joints(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn mock_without_serial_is_rejected() {
        let factory = MockArmFactory::new(MockArmScript {
            serial: None,
            ..Default::default()
        });
        let err = factory
            .open(&MockArmFactory::descriptor("0"), Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, HwError::Device(d) if d.kind == HwDeviceErrorKind::MissingSerial));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let factory = MockArmFactory::default();
        let mut arm = factory
            .open(&MockArmFactory::descriptor("0"), Duration::from_millis(10))
            .unwrap();
        arm.disconnect();
        arm.disconnect();
        assert!(!arm.is_connected());
        assert!(matches!(
            arm.read_joints(Duration::from_millis(10)),
            Err(HwError::NotConnected)
        ));
    }
}
