//! CAN 总线机械臂驱动（SocketCAN，仅 Linux）
//!
//! 六关节一体化机械臂，经 SocketCAN 接口接入。接口的波特率等配置
//! 由系统工具（`ip link`）完成，不在应用层设置。
//!
//! 帧约定（标准帧，小端）：
//!
//! | ID    | 方向 | 内容 |
//! |-------|------|------|
//! | 0x180 | 出   | 状态请求 |
//! | 0x181 | 入   | 关节 1-4 位置（i16 厘度 ×4） |
//! | 0x182 | 入   | 关节 5-6 位置（i16 厘度 ×2） |
//! | 0x190 | 出   | 行程限位请求 |
//! | 0x191+j | 入 | 关节 j 限位（i16 厘度 min/max） |
//! | 0x1F0 | 出   | 序列号请求 |
//! | 0x1F1 | 入   | 序列号（8 字节 ASCII） |
//! | 0x200 | 出   | 力矩开关（1 字节） |
//! | 0x201 | 出   | 关节 1-4 目标位置 |
//! | 0x202 | 出   | 关节 5-6 目标位置 |

use crate::driver::{DriverFactory, RobotDriver};
use crate::JointCalibration;
use crate::{
    DeviceDescriptor, HwDeviceError, HwDeviceErrorKind, HwError, JointState, Transport,
    monotonic_us,
};
use smallvec::{SmallVec, smallvec};
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Frame, Socket, StandardId};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const JOINT_COUNT: usize = 6;

const ID_STATUS_REQUEST: u16 = 0x180;
const ID_JOINTS_LOW: u16 = 0x181;
const ID_JOINTS_HIGH: u16 = 0x182;
const ID_LIMITS_REQUEST: u16 = 0x190;
const ID_LIMITS_BASE: u16 = 0x191;
const ID_SERIAL_REQUEST: u16 = 0x1F0;
const ID_SERIAL_REPLY: u16 = 0x1F1;
const ID_TORQUE: u16 = 0x200;
const ID_GOAL_LOW: u16 = 0x201;
const ID_GOAL_HIGH: u16 = 0x202;

/// 厘度 → 弧度
fn centideg_to_rad(centideg: i16) -> f64 {
    (centideg as f64 / 100.0).to_radians()
}

/// 弧度 → 厘度
fn rad_to_centideg(rad: f64) -> i16 {
    (rad.to_degrees() * 100.0).clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

/// CAN 机械臂驱动
pub struct CanArm {
    socket: CanSocket,
    interface: String,
    serial: String,
    connected: bool,
}

impl CanArm {
    fn frame(id: u16, data: &[u8]) -> Result<CanFrame, HwError> {
        let std_id = StandardId::new(id).ok_or(HwError::InvalidResponse)?;
        CanFrame::new(std_id, data).ok_or(HwError::InvalidResponse)
    }

    fn send(&mut self, id: u16, data: &[u8]) -> Result<(), HwError> {
        let frame = Self::frame(id, data)?;
        self.socket.write_frame(&frame).map_err(map_io)?;
        Ok(())
    }

    /// 在截止时间内收集一个指定 ID 的帧；其他 ID 的帧被忽略
    fn recv_id(&mut self, want: u16, deadline: Instant) -> Result<Vec<u8>, HwError> {
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(HwError::Timeout)?;
            self.socket.set_read_timeout(remaining).map_err(map_io)?;

            let frame = self.socket.read_frame().map_err(map_io)?;
            if frame.raw_id() == want as u32 {
                return Ok(frame.data().to_vec());
            }
            trace!(id = frame.raw_id(), "ignoring unrelated CAN frame");
        }
    }

    fn ensure_connected(&self) -> Result<(), HwError> {
        if self.connected {
            Ok(())
        } else {
            Err(HwError::NotConnected)
        }
    }

    /// 查询设备序列号
    fn query_serial(&mut self, timeout: Duration) -> Result<String, HwError> {
        self.send(ID_SERIAL_REQUEST, &[])?;
        let data = self.recv_id(ID_SERIAL_REPLY, Instant::now() + timeout)?;
        let serial: String = data
            .iter()
            .take_while(|b| **b != 0)
            .map(|b| *b as char)
            .filter(|c| c.is_ascii_graphic())
            .collect();
        if serial.is_empty() {
            return Err(HwError::Device(HwDeviceError::new(
                HwDeviceErrorKind::MissingSerial,
                "arm returned an empty serial number",
            )));
        }
        Ok(serial)
    }
}

impl RobotDriver for CanArm {
    fn model(&self) -> &str {
        "can-arm"
    }

    fn serial_number(&self) -> &str {
        &self.serial
    }

    fn joint_count(&self) -> usize {
        JOINT_COUNT
    }

    fn read_joints(&mut self, timeout: Duration) -> Result<JointState, HwError> {
        self.ensure_connected()?;
        let deadline = Instant::now() + timeout;

        self.send(ID_STATUS_REQUEST, &[0x01])?;
        let low = self.recv_id(ID_JOINTS_LOW, deadline)?;
        let high = self.recv_id(ID_JOINTS_HIGH, deadline)?;
        if low.len() < 8 || high.len() < 4 {
            return Err(HwError::InvalidResponse);
        }

        let mut positions: SmallVec<[f64; 8]> = smallvec![];
        for chunk in low.chunks_exact(2).take(4) {
            positions.push(centideg_to_rad(i16::from_le_bytes([chunk[0], chunk[1]])));
        }
        for chunk in high.chunks_exact(2).take(2) {
            positions.push(centideg_to_rad(i16::from_le_bytes([chunk[0], chunk[1]])));
        }

        Ok(JointState::new(positions, monotonic_us()))
    }

    fn write_joints(&mut self, targets: &[f64], timeout: Duration) -> Result<(), HwError> {
        self.ensure_connected()?;
        if targets.len() != JOINT_COUNT {
            return Err(HwError::Device(HwDeviceError::new(
                HwDeviceErrorKind::InvalidResponse,
                format!("expected {} joint targets, got {}", JOINT_COUNT, targets.len()),
            )));
        }
        let _ = timeout; // SocketCAN 写入由内核队列缓冲，不阻塞

        let mut low = [0u8; 8];
        for (i, target) in targets[..4].iter().enumerate() {
            low[i * 2..i * 2 + 2].copy_from_slice(&rad_to_centideg(*target).to_le_bytes());
        }
        let mut high = [0u8; 4];
        for (i, target) in targets[4..].iter().enumerate() {
            high[i * 2..i * 2 + 2].copy_from_slice(&rad_to_centideg(*target).to_le_bytes());
        }

        self.send(ID_GOAL_LOW, &low)?;
        self.send(ID_GOAL_HIGH, &high)?;
        Ok(())
    }

    fn set_torque(&mut self, enabled: bool, _timeout: Duration) -> Result<(), HwError> {
        self.ensure_connected()?;
        self.send(ID_TORQUE, &[enabled as u8])
    }

    /// CAN 臂的行程限位由固件在出厂时烧写，标定即回读这些限位。
    /// 零位偏移由固件处理，上位机侧恒为 0。
    fn run_calibration(&mut self) -> Result<JointCalibration, HwError> {
        self.ensure_connected()?;
        let per_joint_timeout = Duration::from_millis(200);

        self.send(ID_LIMITS_REQUEST, &[])?;

        let mut mins: SmallVec<[f64; 8]> = smallvec![];
        let mut maxs: SmallVec<[f64; 8]> = smallvec![];
        for j in 0..JOINT_COUNT {
            let data = self.recv_id(
                ID_LIMITS_BASE + j as u16,
                Instant::now() + per_joint_timeout,
            )?;
            if data.len() < 4 {
                return Err(HwError::InvalidResponse);
            }
            mins.push(centideg_to_rad(i16::from_le_bytes([data[0], data[1]])));
            maxs.push(centideg_to_rad(i16::from_le_bytes([data[2], data[3]])));
        }

        Ok(JointCalibration {
            offsets: smallvec![0; JOINT_COUNT],
            mins,
            maxs,
            signs: smallvec![1; JOINT_COUNT],
        })
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            debug!(interface = %self.interface, "CAN arm disconnected");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// CAN 机械臂工厂
pub struct CanArmFactory;

impl DriverFactory for CanArmFactory {
    fn name(&self) -> &'static str {
        "can-arm"
    }

    fn supports(&self, descriptor: &DeviceDescriptor) -> bool {
        descriptor.transport == Transport::Can
    }

    fn open(
        &self,
        descriptor: &DeviceDescriptor,
        connect_timeout: Duration,
    ) -> Result<Box<dyn RobotDriver>, HwError> {
        let socket = CanSocket::open(&descriptor.address).map_err(|e| {
            warn!(interface = %descriptor.address, error = %e, "failed to open CAN socket");
            map_io(e)
        })?;

        let mut arm = CanArm {
            socket,
            interface: descriptor.address.clone(),
            serial: String::new(),
            connected: true,
        };

        // 连接验证 = 序列号查询必须在超时内应答
        arm.serial = arm.query_serial(connect_timeout)?;
        debug!(interface = %descriptor.address, serial = %arm.serial, "CAN arm connected");
        Ok(Box::new(arm))
    }
}

fn map_io(e: std::io::Error) -> HwError {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => HwError::Timeout,
        _ => HwError::Io(e),
    }
}
