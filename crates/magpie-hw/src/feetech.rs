//! 串口舵机臂驱动（Feetech STS 系列总线舵机）
//!
//! 六关节舵机臂，经 USB 转串口适配板接入，总线波特率 1 Mbps。
//! 协议为半双工指令/应答式：上位机发一条指令包，对应 ID 的舵机
//! 回一条状态包。驱动内所有读写都带显式超时。

use crate::driver::{DriverFactory, RobotDriver};
use crate::JointCalibration;
use crate::{
    DeviceDescriptor, HwDeviceError, HwDeviceErrorKind, HwError, JointState, Transport,
    monotonic_us,
};
use serialport::SerialPort;
use smallvec::{SmallVec, smallvec};
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// 总线波特率（STS 系列出厂默认 1 Mbps）
const BAUD_RATE: u32 = 1_000_000;

/// 默认关节 ID（1..=6，出厂顺序编号）
const DEFAULT_JOINT_IDS: [u8; 6] = [1, 2, 3, 4, 5, 6];

/// 编码器分辨率（counts/圈）
const ENCODER_RESOLUTION: u32 = 4096;

// 指令码
const INSTR_PING: u8 = 0x01;
const INSTR_READ: u8 = 0x02;
const INSTR_WRITE: u8 = 0x03;

// 寄存器地址
const REG_TORQUE_ENABLE: u8 = 0x28;
const REG_GOAL_POSITION: u8 = 0x2A;
const REG_PRESENT_POSITION: u8 = 0x38;

/// 操作者拖动标定的采样窗口
const CALIBRATION_SWEEP: Duration = Duration::from_secs(5);
const CALIBRATION_SAMPLE_INTERVAL: Duration = Duration::from_millis(20);

/// 原始编码器值 → 弧度（2048 为机械零位）
fn counts_to_rad(counts: u16) -> f64 {
    (counts as f64 - (ENCODER_RESOLUTION / 2) as f64) * std::f64::consts::TAU
        / ENCODER_RESOLUTION as f64
}

/// 弧度 → 原始编码器值（截断到行程）
fn rad_to_counts(rad: f64) -> u16 {
    let counts =
        rad * ENCODER_RESOLUTION as f64 / std::f64::consts::TAU + (ENCODER_RESOLUTION / 2) as f64;
    counts.clamp(0.0, (ENCODER_RESOLUTION - 1) as f64) as u16
}

/// 指令包校验和：~(ID + LEN + INSTR + PARAMS) & 0xFF
fn checksum(payload: &[u8]) -> u8 {
    let sum: u32 = payload.iter().map(|b| *b as u32).sum();
    !(sum as u8)
}

/// Feetech 舵机臂驱动
pub struct FeetechArm {
    port: Box<dyn SerialPort>,
    serial: String,
    joint_ids: SmallVec<[u8; 8]>,
    connected: bool,
}

impl FeetechArm {
    /// 发送指令包（自动封包 + 校验和）
    fn send_packet(&mut self, id: u8, instr: u8, params: &[u8]) -> Result<(), HwError> {
        let mut packet = Vec::with_capacity(6 + params.len());
        packet.extend_from_slice(&[0xFF, 0xFF, id, (params.len() + 2) as u8, instr]);
        packet.extend_from_slice(params);
        packet.push(checksum(&packet[2..]));

        self.port.write_all(&packet).map_err(map_io)?;
        Ok(())
    }

    /// 读取状态包，返回参数区
    fn read_status(&mut self, expect_id: u8, timeout: Duration) -> Result<Vec<u8>, HwError> {
        self.port.set_timeout(timeout).map_err(map_serial)?;

        let mut header = [0u8; 5]; // 0xFF 0xFF ID LEN ERROR
        self.port.read_exact(&mut header).map_err(map_io)?;

        if header[0] != 0xFF || header[1] != 0xFF {
            return Err(HwError::InvalidResponse);
        }
        if header[2] != expect_id {
            trace!(got = header[2], expected = expect_id, "status packet id mismatch");
            return Err(HwError::InvalidResponse);
        }
        let len = header[3] as usize;
        if len < 2 {
            return Err(HwError::InvalidResponse);
        }

        // LEN = 参数数 + 2（ERROR + CHECKSUM），ERROR 已在 header 中
        let mut rest = vec![0u8; len - 1];
        self.port.read_exact(&mut rest).map_err(map_io)?;

        let (params, check) = rest.split_at(rest.len() - 1);
        let mut sum_region = vec![header[2], header[3], header[4]];
        sum_region.extend_from_slice(params);
        if checksum(&sum_region) != check[0] {
            return Err(HwError::InvalidResponse);
        }

        Ok(params.to_vec())
    }

    /// PING 单个舵机
    fn ping(&mut self, id: u8, timeout: Duration) -> Result<(), HwError> {
        self.send_packet(id, INSTR_PING, &[])?;
        self.read_status(id, timeout)?;
        Ok(())
    }

    /// 读单个舵机的 u16 寄存器
    fn read_u16(&mut self, id: u8, reg: u8, timeout: Duration) -> Result<u16, HwError> {
        self.send_packet(id, INSTR_READ, &[reg, 2])?;
        let params = self.read_status(id, timeout)?;
        if params.len() != 2 {
            return Err(HwError::InvalidResponse);
        }
        Ok(u16::from_le_bytes([params[0], params[1]]))
    }

    /// 写单个舵机的 u16 寄存器
    fn write_u16(&mut self, id: u8, reg: u8, value: u16, timeout: Duration) -> Result<(), HwError> {
        let bytes = value.to_le_bytes();
        self.send_packet(id, INSTR_WRITE, &[reg, bytes[0], bytes[1]])?;
        self.read_status(id, timeout)?;
        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), HwError> {
        if self.connected {
            Ok(())
        } else {
            Err(HwError::NotConnected)
        }
    }
}

impl RobotDriver for FeetechArm {
    fn model(&self) -> &str {
        "feetech-arm"
    }

    fn serial_number(&self) -> &str {
        &self.serial
    }

    fn joint_count(&self) -> usize {
        self.joint_ids.len()
    }

    fn read_joints(&mut self, timeout: Duration) -> Result<JointState, HwError> {
        self.ensure_connected()?;
        let ids = self.joint_ids.clone();
        let mut positions: SmallVec<[f64; 8]> = smallvec![];
        for id in ids {
            let raw = self.read_u16(id, REG_PRESENT_POSITION, timeout)?;
            positions.push(counts_to_rad(raw));
        }
        Ok(JointState::new(positions, monotonic_us()))
    }

    fn write_joints(&mut self, targets: &[f64], timeout: Duration) -> Result<(), HwError> {
        self.ensure_connected()?;
        if targets.len() != self.joint_ids.len() {
            return Err(HwError::Device(HwDeviceError::new(
                HwDeviceErrorKind::InvalidResponse,
                format!(
                    "expected {} joint targets, got {}",
                    self.joint_ids.len(),
                    targets.len()
                ),
            )));
        }
        let ids = self.joint_ids.clone();
        for (id, target) in ids.into_iter().zip(targets.iter()) {
            self.write_u16(id, REG_GOAL_POSITION, rad_to_counts(*target), timeout)?;
        }
        Ok(())
    }

    fn set_torque(&mut self, enabled: bool, timeout: Duration) -> Result<(), HwError> {
        self.ensure_connected()?;
        let ids = self.joint_ids.clone();
        for id in ids {
            self.write_u16(id, REG_TORQUE_ENABLE, enabled as u16, timeout)?;
        }
        Ok(())
    }

    /// 拖动标定：失能力矩后，操作者在采样窗口内把每个关节推到
    /// 行程两端；驱动以固定间隔采样原始编码器值，取每关节的
    /// min/max 推出零位偏移与行程限位。
    fn run_calibration(&mut self) -> Result<JointCalibration, HwError> {
        self.ensure_connected()?;
        let io_timeout = Duration::from_millis(50);

        self.set_torque(false, io_timeout)?;
        debug!("torque disabled, sampling calibration sweep");

        let n = self.joint_ids.len();
        let mut raw_min: SmallVec<[u16; 8]> = smallvec![u16::MAX; n];
        let mut raw_max: SmallVec<[u16; 8]> = smallvec![0u16; n];

        let deadline = Instant::now() + CALIBRATION_SWEEP;
        while Instant::now() < deadline {
            let ids = self.joint_ids.clone();
            for (j, id) in ids.into_iter().enumerate() {
                match self.read_u16(id, REG_PRESENT_POSITION, io_timeout) {
                    Ok(raw) => {
                        raw_min[j] = raw_min[j].min(raw);
                        raw_max[j] = raw_max[j].max(raw);
                    }
                    Err(HwError::Timeout) => {
                        // 个别采样超时可容忍，继续扫程
                        trace!(joint = j, "calibration sample timed out");
                    }
                    Err(e) => return Err(e),
                }
            }
            std::thread::sleep(CALIBRATION_SAMPLE_INTERVAL);
        }

        self.set_torque(true, io_timeout)?;

        // 完全没动过的关节：行程为空，标定无效
        if raw_min.iter().zip(raw_max.iter()).any(|(lo, hi)| lo >= hi) {
            return Err(HwError::Device(HwDeviceError::new(
                HwDeviceErrorKind::InvalidResponse,
                "calibration sweep covered no travel on at least one joint",
            )));
        }

        let offsets: SmallVec<[i32; 8]> = raw_min
            .iter()
            .zip(raw_max.iter())
            .map(|(lo, hi)| ((*lo as i32) + (*hi as i32)) / 2)
            .collect();
        let mins: SmallVec<[f64; 8]> = raw_min.iter().map(|c| counts_to_rad(*c)).collect();
        let maxs: SmallVec<[f64; 8]> = raw_max.iter().map(|c| counts_to_rad(*c)).collect();
        let signs: SmallVec<[i8; 8]> = smallvec![1; n];

        Ok(JointCalibration {
            offsets,
            mins,
            maxs,
            signs,
        })
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            debug!(serial = %self.serial, "feetech arm disconnected");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Feetech 舵机臂工厂
///
/// 按 USB 转串口芯片的 VID/PID 签名筛选描述符：
/// CH340 (1a86:7523)、CP210x (10c4:ea60)、FTDI (0403:6001)。
pub struct FeetechFactory;

impl FeetechFactory {
    fn matches_signature(vid: u16, pid: u16) -> bool {
        matches!(
            (vid, pid),
            (0x1A86, 0x7523)   // CH340
                | (0x10C4, 0xEA60)  // CP210x
                | (0x0403, 0x6001) // FTDI FT232
        )
    }
}

impl DriverFactory for FeetechFactory {
    fn name(&self) -> &'static str {
        "feetech"
    }

    fn supports(&self, descriptor: &DeviceDescriptor) -> bool {
        descriptor.transport == Transport::UsbSerial
            && matches!(
                (descriptor.vendor_id, descriptor.product_id),
                (Some(vid), Some(pid)) if Self::matches_signature(vid, pid)
            )
    }

    fn open(
        &self,
        descriptor: &DeviceDescriptor,
        connect_timeout: Duration,
    ) -> Result<Box<dyn RobotDriver>, HwError> {
        // 没有可读序列号的适配板无法挂接标定档案，直接拒绝
        let serial = descriptor
            .serial_number
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                HwError::Device(HwDeviceError::new(
                    HwDeviceErrorKind::MissingSerial,
                    format!("{} has no queryable serial number", descriptor),
                ))
            })?;

        let port = serialport::new(&descriptor.address, BAUD_RATE)
            .timeout(connect_timeout)
            .open()
            .map_err(map_serial)?;

        let mut arm = FeetechArm {
            port,
            serial,
            joint_ids: SmallVec::from_slice(&DEFAULT_JOINT_IDS),
            connected: true,
        };

        // 连接验证：全部关节必须应答 PING
        for id in DEFAULT_JOINT_IDS {
            if let Err(e) = arm.ping(id, connect_timeout) {
                warn!(joint_id = id, error = %e, "feetech ping failed during probe");
                return Err(e);
            }
        }

        debug!(address = %descriptor.address, serial = %arm.serial, "feetech arm connected");
        Ok(Box::new(arm))
    }
}

fn map_io(e: std::io::Error) -> HwError {
    if e.kind() == std::io::ErrorKind::TimedOut {
        HwError::Timeout
    } else {
        HwError::Io(e)
    }
}

fn map_serial(e: serialport::Error) -> HwError {
    match e.kind {
        serialport::ErrorKind::NoDevice => HwError::Device(HwDeviceError::new(
            HwDeviceErrorKind::NoDevice,
            e.description,
        )),
        serialport::ErrorKind::Io(kind) if kind == std::io::ErrorKind::TimedOut => {
            HwError::Timeout
        }
        _ => HwError::Device(HwDeviceError::new(
            HwDeviceErrorKind::Backend,
            e.description,
        )),
    }
}
