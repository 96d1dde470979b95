//! 总线扫描
//!
//! 枚举所有传输总线上的候选设备，产出 [`DeviceDescriptor`] 列表。
//!
//! 扫描的容错约定：
//! - 每条总线的枚举都有各自的超时上限，超时即跳过该总线并告警；
//! - 单条总线枚举失败（权限、后端错误）同样只告警不致命；
//! - 返回值永远是"到目前为止能看到的设备"，绝不因一条总线挂掉
//!   而让整次扫描失败。

use crate::{DeviceDescriptor, Transport};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// 扫描参数
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// 单条总线枚举超时
    pub per_bus_timeout: Duration,
    /// 探测的 CAN 接口数量上限（can0..canN-1）
    pub max_can_interfaces: usize,
    /// 是否扫描 CAN 总线
    pub enable_can: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            per_bus_timeout: Duration::from_secs(2),
            max_can_interfaces: 4,
            enable_can: false,
        }
    }
}

/// 扫描所有已启用的总线
///
/// 串口总线始终扫描（编译了 `serial-bus` feature 时）；CAN 总线按
/// 选项开关。每条总线独立超时、独立失败。
pub fn scan_all_buses(options: &ScanOptions) -> Vec<DeviceDescriptor> {
    let mut descriptors = Vec::new();

    #[cfg(feature = "serial-bus")]
    descriptors.extend(scan_serial_bus(options.per_bus_timeout));

    if options.enable_can {
        descriptors.extend(scan_can_bus(options.max_can_interfaces));
    }

    debug!(count = descriptors.len(), "bus scan complete");
    descriptors
}

/// 串口总线扫描
///
/// 底层枚举在某些平台上会触碰慢速设备节点，因此放到独立线程里
/// 执行并用通道超时收割：超时后该线程被遗弃（枚举调用无法中断），
/// 结果直接丢弃。
#[cfg(feature = "serial-bus")]
pub fn scan_serial_bus(timeout: Duration) -> Vec<DeviceDescriptor> {
    let (tx, rx) = crossbeam_channel::bounded(1);

    std::thread::Builder::new()
        .name("magpie-serial-scan".into())
        .spawn(move || {
            let result = serialport::available_ports();
            let _ = tx.send(result);
        })
        .ok();

    let ports = match rx.recv_timeout(timeout) {
        Ok(Ok(ports)) => ports,
        Ok(Err(e)) => {
            warn!(error = %e, "serial port enumeration failed, skipping bus");
            return Vec::new();
        }
        Err(_) => {
            warn!(?timeout, "serial port enumeration timed out, skipping bus");
            return Vec::new();
        }
    };

    let mut descriptors = Vec::new();
    for port in ports {
        match port.port_type {
            serialport::SerialPortType::UsbPort(info) => {
                descriptors.push(DeviceDescriptor {
                    transport: Transport::UsbSerial,
                    address: port.port_name,
                    vendor_id: Some(info.vid),
                    product_id: Some(info.pid),
                    serial_number: info.serial_number,
                });
            }
            other => {
                // 板载串口、蓝牙串口等：不是我们关心的总线
                trace!(port = %port.port_name, ?other, "skipping non-USB serial port");
            }
        }
    }
    descriptors
}

/// CAN 总线扫描（仅 Linux）
///
/// 依次检查 `can0..can{max}` 是否存在且处于 UP 状态。检查只读，
/// 不需要 root 或 CAP_NET_ADMIN 权限。
#[cfg(target_os = "linux")]
pub fn scan_can_bus(max_interfaces: usize) -> Vec<DeviceDescriptor> {
    let mut descriptors = Vec::new();
    for index in 0..max_interfaces {
        let name = format!("can{}", index);
        match can_interface_is_up(&name) {
            Ok(true) => {
                descriptors.push(DeviceDescriptor {
                    transport: Transport::Can,
                    address: name,
                    vendor_id: None,
                    product_id: None,
                    serial_number: None,
                });
            }
            Ok(false) => {
                debug!(interface = %name, "CAN interface exists but is DOWN, skipping");
            }
            Err(NotPresent) => {
                trace!(interface = %name, "CAN interface not present");
            }
        }
    }
    descriptors
}

#[cfg(not(target_os = "linux"))]
pub fn scan_can_bus(_max_interfaces: usize) -> Vec<DeviceDescriptor> {
    trace!("CAN scan requested on non-Linux platform, nothing to do");
    Vec::new()
}

/// 接口不存在的标记错误
#[cfg(target_os = "linux")]
struct NotPresent;

/// 检查网络接口是否存在且管理态 UP
///
/// 先用 `if_nametoindex()` 判断接口是否存在，再通过
/// `ioctl(SIOCGIFFLAGS)` 读取 IFF_UP 标志位。
#[cfg(target_os = "linux")]
fn can_interface_is_up(interface: &str) -> Result<bool, NotPresent> {
    use std::ffi::CString;

    // ifr_name 为 IFNAMSIZ = 16 字节（含结尾 NUL），最长 15 字符
    const MAX_IFACE_NAME_LEN: usize = 15;
    if interface.len() > MAX_IFACE_NAME_LEN {
        return Err(NotPresent);
    }

    let c_iface = match CString::new(interface) {
        Ok(s) => s,
        Err(_) => return Err(NotPresent),
    };

    let ifindex = unsafe { libc::if_nametoindex(c_iface.as_ptr()) };
    if ifindex == 0 {
        return Err(NotPresent);
    }

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    let bytes = interface.as_bytes();
    unsafe {
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            ifr.ifr_name.as_mut_ptr() as *mut u8,
            bytes.len(),
        );
        ifr.ifr_name[bytes.len()] = 0;
    }

    struct FdGuard(libc::c_int);
    impl Drop for FdGuard {
        fn drop(&mut self) {
            if self.0 >= 0 {
                unsafe { libc::close(self.0) };
            }
        }
    }

    let sockfd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sockfd < 0 {
        warn!(interface = %interface, "socket() failed during CAN interface check");
        return Err(NotPresent);
    }
    let _guard = FdGuard(sockfd);

    let ret = unsafe { libc::ioctl(sockfd, libc::SIOCGIFFLAGS, &mut ifr) };
    if ret < 0 {
        warn!(interface = %interface, "ioctl(SIOCGIFFLAGS) failed during CAN interface check");
        return Err(NotPresent);
    }

    let flags = unsafe { ifr.ifr_ifru.ifru_flags };
    Ok(flags & libc::IFF_UP as libc::c_short != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_options_defaults() {
        let options = ScanOptions::default();
        assert_eq!(options.max_can_interfaces, 4);
        assert!(!options.enable_can);
    }

    #[test]
    fn scan_never_panics_without_hardware() {
        // 无硬件环境下扫描应平静返回（可能为空）
        let options = ScanOptions {
            per_bus_timeout: Duration::from_millis(500),
            max_can_interfaces: 2,
            enable_can: true,
        };
        let _ = scan_all_buses(&options);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn absent_can_interface_reported_not_present() {
        assert!(can_interface_is_up("can99").is_err());
        // 超长接口名同样按"不存在"处理
        assert!(can_interface_is_up("a-very-long-interface-name").is_err());
    }
}
