//! 连接管理器
//!
//! 维护机器人槽位注册表：总线扫描产出候选描述符，`resolve` 按驱动
//! 工厂逐一试连，成功后升级为活跃句柄并挂上按序列号取到的标定档案。
//!
//! 槽位状态机：`Probing → {Connected | Rejected}`；`Connected` 在显式
//! 断开或连续读失败超过阈值后降级为 `Disconnected`。槽位只增不减，
//! 槽位序号在进程生命周期内稳定。
//!
//! 并发约定：
//! - 同一描述符键同时至多一次在途探测（后来者等待结果）；
//! - 不同描述符的探测互不串行化（`resolve_all` 并行）；
//! - `list()` 走 ArcSwap 快照，与探测/降级完全无锁。

use crate::error::EngineError;
use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam_channel::{Receiver, Sender};
use magpie_hw::driver::{DriverFactory, RobotDriver};
use magpie_hw::scan::{ScanOptions, scan_all_buses};
use magpie_hw::{DeviceDescriptor, HwError, JointCalibration, JointState};
use magpie_store::calibration::{CalibrationProfile, CalibrationStore};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 连接管理器的运行参数
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// 单次连接尝试的超时
    pub connect_timeout: Duration,
    /// 读取工作线程的单次读取超时
    pub read_timeout: Duration,
    /// 读取工作线程的轮询周期
    pub poll_interval: Duration,
    /// 连续读失败多少次后降级为 Disconnected
    pub max_consecutive_failures: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(5),
            max_consecutive_failures: 5,
        }
    }
}

/// 一台已连接机器人的活跃句柄
///
/// 句柄由管理器独占拥有写路径；录制环只通过 [`RobotHandle::latest`]
/// 无锁读取读取线程发布的最新关节状态。
pub struct RobotHandle {
    serial: String,
    model: String,
    joint_count: usize,
    driver: Mutex<Box<dyn RobotDriver>>,
    calibration: ArcSwapOption<JointCalibration>,
    latest: ArcSwapOption<JointState>,
    last_command: ArcSwapOption<SmallVec<[f64; 8]>>,
    running: AtomicBool,
    consecutive_failures: AtomicUsize,
}

impl RobotHandle {
    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn joint_count(&self) -> usize {
        self.joint_count
    }

    /// 读取线程发布的最新关节状态（无锁）
    pub fn latest(&self) -> Option<Arc<JointState>> {
        self.latest.load_full()
    }

    /// 最近一次下发的目标位置（无锁）
    pub fn last_command(&self) -> Option<Arc<SmallVec<[f64; 8]>>> {
        self.last_command.load_full()
    }

    pub fn calibration(&self) -> Option<Arc<JointCalibration>> {
        self.calibration.load_full()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 停止读取线程并断开驱动（幂等）
    fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.driver.lock().disconnect();
    }
}

/// 槽位状态（对外快照形式）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotStatus {
    /// 探测进行中（只会在 `list()` 快照里短暂出现）
    Probing,
    Connected {
        serial: String,
        model: String,
        joint_count: usize,
        calibrated: bool,
    },
    Rejected {
        reason: String,
    },
    Disconnected {
        serial: String,
    },
}

/// 一个槽位的只读快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RobotSnapshot {
    /// 槽位序号（进程生命周期内稳定）
    pub slot: usize,
    /// 描述符键（总线:地址）
    pub key: String,
    pub status: SlotStatus,
}

impl std::fmt::Display for RobotSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.status {
            SlotStatus::Probing => write!(f, "[{}] {} probing", self.slot, self.key),
            SlotStatus::Connected {
                serial,
                model,
                joint_count,
                calibrated,
            } => write!(
                f,
                "[{}] {} connected serial={} model={} joints={}{}",
                self.slot,
                self.key,
                serial,
                model,
                joint_count,
                if *calibrated { "" } else { " (uncalibrated)" }
            ),
            SlotStatus::Rejected { reason } => {
                write!(f, "[{}] {} rejected: {}", self.slot, self.key, reason)
            }
            SlotStatus::Disconnected { serial } => {
                write!(f, "[{}] {} disconnected serial={}", self.slot, self.key, serial)
            }
        }
    }
}

/// 连接事件（降级等异步状态变化）
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub slot: usize,
    pub serial: String,
    pub kind: ConnectionEventKind,
}

#[derive(Debug, Clone)]
pub enum ConnectionEventKind {
    /// 连续读失败达到阈值，槽位已降级
    ReadFailureDemotion { failures: usize },
}

enum SlotState {
    Probing,
    Connected(Arc<RobotHandle>),
    Rejected { reason: String },
    Disconnected { serial: String },
}

struct Slot {
    descriptor: DeviceDescriptor,
    state: SlotState,
}

struct Inner {
    factories: Vec<Box<dyn DriverFactory>>,
    calibration: CalibrationStore,
    options: ConnectionOptions,
    slots: Mutex<Vec<Slot>>,
    probe_done: Condvar,
    snapshot: ArcSwap<Vec<RobotSnapshot>>,
    events_tx: Sender<ConnectionEvent>,
    events_rx: Receiver<ConnectionEvent>,
}

/// 机器人连接管理器
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(factories: Vec<Box<dyn DriverFactory>>, calibration: CalibrationStore) -> Self {
        Self::with_options(factories, calibration, ConnectionOptions::default())
    }

    pub fn with_options(
        factories: Vec<Box<dyn DriverFactory>>,
        calibration: CalibrationStore,
        options: ConnectionOptions,
    ) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Self {
            inner: Arc::new(Inner {
                factories,
                calibration,
                options,
                slots: Mutex::new(Vec::new()),
                probe_done: Condvar::new(),
                snapshot: ArcSwap::from_pointee(Vec::new()),
                events_tx,
                events_rx,
            }),
        }
    }

    /// 扫描所有总线，返回候选描述符
    pub fn scan(&self, options: &ScanOptions) -> Vec<DeviceDescriptor> {
        scan_all_buses(options)
    }

    /// 解析单个描述符为活跃句柄
    ///
    /// 返回时槽位必然处于终态（Connected / Rejected），绝不悬在
    /// Probing。同一描述符键的并发调用会合并：后来者阻塞等待在途
    /// 探测的结果。
    pub fn resolve(&self, descriptor: &DeviceDescriptor) -> RobotSnapshot {
        let key = descriptor.key();
        let slot_index = {
            let mut slots = self.inner.slots.lock();
            loop {
                match slots.iter().position(|s| s.descriptor.key() == key) {
                    Some(i) => match &slots[i].state {
                        SlotState::Probing => {
                            // 已有在途探测：等它出结果
                            self.inner.probe_done.wait(&mut slots);
                        }
                        SlotState::Connected(_) => return snapshot_of(i, &slots[i]),
                        SlotState::Rejected { .. } | SlotState::Disconnected { .. } => {
                            slots[i].descriptor = descriptor.clone();
                            slots[i].state = SlotState::Probing;
                            break i;
                        }
                    },
                    None => {
                        slots.push(Slot {
                            descriptor: descriptor.clone(),
                            state: SlotState::Probing,
                        });
                        break slots.len() - 1;
                    }
                }
            }
        };

        // 锁外探测：不同描述符的 resolve 互不串行化
        let state = match self.probe(descriptor) {
            Ok(handle) => SlotState::Connected(handle),
            Err(reason) => {
                debug!(descriptor = %descriptor, reason = %reason, "descriptor rejected");
                SlotState::Rejected { reason }
            }
        };

        let mut slots = self.inner.slots.lock();
        slots[slot_index].state = state;
        self.republish(&slots);
        self.inner.probe_done.notify_all();
        snapshot_of(slot_index, &slots[slot_index])
    }

    /// 并行解析一批描述符（每个描述符一个探测线程）
    pub fn resolve_all(&self, descriptors: &[DeviceDescriptor]) -> Vec<RobotSnapshot> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = descriptors
                .iter()
                .map(|d| scope.spawn(move || self.resolve(d)))
                .collect();
            handles
                .into_iter()
                .zip(descriptors)
                .map(|(h, d)| {
                    h.join().unwrap_or_else(|_| RobotSnapshot {
                        slot: usize::MAX,
                        key: d.key(),
                        status: SlotStatus::Rejected {
                            reason: "probe thread panicked".to_string(),
                        },
                    })
                })
                .collect()
        })
    }

    /// 扫描 + 全量解析的便捷入口
    pub fn scan_and_resolve(&self, options: &ScanOptions) -> Vec<RobotSnapshot> {
        let descriptors = self.scan(options);
        self.resolve_all(&descriptors)
    }

    /// 当前所有槽位的快照（无锁）
    pub fn list(&self) -> Arc<Vec<RobotSnapshot>> {
        self.inner.snapshot.load_full()
    }

    /// 所有处于连接态的活跃句柄（按槽位序）
    pub fn active_handles(&self) -> Vec<Arc<RobotHandle>> {
        self.inner
            .slots
            .lock()
            .iter()
            .filter_map(|s| match &s.state {
                SlotState::Connected(handle) => Some(Arc::clone(handle)),
                _ => None,
            })
            .collect()
    }

    /// 断开指定槽位（幂等；未连接的槽位是无操作）
    pub fn disconnect(&self, slot: usize) {
        let mut slots = self.inner.slots.lock();
        let Some(entry) = slots.get_mut(slot) else {
            return;
        };
        if let SlotState::Connected(handle) = &entry.state {
            info!(slot, serial = %handle.serial, "disconnecting robot");
            handle.shutdown();
            let serial = handle.serial.clone();
            entry.state = SlotState::Disconnected { serial };
            self.republish(&slots);
        }
    }

    /// 断开全部槽位并停止所有读取线程
    pub fn shutdown(&self) {
        let mut slots = self.inner.slots.lock();
        for entry in slots.iter_mut() {
            if let SlotState::Connected(handle) = &entry.state {
                handle.shutdown();
                let serial = handle.serial.clone();
                entry.state = SlotState::Disconnected { serial };
            }
        }
        self.republish(&slots);
    }

    /// 异步连接事件流（降级通知）
    pub fn events(&self) -> Receiver<ConnectionEvent> {
        self.inner.events_rx.clone()
    }

    /// 对指定槽位执行标定扫程并原子落盘
    ///
    /// 空槽位或未连接槽位返回 [`EngineError::DeviceNotFound`]，此时
    /// 标定存储未被触碰。扫程期间读取线程会被驱动锁自然挡住，不计
    /// 入失败。
    pub fn calibrate(&self, slot: usize) -> Result<CalibrationProfile, EngineError> {
        let handle = self.connected_handle(slot)?;

        info!(slot, serial = %handle.serial, "starting calibration sweep");
        let calibration = handle
            .driver
            .lock()
            .run_calibration()
            .map_err(EngineError::Hw)?;

        let profile = CalibrationProfile::joints(handle.serial.clone(), calibration.clone());
        self.inner
            .calibration
            .save(&profile)
            .map_err(EngineError::CalibrationWriteFailed)?;

        handle.calibration.store(Some(Arc::new(calibration)));
        let slots = self.inner.slots.lock();
        self.republish(&slots);
        info!(slot, serial = %handle.serial, "calibration saved");
        Ok(profile)
    }

    /// 下发关节目标位置
    ///
    /// 未标定的设备拒绝运动指令（只读监控不受影响）；目标越过标定
    /// 行程限位同样拒绝。
    pub fn command_positions(
        &self,
        slot: usize,
        targets: &[f64],
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let handle = self.connected_handle(slot)?;
        let calibration = handle
            .calibration
            .load_full()
            .ok_or_else(|| EngineError::CalibrationMissing(handle.serial.clone()))?;
        if !calibration.within_limits(targets) {
            return Err(EngineError::Hw(HwError::Unsupported(
                "joint target outside calibrated limits",
            )));
        }
        handle
            .driver
            .lock()
            .write_joints(targets, timeout)
            .map_err(EngineError::Hw)?;
        handle
            .last_command
            .store(Some(Arc::new(SmallVec::from_slice(targets))));
        Ok(())
    }

    fn connected_handle(&self, slot: usize) -> Result<Arc<RobotHandle>, EngineError> {
        let slots = self.inner.slots.lock();
        match slots.get(slot).map(|s| &s.state) {
            Some(SlotState::Connected(handle)) => Ok(Arc::clone(handle)),
            _ => Err(EngineError::DeviceNotFound(format!("slot {}", slot))),
        }
    }

    /// 锁外的单描述符探测：依注册顺序尝试每个声明支持的工厂
    fn probe(&self, descriptor: &DeviceDescriptor) -> Result<Arc<RobotHandle>, String> {
        let mut last_reason: Option<String> = None;
        let mut any_supported = false;

        for factory in &self.inner.factories {
            if !factory.supports(descriptor) {
                continue;
            }
            any_supported = true;
            match factory.open(descriptor, self.inner.options.connect_timeout) {
                Ok(driver) => {
                    let serial = driver.serial_number().to_string();
                    if serial.is_empty() {
                        last_reason = Some(format!(
                            "driver '{}' connected but reported an empty serial",
                            factory.name()
                        ));
                        continue;
                    }
                    return Ok(self.admit(descriptor, driver, serial));
                }
                Err(e) => {
                    debug!(factory = factory.name(), descriptor = %descriptor, error = %e,
                        "connection attempt failed");
                    last_reason = Some(format!("{}: {}", factory.name(), e));
                }
            }
        }

        Err(if any_supported {
            last_reason.unwrap_or_else(|| "all connection attempts failed".to_string())
        } else {
            "no driver claims this descriptor".to_string()
        })
    }

    /// 连接成功后的入场手续：挂标定、建句柄、起读取线程
    fn admit(
        &self,
        descriptor: &DeviceDescriptor,
        driver: Box<dyn RobotDriver>,
        serial: String,
    ) -> Arc<RobotHandle> {
        let calibration = match self.inner.calibration.load(&serial) {
            Ok(Some(profile)) => profile.as_joints().cloned(),
            Ok(None) => {
                warn!(serial = %serial, "no calibration profile on file, motion commands will be refused");
                None
            }
            Err(e) => {
                warn!(serial = %serial, error = %e, "calibration store unreadable, treating as uncalibrated");
                None
            }
        };

        let handle = Arc::new(RobotHandle {
            serial: serial.clone(),
            model: driver.model().to_string(),
            joint_count: driver.joint_count(),
            driver: Mutex::new(driver),
            calibration: ArcSwapOption::new(calibration.map(Arc::new)),
            latest: ArcSwapOption::empty(),
            last_command: ArcSwapOption::empty(),
            running: AtomicBool::new(true),
            consecutive_failures: AtomicUsize::new(0),
        });

        info!(descriptor = %descriptor, serial = %serial, model = handle.model(),
            "robot connected");
        spawn_reader(
            Arc::clone(&handle),
            Arc::downgrade(&self.inner),
            self.inner.options.clone(),
        );
        handle
    }

    /// 在持有槽位锁的前提下重建快照并发布
    fn republish(&self, slots: &[Slot]) {
        let snapshot: Vec<RobotSnapshot> = slots
            .iter()
            .enumerate()
            .map(|(i, s)| snapshot_of(i, s))
            .collect();
        self.inner.snapshot.store(Arc::new(snapshot));
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn snapshot_of(slot: usize, entry: &Slot) -> RobotSnapshot {
    let status = match &entry.state {
        SlotState::Probing => SlotStatus::Probing,
        SlotState::Connected(handle) => SlotStatus::Connected {
            serial: handle.serial.clone(),
            model: handle.model.clone(),
            joint_count: handle.joint_count,
            calibrated: handle.calibration.load().is_some(),
        },
        SlotState::Rejected { reason } => SlotStatus::Rejected {
            reason: reason.clone(),
        },
        SlotState::Disconnected { serial } => SlotStatus::Disconnected {
            serial: serial.clone(),
        },
    };
    RobotSnapshot {
        slot,
        key: entry.descriptor.key(),
        status,
    }
}

/// 每台已连接机器人一条读取线程
///
/// 以固定轮询周期读取关节状态并发布到句柄的 ArcSwap 槽；连续失败
/// 达到阈值后把所在槽位降级为 Disconnected 并推送事件，然后退出。
fn spawn_reader(handle: Arc<RobotHandle>, inner: Weak<Inner>, options: ConnectionOptions) {
    let name = format!("magpie-read-{}", handle.serial());
    let spawned = std::thread::Builder::new().name(name).spawn(move || {
        while handle.running.load(Ordering::Acquire) {
            let result = handle.driver.lock().read_joints(options.read_timeout);
            match result {
                Ok(state) => {
                    handle.latest.store(Some(Arc::new(state)));
                    handle.consecutive_failures.store(0, Ordering::Release);
                }
                Err(HwError::NotConnected) => break,
                Err(e) => {
                    let failures =
                        handle.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                    warn!(serial = %handle.serial, failures, error = %e, "joint read failed");
                    if failures >= options.max_consecutive_failures {
                        demote(&handle, &inner, failures);
                        break;
                    }
                }
            }
            std::thread::sleep(options.poll_interval);
        }
        debug!(serial = %handle.serial, "reader thread exiting");
    });
    if let Err(e) = spawned {
        warn!(error = %e, "failed to spawn reader thread");
    }
}

/// 读失败超限：降级槽位、发事件（管理器已销毁则静默退出）
fn demote(handle: &Arc<RobotHandle>, inner: &Weak<Inner>, failures: usize) {
    handle.shutdown();
    let Some(inner) = inner.upgrade() else {
        return;
    };

    let mut slots = inner.slots.lock();
    let demoted = slots.iter_mut().enumerate().find_map(|(i, s)| {
        if let SlotState::Connected(h) = &s.state {
            if Arc::ptr_eq(h, handle) {
                s.state = SlotState::Disconnected {
                    serial: handle.serial.clone(),
                };
                return Some(i);
            }
        }
        None
    });

    if let Some(slot) = demoted {
        warn!(slot, serial = %handle.serial, failures,
            "robot demoted after consecutive read failures");
        let snapshot: Vec<RobotSnapshot> = slots
            .iter()
            .enumerate()
            .map(|(i, s)| snapshot_of(i, s))
            .collect();
        inner.snapshot.store(Arc::new(snapshot));
        let _ = inner.events_tx.send(ConnectionEvent {
            slot,
            serial: handle.serial.clone(),
            kind: ConnectionEventKind::ReadFailureDemotion { failures },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magpie_hw::mock::{MockArmFactory, MockArmScript};

    fn store() -> (tempfile::TempDir, CalibrationStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn resolve_connects_mock_arm() {
        let (_dir, store) = store();
        let manager = ConnectionManager::new(vec![Box::new(MockArmFactory::default())], store);

        let snap = manager.resolve(&MockArmFactory::descriptor("0"));
        assert!(matches!(
            snap.status,
            SlotStatus::Connected { ref serial, calibrated: false, .. } if serial == "MOCK-0001"
        ));
        assert_eq!(snap.slot, 0);
        assert_eq!(manager.active_handles().len(), 1);
    }

    #[test]
    fn refused_connection_is_rejected_not_pending() {
        let (_dir, store) = store();
        let factory = MockArmFactory::new(MockArmScript {
            refuse_connect: true,
            ..Default::default()
        });
        let manager = ConnectionManager::new(vec![Box::new(factory)], store);

        let snap = manager.resolve(&MockArmFactory::descriptor("0"));
        assert!(matches!(snap.status, SlotStatus::Rejected { .. }));
        assert!(manager.active_handles().is_empty());
    }

    #[test]
    fn unclaimed_descriptor_is_rejected() {
        let (_dir, store) = store();
        let manager = ConnectionManager::new(vec![Box::new(MockArmFactory::default())], store);

        let descriptor = DeviceDescriptor {
            transport: magpie_hw::Transport::UsbSerial,
            address: "/dev/ttyUSB9".into(),
            vendor_id: Some(0xdead),
            product_id: Some(0xbeef),
            serial_number: None,
        };
        let snap = manager.resolve(&descriptor);
        assert!(
            matches!(snap.status, SlotStatus::Rejected { ref reason } if reason.contains("no driver"))
        );
    }

    #[test]
    fn resolve_same_descriptor_reuses_slot() {
        let (_dir, store) = store();
        let manager = ConnectionManager::new(vec![Box::new(MockArmFactory::default())], store);

        let a = manager.resolve(&MockArmFactory::descriptor("0"));
        let b = manager.resolve(&MockArmFactory::descriptor("0"));
        assert_eq!(a.slot, b.slot);
        assert_eq!(manager.list().len(), 1);
        assert_eq!(manager.active_handles().len(), 1);
    }

    #[test]
    fn disconnect_is_idempotent_and_tolerates_bad_slot() {
        let (_dir, store) = store();
        let manager = ConnectionManager::new(vec![Box::new(MockArmFactory::default())], store);
        manager.resolve(&MockArmFactory::descriptor("0"));

        manager.disconnect(0);
        manager.disconnect(0);
        manager.disconnect(42);
        assert!(matches!(
            manager.list()[0].status,
            SlotStatus::Disconnected { .. }
        ));
    }

    #[test]
    fn consecutive_read_failures_demote_slot() {
        let (_dir, store) = store();
        let factory = MockArmFactory::default();
        let script = factory.script();
        let manager = ConnectionManager::with_options(
            vec![Box::new(factory)],
            store,
            ConnectionOptions {
                poll_interval: Duration::from_millis(1),
                max_consecutive_failures: 3,
                ..Default::default()
            },
        );
        let events = manager.events();

        manager.resolve(&MockArmFactory::descriptor("0"));
        script.lock().unwrap().fail_next_reads = usize::MAX;

        let event = events
            .recv_timeout(Duration::from_secs(2))
            .expect("demotion event");
        assert_eq!(event.serial, "MOCK-0001");
        assert!(matches!(
            event.kind,
            ConnectionEventKind::ReadFailureDemotion { failures: 3 }
        ));
        assert!(matches!(
            manager.list()[0].status,
            SlotStatus::Disconnected { .. }
        ));
    }

    #[test]
    fn calibrate_empty_slot_leaves_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::open(dir.path()).unwrap();
        let probe = CalibrationStore::open(dir.path()).unwrap();
        let manager = ConnectionManager::new(vec![Box::new(MockArmFactory::default())], store);

        let err = manager.calibrate(0).unwrap_err();
        assert!(matches!(err, EngineError::DeviceNotFound(_)));
        assert_eq!(err.exit_code(), 2);
        assert!(probe.list_serials().unwrap().is_empty());
    }

    #[test]
    fn calibrate_saves_profile_and_unblocks_motion() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::open(dir.path()).unwrap();
        let probe = CalibrationStore::open(dir.path()).unwrap();
        let manager = ConnectionManager::new(vec![Box::new(MockArmFactory::default())], store);
        manager.resolve(&MockArmFactory::descriptor("0"));

        let timeout = Duration::from_millis(50);
        let err = manager
            .command_positions(0, &[0.0; 6], timeout)
            .unwrap_err();
        assert!(matches!(err, EngineError::CalibrationMissing(_)));

        let profile = manager.calibrate(0).unwrap();
        assert_eq!(profile.serial, "MOCK-0001");
        assert_eq!(probe.list_serials().unwrap(), vec!["MOCK-0001".to_string()]);

        manager.command_positions(0, &[0.1; 6], timeout).unwrap();
        // 越过行程限位的目标被拒绝
        assert!(manager.command_positions(0, &[99.0; 6], timeout).is_err());
    }

    #[test]
    fn reader_publishes_latest_state() {
        let (_dir, store) = store();
        let manager = ConnectionManager::with_options(
            vec![Box::new(MockArmFactory::default())],
            store,
            ConnectionOptions {
                poll_interval: Duration::from_millis(1),
                ..Default::default()
            },
        );
        manager.resolve(&MockArmFactory::descriptor("0"));

        let handle = manager.active_handles().remove(0);
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while handle.latest().is_none() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        let state = handle.latest().expect("reader published a state");
        assert_eq!(state.joint_count(), 6);
    }
}
