//! 相机管理器
//!
//! 与连接管理器同构的成像设备注册表：`scan` 汇集各发现后端的候选
//! 列表，`resolve` 打开流并按标定键挂相机内参，每条已打开的流配一条
//! 抓帧线程，把最新帧发布到句柄的 ArcSwap 槽供录制环无锁读取。

use arc_swap::{ArcSwap, ArcSwapOption};
use magpie_camera::provider::{CameraBackend, CameraProvider, ScanLimits};
use magpie_camera::{CameraDescriptor, CameraError, Frame};
use magpie_store::calibration::{CalibrationStore, CameraIntrinsics};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 相机管理器的运行参数
#[derive(Debug, Clone)]
pub struct CameraOptions {
    /// 单次抓帧超时
    pub grab_timeout: Duration,
    /// 抓帧线程的节奏下限（防止零延迟后端空转）
    pub min_grab_interval: Duration,
}

impl Default for CameraOptions {
    fn default() -> Self {
        Self {
            grab_timeout: magpie_camera::DEFAULT_GRAB_TIMEOUT,
            min_grab_interval: Duration::from_millis(1),
        }
    }
}

/// 一条已打开相机流的活跃句柄
pub struct CameraHandle {
    descriptor: CameraDescriptor,
    width: u32,
    height: u32,
    fps: u32,
    intrinsics: Option<CameraIntrinsics>,
    backend: Mutex<Box<dyn CameraBackend>>,
    latest: ArcSwapOption<Frame>,
    running: AtomicBool,
}

impl CameraHandle {
    pub fn descriptor(&self) -> &CameraDescriptor {
        &self.descriptor
    }

    pub fn identifier(&self) -> &str {
        &self.descriptor.identifier
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn intrinsics(&self) -> Option<&CameraIntrinsics> {
        self.intrinsics.as_ref()
    }

    /// 抓帧线程发布的最新帧（无锁）
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.latest.load_full()
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.backend.lock().close();
    }
}

/// 槽位快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSnapshot {
    pub slot: usize,
    pub identifier: String,
    pub status: CameraStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraStatus {
    Probing,
    Streaming {
        width: u32,
        height: u32,
        fps: u32,
        serial: Option<String>,
        calibrated: bool,
    },
    Rejected {
        reason: String,
    },
    Closed,
}

impl std::fmt::Display for CameraSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.status {
            CameraStatus::Probing => write!(f, "[{}] {} probing", self.slot, self.identifier),
            CameraStatus::Streaming {
                width,
                height,
                fps,
                serial,
                calibrated,
            } => write!(
                f,
                "[{}] {} streaming {}x{}@{}fps{}{}",
                self.slot,
                self.identifier,
                width,
                height,
                fps,
                serial
                    .as_deref()
                    .map(|s| format!(" serial={}", s))
                    .unwrap_or_default(),
                if *calibrated { "" } else { " (uncalibrated)" }
            ),
            CameraStatus::Rejected { reason } => {
                write!(f, "[{}] {} rejected: {}", self.slot, self.identifier, reason)
            }
            CameraStatus::Closed => write!(f, "[{}] {} closed", self.slot, self.identifier),
        }
    }
}

enum SlotState {
    Probing,
    Streaming(Arc<CameraHandle>),
    Rejected { reason: String },
    Closed,
}

struct Slot {
    descriptor: CameraDescriptor,
    state: SlotState,
}

/// 相机管理器
pub struct CameraManager {
    providers: Vec<Box<dyn CameraProvider>>,
    calibration: CalibrationStore,
    options: CameraOptions,
    slots: Mutex<Vec<Slot>>,
    probe_done: Condvar,
    snapshot: ArcSwap<Vec<CameraSnapshot>>,
}

impl CameraManager {
    pub fn new(providers: Vec<Box<dyn CameraProvider>>, calibration: CalibrationStore) -> Self {
        Self::with_options(providers, calibration, CameraOptions::default())
    }

    pub fn with_options(
        providers: Vec<Box<dyn CameraProvider>>,
        calibration: CalibrationStore,
        options: CameraOptions,
    ) -> Self {
        Self {
            providers,
            calibration,
            options,
            slots: Mutex::new(Vec::new()),
            probe_done: Condvar::new(),
            snapshot: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// 枚举所有发现后端的候选设备
    pub fn scan(&self, limits: &ScanLimits) -> Vec<CameraDescriptor> {
        let mut descriptors = Vec::new();
        for provider in &self.providers {
            let found = provider.enumerate(limits);
            debug!(provider = provider.name(), count = found.len(), "camera enumeration");
            descriptors.extend(found);
        }
        descriptors
    }

    /// 打开一条流；同一标识符的并发调用被合并
    pub fn resolve(&self, descriptor: &CameraDescriptor) -> CameraSnapshot {
        let slot_index = {
            let mut slots = self.slots.lock();
            loop {
                match slots
                    .iter()
                    .position(|s| s.descriptor.identifier == descriptor.identifier)
                {
                    Some(i) => match &slots[i].state {
                        SlotState::Probing => self.probe_done.wait(&mut slots),
                        SlotState::Streaming(_) => return snapshot_of(i, &slots[i]),
                        SlotState::Rejected { .. } | SlotState::Closed => {
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

        let state = match self.open_stream(descriptor) {
            Ok(handle) => SlotState::Streaming(handle),
            Err(reason) => {
                debug!(camera = %descriptor, reason = %reason, "camera rejected");
                SlotState::Rejected { reason }
            }
        };

        let mut slots = self.slots.lock();
        slots[slot_index].state = state;
        self.republish(&slots);
        self.probe_done.notify_all();
        snapshot_of(slot_index, &slots[slot_index])
    }

    /// 扫描 + 全量打开的便捷入口
    pub fn scan_and_resolve(&self, limits: &ScanLimits) -> Vec<CameraSnapshot> {
        self.scan(limits)
            .iter()
            .map(|d| self.resolve(d))
            .collect()
    }

    /// 当前所有槽位的快照（无锁）
    pub fn list(&self) -> Arc<Vec<CameraSnapshot>> {
        self.snapshot.load_full()
    }

    /// 所有在流的活跃句柄（按槽位序）
    pub fn active_handles(&self) -> Vec<Arc<CameraHandle>> {
        self.slots
            .lock()
            .iter()
            .filter_map(|s| match &s.state {
                SlotState::Streaming(handle) => Some(Arc::clone(handle)),
                _ => None,
            })
            .collect()
    }

    /// 关闭指定槽位（幂等）
    pub fn disconnect(&self, slot: usize) {
        let mut slots = self.slots.lock();
        let Some(entry) = slots.get_mut(slot) else {
            return;
        };
        if let SlotState::Streaming(handle) = &entry.state {
            info!(slot, camera = handle.identifier(), "closing camera stream");
            handle.shutdown();
            entry.state = SlotState::Closed;
            self.republish(&slots);
        }
    }

    /// 关闭全部流并停止抓帧线程
    pub fn shutdown(&self) {
        let mut slots = self.slots.lock();
        for entry in slots.iter_mut() {
            if let SlotState::Streaming(handle) = &entry.state {
                handle.shutdown();
                entry.state = SlotState::Closed;
            }
        }
        self.republish(&slots);
    }

    fn open_stream(&self, descriptor: &CameraDescriptor) -> Result<Arc<CameraHandle>, String> {
        let mut last_reason: Option<String> = None;
        for provider in &self.providers {
            match provider.open(descriptor) {
                Ok(backend) => return Ok(self.admit(descriptor, backend)),
                Err(CameraError::NotFound(_)) => continue,
                Err(e) => {
                    last_reason = Some(format!("{}: {}", provider.name(), e));
                }
            }
        }
        Err(last_reason.unwrap_or_else(|| "no provider claims this camera".to_string()))
    }

    fn admit(
        &self,
        descriptor: &CameraDescriptor,
        backend: Box<dyn CameraBackend>,
    ) -> Arc<CameraHandle> {
        let intrinsics = match self.calibration.load(descriptor.calibration_key()) {
            Ok(Some(profile)) => match profile.data {
                magpie_store::calibration::CalibrationData::Camera(i) => Some(i),
                _ => {
                    warn!(camera = %descriptor, "profile on file is not camera intrinsics, ignoring");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(camera = %descriptor, error = %e, "calibration store unreadable");
                None
            }
        };

        let (width, height) = backend.resolution();
        let fps = backend.fps();
        let handle = Arc::new(CameraHandle {
            descriptor: descriptor.clone(),
            width,
            height,
            fps,
            intrinsics,
            backend: Mutex::new(backend),
            latest: ArcSwapOption::empty(),
            running: AtomicBool::new(true),
        });

        info!(camera = %descriptor, width, height, fps, "camera stream opened");
        spawn_grabber(Arc::clone(&handle), self.options.clone());
        handle
    }

    fn republish(&self, slots: &[Slot]) {
        let snapshot: Vec<CameraSnapshot> = slots
            .iter()
            .enumerate()
            .map(|(i, s)| snapshot_of(i, s))
            .collect();
        self.snapshot.store(Arc::new(snapshot));
    }
}

impl Drop for CameraManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn snapshot_of(slot: usize, entry: &Slot) -> CameraSnapshot {
    let status = match &entry.state {
        SlotState::Probing => CameraStatus::Probing,
        SlotState::Streaming(handle) => CameraStatus::Streaming {
            width: handle.width,
            height: handle.height,
            fps: handle.fps,
            serial: handle.descriptor.serial_number.clone(),
            calibrated: handle.intrinsics.is_some(),
        },
        SlotState::Rejected { reason } => CameraStatus::Rejected {
            reason: reason.clone(),
        },
        SlotState::Closed => CameraStatus::Closed,
    };
    CameraSnapshot {
        slot,
        identifier: entry.descriptor.identifier.clone(),
        status,
    }
}

/// 每条流一个抓帧线程：循环抓最新帧并发布
///
/// 抓帧超时只告警不降级（流还在，下一帧可能恢复）；后端报 `Closed`
/// 即结束线程。
fn spawn_grabber(handle: Arc<CameraHandle>, options: CameraOptions) {
    let name = format!("magpie-grab-{}", handle.identifier());
    let spawned = std::thread::Builder::new().name(name).spawn(move || {
        while handle.running.load(Ordering::Acquire) {
            let result = handle.backend.lock().grab(options.grab_timeout);
            match result {
                Ok(frame) => {
                    handle.latest.store(Some(Arc::new(frame)));
                }
                Err(CameraError::Closed) => break,
                Err(e) => {
                    debug!(camera = handle.identifier(), error = %e, "frame grab failed");
                }
            }
            std::thread::sleep(options.min_grab_interval);
        }
        debug!(camera = handle.identifier(), "grab thread exiting");
    });
    if let Err(e) = spawned {
        warn!(error = %e, "failed to spawn grab thread");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magpie_camera::mock::MockCameraProvider;

    fn store() -> (tempfile::TempDir, CalibrationStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn scan_merges_all_providers() {
        let (_dir, store) = store();
        let manager = CameraManager::new(
            vec![
                Box::new(MockCameraProvider::generic(2)),
                Box::new(MockCameraProvider::depth(&["829212070982"])),
            ],
            store,
        );

        let found = manager.scan(&ScanLimits::default());
        assert_eq!(found.len(), 3);
        assert_eq!(found[2].serial_number.as_deref(), Some("829212070982"));
    }

    #[test]
    fn resolve_opens_stream_and_publishes_frames() {
        let (_dir, store) = store();
        let manager = CameraManager::new(vec![Box::new(MockCameraProvider::generic(1))], store);

        let snaps = manager.scan_and_resolve(&ScanLimits::default());
        assert!(matches!(
            snaps[0].status,
            CameraStatus::Streaming { width: 8, height: 8, .. }
        ));

        let handle = manager.active_handles().remove(0);
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while handle.latest().is_none() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        let frame = handle.latest().expect("grabber published a frame");
        assert_eq!(frame.width, 8);
        assert!(frame.sequence >= 1);
    }

    #[test]
    fn resolve_same_identifier_reuses_slot() {
        let (_dir, store) = store();
        let manager = CameraManager::new(vec![Box::new(MockCameraProvider::generic(1))], store);
        let descriptor = manager.scan(&ScanLimits::default()).remove(0);

        let a = manager.resolve(&descriptor);
        let b = manager.resolve(&descriptor);
        assert_eq!(a.slot, b.slot);
        assert_eq!(manager.active_handles().len(), 1);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let (_dir, store) = store();
        let manager = CameraManager::new(vec![Box::new(MockCameraProvider::generic(1))], store);
        let descriptor = manager.scan(&ScanLimits::default()).remove(0);
        manager.resolve(&descriptor);

        manager.disconnect(0);
        manager.disconnect(0);
        manager.disconnect(9);
        assert!(matches!(manager.list()[0].status, CameraStatus::Closed));
    }

    #[test]
    fn unknown_camera_is_rejected() {
        let (_dir, store) = store();
        let manager = CameraManager::new(vec![Box::new(MockCameraProvider::generic(1))], store);

        let descriptor = CameraDescriptor {
            kind: magpie_camera::CameraKind::GenericIndex,
            identifier: "camera-7".into(),
            index: Some(7),
            serial_number: None,
        };
        let snap = manager.resolve(&descriptor);
        assert!(matches!(snap.status, CameraStatus::Rejected { .. }));
    }
}
