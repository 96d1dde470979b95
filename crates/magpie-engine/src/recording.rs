//! 录制引擎
//!
//! 唯一带内部定时环的组件。状态机 `Idle → Recording → Sealed`：
//! `start` 起一条采样线程按频率 F 打拍；`stop` 在下一个 tick 边界前
//! 停环并封存缓冲；`save` 经数据集写入器落盘后回到 `Idle`，失败则
//! 缓冲原样保留可重试；`discard` 丢弃封存缓冲。
//!
//! 每个 tick 的截止时刻是 `开始时刻 + tick序号 / F` 的绝对时间，
//! 不是"上一拍之后睡 1/F"——单拍超时只会迟到，不会让后续所有拍
//! 都漂移；落后超过一整拍则跳到下一个对齐截止点并计入丢拍数。
//!
//! 采样本身从不触碰设备：机器人状态与相机帧都来自各自工作线程
//! 发布的 ArcSwap 槽，单次采样是纯内存读取，不存在阻塞点。

use crate::camera_mgr::CameraHandle;
use crate::connection::RobotHandle;
use crate::error::EngineError;
use magpie_hw::monotonic_us;
use magpie_store::episode::{
    EpisodeCameraTrack, EpisodeMetadata, EpisodeRecord, EpisodeRobotTrack, RecordedCamera,
    RecordedRobot,
};
use magpie_store::{DatasetWriter, StoreError};
use parking_lot::Mutex;
use smallvec::{SmallVec, smallvec};
use spin_sleep::SpinSleeper;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 相机帧越过偏差窗口时的处理策略
///
/// 两种策略都是显式配置项：复用旧帧必须打降级标记，丢 tick 必须
/// 计数，绝不允许悄悄替换。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallPolicy {
    /// 复用该相机的上一帧，样本标记为降级
    HoldLast,
    /// 放弃整个 tick（tick 序号留洞），计入丢拍数
    AbortTick,
}

/// 录制引擎配置
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 采样频率（Hz）
    pub freq_hz: u32,
    /// 偏差窗口 W；`None` 取半个 tick 周期
    pub skew_window: Option<Duration>,
    /// 相机失速策略
    pub stall_policy: StallPolicy,
    /// 内存缓冲样本数上限，超过即强制停采
    pub max_buffered_samples: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            freq_hz: 30,
            skew_window: None,
            stall_policy: StallPolicy::HoldLast,
            max_buffered_samples: 100_000,
        }
    }
}

/// 录制状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    Sealed,
}

/// 状态查询结果
#[derive(Debug, Clone)]
pub struct RecorderStatus {
    pub state: RecorderState,
    pub dataset: Option<String>,
    pub samples: usize,
    pub degraded_samples: usize,
    pub dropped_ticks: u64,
}

#[derive(Default)]
struct LiveStats {
    samples: AtomicUsize,
    degraded: AtomicUsize,
    dropped_ticks: AtomicU64,
}

enum Phase {
    Idle,
    Recording {
        dataset: String,
        stop_flag: Arc<AtomicBool>,
        stats: Arc<LiveStats>,
        worker: JoinHandle<EpisodeRecord>,
    },
    Sealed {
        dataset: String,
        record: EpisodeRecord,
        dropped_ticks: u64,
    },
}

/// 录制引擎
pub struct RecordingEngine {
    config: EngineConfig,
    dataset_root: PathBuf,
    phase: Mutex<Phase>,
}

impl RecordingEngine {
    pub fn new(config: EngineConfig, dataset_root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            dataset_root: dataset_root.into(),
            phase: Mutex::new(Phase::Idle),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 开始录制一个新片段
    ///
    /// 已在录制中返回 [`EngineError::RecordingAlreadyActive`]；存在
    /// 未保存的封存片段时予以丢弃并告警。
    pub fn start(
        &self,
        robots: Vec<Arc<RobotHandle>>,
        cameras: Vec<Arc<CameraHandle>>,
        dataset: &str,
    ) -> Result<(), EngineError> {
        let mut phase = self.phase.lock();
        match &*phase {
            Phase::Recording { .. } => return Err(EngineError::RecordingAlreadyActive),
            Phase::Sealed { record, .. } => {
                warn!(
                    samples = record.sample_count(),
                    "discarding unsaved sealed episode before new start"
                );
            }
            Phase::Idle => {}
        }

        let mut metadata = EpisodeMetadata::new(dataset, self.config.freq_hz);
        metadata.robots = robots
            .iter()
            .map(|r| RecordedRobot {
                serial: r.serial().to_string(),
                model: r.model().to_string(),
                joint_count: r.joint_count(),
            })
            .collect();
        metadata.cameras = cameras
            .iter()
            .map(|c| {
                let (width, height) = c.resolution();
                RecordedCamera {
                    identifier: c.identifier().to_string(),
                    width,
                    height,
                }
            })
            .collect();

        let stop_flag = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(LiveStats::default());
        let session = Session {
            config: self.config.clone(),
            metadata,
            robots,
            cameras,
            stop_flag: Arc::clone(&stop_flag),
            stats: Arc::clone(&stats),
        };

        let worker = std::thread::Builder::new()
            .name("magpie-record".to_string())
            .spawn(move || session.run())
            .map_err(|e| EngineError::Store(StoreError::Io(e)))?;

        info!(dataset, freq_hz = self.config.freq_hz, "recording started");
        *phase = Phase::Recording {
            dataset: dataset.to_string(),
            stop_flag,
            stats,
            worker,
        };
        Ok(())
    }

    /// 停止录制并封存缓冲
    ///
    /// 停止请求最迟在下一个 tick 边界被采样线程观察到。
    pub fn stop(&self) -> Result<RecorderStatus, EngineError> {
        let mut phase = self.phase.lock();
        match std::mem::replace(&mut *phase, Phase::Idle) {
            Phase::Recording {
                dataset,
                stop_flag,
                stats,
                worker,
            } => {
                stop_flag.store(true, Ordering::Release);
                let record = worker.join().map_err(|_| {
                    EngineError::Store(StoreError::Io(std::io::Error::other(
                        "recording thread panicked",
                    )))
                })?;
                let dropped_ticks = stats.dropped_ticks.load(Ordering::Acquire);
                info!(
                    dataset = %dataset,
                    samples = record.sample_count(),
                    dropped_ticks,
                    "recording sealed"
                );
                let status = sealed_status(&dataset, &record, dropped_ticks);
                *phase = Phase::Sealed {
                    dataset,
                    record,
                    dropped_ticks,
                };
                Ok(status)
            }
            other => {
                *phase = other;
                Err(EngineError::RecordingNotActive)
            }
        }
    }

    /// 保存封存片段，返回分得的片段序号
    ///
    /// 写入失败时缓冲原样留在封存态，可修复后重试。
    pub fn save(&self) -> Result<u64, EngineError> {
        let mut phase = self.phase.lock();
        match std::mem::replace(&mut *phase, Phase::Idle) {
            Phase::Sealed {
                dataset,
                mut record,
                dropped_ticks,
            } => {
                let result = DatasetWriter::open(&self.dataset_root, &dataset)
                    .and_then(|mut writer| writer.commit(&mut record));
                match result {
                    Ok(index) => {
                        info!(dataset = %dataset, episode = index, "episode saved");
                        Ok(index)
                    }
                    Err(e) => {
                        warn!(dataset = %dataset, error = %e, "episode save failed, buffer retained");
                        *phase = Phase::Sealed {
                            dataset,
                            record,
                            dropped_ticks,
                        };
                        Err(EngineError::DatasetWriteFailed(e))
                    }
                }
            }
            other => {
                *phase = other;
                Err(EngineError::RecordingNotActive)
            }
        }
    }

    /// 丢弃封存片段
    pub fn discard(&self) -> Result<(), EngineError> {
        let mut phase = self.phase.lock();
        match std::mem::replace(&mut *phase, Phase::Idle) {
            Phase::Sealed { dataset, record, .. } => {
                info!(dataset = %dataset, samples = record.sample_count(), "sealed episode discarded");
                Ok(())
            }
            other => {
                *phase = other;
                Err(EngineError::RecordingNotActive)
            }
        }
    }

    pub fn status(&self) -> RecorderStatus {
        let phase = self.phase.lock();
        match &*phase {
            Phase::Idle => RecorderStatus {
                state: RecorderState::Idle,
                dataset: None,
                samples: 0,
                degraded_samples: 0,
                dropped_ticks: 0,
            },
            Phase::Recording { dataset, stats, .. } => RecorderStatus {
                state: RecorderState::Recording,
                dataset: Some(dataset.clone()),
                samples: stats.samples.load(Ordering::Acquire),
                degraded_samples: stats.degraded.load(Ordering::Acquire),
                dropped_ticks: stats.dropped_ticks.load(Ordering::Acquire),
            },
            Phase::Sealed {
                dataset,
                record,
                dropped_ticks,
            } => sealed_status(dataset, record, *dropped_ticks),
        }
    }
}

fn sealed_status(dataset: &str, record: &EpisodeRecord, dropped_ticks: u64) -> RecorderStatus {
    RecorderStatus {
        state: RecorderState::Sealed,
        dataset: Some(dataset.to_string()),
        samples: record.sample_count(),
        degraded_samples: record.degraded.iter().filter(|d| **d).count(),
        dropped_ticks,
    }
}

/// 一次录制会话（采样线程的自包含输入）
struct Session {
    config: EngineConfig,
    metadata: EpisodeMetadata,
    robots: Vec<Arc<RobotHandle>>,
    cameras: Vec<Arc<CameraHandle>>,
    stop_flag: Arc<AtomicBool>,
    stats: Arc<LiveStats>,
}

impl Session {
    fn run(self) -> EpisodeRecord {
        let freq = self.config.freq_hz.max(1);
        let period = Duration::from_secs_f64(1.0 / freq as f64);
        let skew = self.config.skew_window.unwrap_or(period / 2);
        let skew_us = skew.as_micros() as u64;
        let sleeper = SpinSleeper::default();

        let mut record = EpisodeRecord::new(self.metadata);
        record.robots = self
            .robots
            .iter()
            .map(|r| EpisodeRobotTrack::new(r.serial(), r.joint_count()))
            .collect();
        record.cameras = self
            .cameras
            .iter()
            .map(|c| {
                let (width, height) = c.resolution();
                EpisodeCameraTrack::new(c.identifier(), width, height)
            })
            .collect();

        // 各来源的上次已知值（读不到新值时的降级回退）
        let mut last_positions: Vec<Option<SmallVec<[f64; 8]>>> = vec![None; self.robots.len()];
        let mut last_frame_bytes: Vec<Option<(Vec<u8>, u64)>> = vec![None; self.cameras.len()];
        let mut last_used_seq: Vec<Option<u64>> = vec![None; self.cameras.len()];

        let start = Instant::now();
        let mut tick: u64 = 0;

        loop {
            if self.stop_flag.load(Ordering::Acquire) {
                break;
            }

            let deadline = start + Duration::from_secs_f64(tick as f64 / freq as f64);
            let now = Instant::now();
            if now < deadline {
                sleeper.sleep(deadline - now);
            } else if tick > 0 && now.duration_since(deadline) > period {
                // 落后超过一整拍：跳到下一个对齐截止点而不是逐拍追赶
                let behind = now.duration_since(start).as_secs_f64() * freq as f64;
                let next = (behind.ceil() as u64).max(tick + 1);
                let skipped = next - tick;
                self.stats
                    .dropped_ticks
                    .fetch_add(skipped, Ordering::AcqRel);
                warn!(tick, skipped, "capture overran deadline, realigning");
                tick = next;
                continue;
            }
            if self.stop_flag.load(Ordering::Acquire) {
                break;
            }

            let tick_us = monotonic_us();
            let mut degraded = false;

            // 机器人列：ArcSwap 最新值在窗口内则取新，否则回退上次值
            let mut robot_rows: Vec<(SmallVec<[f64; 8]>, bool)> =
                Vec::with_capacity(self.robots.len());
            for (i, robot) in self.robots.iter().enumerate() {
                let fresh = robot.latest().filter(|s| {
                    tick_us.saturating_sub(s.captured_at_us) <= skew_us
                        && s.joint_count() == robot.joint_count()
                });
                match fresh {
                    Some(state) => {
                        last_positions[i] = Some(state.positions.clone());
                        robot_rows.push((state.positions.clone(), false));
                    }
                    None => {
                        degraded = true;
                        let positions = last_positions[i]
                            .clone()
                            .unwrap_or_else(|| smallvec![0.0; robot.joint_count()]);
                        robot_rows.push((positions, true));
                    }
                }
            }

            // 相机列：窗口外的帧按策略处理
            let mut camera_rows: Vec<(Vec<u8>, u64, bool)> =
                Vec::with_capacity(self.cameras.len());
            let mut abort = false;
            for (i, camera) in self.cameras.iter().enumerate() {
                let latest = camera
                    .latest()
                    .filter(|f| tick_us.saturating_sub(f.captured_at_us) <= skew_us);
                match latest {
                    Some(frame) => {
                        // 同一帧连续进两拍算复用，但不算降级
                        let held = last_used_seq[i] == Some(frame.sequence);
                        last_used_seq[i] = Some(frame.sequence);
                        last_frame_bytes[i] = Some(((*frame.data).clone(), frame.sequence));
                        camera_rows.push(((*frame.data).clone(), frame.sequence, held));
                    }
                    None => {
                        // 非致命：仅作为降级/弃拍的标记记入日志
                        let skew = EngineError::FrameSkewExceeded {
                            camera: camera.identifier().to_string(),
                            tick,
                        };
                        match self.config.stall_policy {
                            StallPolicy::AbortTick => {
                                debug!(error = %skew, "aborting tick");
                                abort = true;
                                break;
                            }
                            StallPolicy::HoldLast => {
                                debug!(error = %skew, "holding last frame");
                                degraded = true;
                                let (bytes, seq) =
                                    last_frame_bytes[i].clone().unwrap_or((Vec::new(), 0));
                                camera_rows.push((bytes, seq, true));
                            }
                        }
                    }
                }
            }

            if abort {
                self.stats.dropped_ticks.fetch_add(1, Ordering::AcqRel);
                tick += 1;
                continue;
            }

            record.tick_index.push(tick);
            record.timestamp_us.push(tick_us);
            record.degraded.push(degraded);
            for (track, (positions, stale)) in record.robots.iter_mut().zip(&robot_rows) {
                track.positions.extend_from_slice(positions);
                track.stale.push(*stale);
            }
            for (i, robot) in self.robots.iter().enumerate() {
                // 动作列 = 最近下发的目标；没有下发过就记当前位置
                let action = robot
                    .last_command()
                    .map(|c| (*c).clone())
                    .unwrap_or_else(|| robot_rows[i].0.clone());
                record.robots[i].actions.extend_from_slice(&action);
            }
            for (track, (bytes, seq, held)) in record.cameras.iter_mut().zip(camera_rows) {
                track.frames.push(bytes);
                track.sequences.push(seq);
                track.held.push(held);
            }

            self.stats.samples.fetch_add(1, Ordering::AcqRel);
            if degraded {
                self.stats.degraded.fetch_add(1, Ordering::AcqRel);
            }

            if record.sample_count() >= self.config.max_buffered_samples {
                warn!(
                    samples = record.sample_count(),
                    "buffered sample cap reached, forcing early stop"
                );
                break;
            }
            tick += 1;
        }

        debug_assert!(record.validate());
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_without_start_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RecordingEngine::new(EngineConfig::default(), dir.path());

        assert!(matches!(
            engine.stop(),
            Err(EngineError::RecordingNotActive)
        ));
        assert!(matches!(
            engine.save(),
            Err(EngineError::RecordingNotActive)
        ));
        assert!(matches!(
            engine.discard(),
            Err(EngineError::RecordingNotActive)
        ));
        assert_eq!(engine.status().state, RecorderState::Idle);
    }

    #[test]
    fn double_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RecordingEngine::new(
            EngineConfig {
                freq_hz: 100,
                ..Default::default()
            },
            dir.path(),
        );

        engine.start(Vec::new(), Vec::new(), "demo").unwrap();
        let err = engine.start(Vec::new(), Vec::new(), "demo").unwrap_err();
        assert!(matches!(err, EngineError::RecordingAlreadyActive));
        assert_eq!(err.exit_code(), 3);
        engine.stop().unwrap();
        engine.discard().unwrap();
    }

    #[test]
    fn buffer_cap_forces_early_stop() {
        let dir = tempfile::tempdir().unwrap();
        let engine = RecordingEngine::new(
            EngineConfig {
                freq_hz: 1000,
                max_buffered_samples: 10,
                ..Default::default()
            },
            dir.path(),
        );

        engine.start(Vec::new(), Vec::new(), "demo").unwrap();
        std::thread::sleep(Duration::from_millis(200));
        let status = engine.stop().unwrap();
        assert_eq!(status.samples, 10);
    }
}
