//! 录制通路集成测试
//!
//! 全部基于 mock 硬件：mock 机械臂 + mock 相机经两个管理器接入
//! 录制引擎，落盘走真实的数据集写入器（tempfile 目录）。

use magpie_camera::mock::{MockCameraProvider, MockCameraScript};
use magpie_camera::provider::ScanLimits;
use magpie_engine::{
    CameraManager, ConnectionManager, ConnectionOptions, EngineConfig, EngineError,
    RecorderState, RecordingEngine, StallPolicy,
};
use magpie_hw::mock::{MockArmFactory, MockArmScript};
use magpie_store::calibration::CalibrationStore;
use magpie_store::episode::EpisodeRecord;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Rig {
    _calibration_dir: tempfile::TempDir,
    dataset_dir: tempfile::TempDir,
    robots: ConnectionManager,
    cameras: CameraManager,
    robot_script: Arc<Mutex<MockArmScript>>,
    camera_script: Arc<Mutex<MockCameraScript>>,
}

/// 一臂一相机的标准测试台
fn rig() -> Rig {
    let calibration_dir = tempfile::tempdir().unwrap();
    let dataset_dir = tempfile::tempdir().unwrap();

    let factory = MockArmFactory::default();
    let robot_script = factory.script();
    let robots = ConnectionManager::with_options(
        vec![Box::new(factory)],
        CalibrationStore::open(calibration_dir.path()).unwrap(),
        ConnectionOptions {
            poll_interval: Duration::from_millis(1),
            max_consecutive_failures: usize::MAX,
            ..Default::default()
        },
    );
    robots.resolve(&MockArmFactory::descriptor("0"));

    let provider = MockCameraProvider::generic(1);
    let camera_script = provider.script(0);
    let cameras = CameraManager::new(
        vec![Box::new(provider)],
        CalibrationStore::open(calibration_dir.path()).unwrap(),
    );
    cameras.scan_and_resolve(&ScanLimits::default());

    // 等两边的工作线程发布出第一份状态，避免首拍必然降级
    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    while std::time::Instant::now() < deadline {
        let robot_ready = robots.active_handles()[0].latest().is_some();
        let camera_ready = cameras.active_handles()[0].latest().is_some();
        if robot_ready && camera_ready {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    Rig {
        _calibration_dir: calibration_dir,
        dataset_dir,
        robots,
        cameras,
        robot_script,
        camera_script,
    }
}

fn engine(rig: &Rig, config: EngineConfig) -> RecordingEngine {
    RecordingEngine::new(config, rig.dataset_dir.path())
}

#[test]
fn end_to_end_10hz_for_2s_yields_19_to_21_samples() {
    let rig = rig();
    let engine = engine(
        &rig,
        EngineConfig {
            freq_hz: 10,
            ..Default::default()
        },
    );

    engine
        .start(
            rig.robots.active_handles(),
            rig.cameras.active_handles(),
            "example_dataset",
        )
        .unwrap();
    std::thread::sleep(Duration::from_secs(2));
    let status = engine.stop().unwrap();
    assert_eq!(status.state, RecorderState::Sealed);
    assert!(
        (19..=21).contains(&status.samples),
        "expected 19..=21 samples, got {}",
        status.samples
    );

    let index = engine.save().unwrap();
    assert_eq!(index, 0);
    assert_eq!(engine.status().state, RecorderState::Idle);

    let path = rig
        .dataset_dir
        .path()
        .join("example_dataset")
        .join("episode_000000.bin");
    let record = EpisodeRecord::load(&path).unwrap();
    assert_eq!(record.sample_count(), status.samples);
    assert_eq!(record.metadata.freq_hz, 10);
    assert_eq!(record.metadata.robots[0].serial, "MOCK-0001");
    assert_eq!(record.cameras[0].identifier, "camera-0");
    assert!(record.validate());

    // 相邻时间戳近似一个周期（100ms），允许调度抖动
    for pair in record.timestamp_us.windows(2) {
        let delta = pair[1] - pair[0];
        assert!(
            (50_000..=150_000).contains(&delta),
            "tick spacing {}us out of range",
            delta
        );
    }
}

#[test]
fn camera_stall_with_hold_last_marks_degraded_never_silent() {
    let rig = rig();
    let engine = engine(
        &rig,
        EngineConfig {
            freq_hz: 20,
            stall_policy: StallPolicy::HoldLast,
            ..Default::default()
        },
    );

    engine
        .start(
            rig.robots.active_handles(),
            rig.cameras.active_handles(),
            "demo",
        )
        .unwrap();
    std::thread::sleep(Duration::from_millis(300));
    // 永久失速：最新帧停更，之后每拍都越出偏差窗口
    rig.camera_script.lock().unwrap().stall_from_sequence = Some(0);
    std::thread::sleep(Duration::from_millis(300));
    let status = engine.stop().unwrap();

    assert!(status.degraded_samples > 0, "stalled frames must be marked");
    assert!(
        status.samples > status.degraded_samples,
        "samples before the stall were fresh"
    );
    assert_eq!(status.dropped_ticks, 0, "hold-last never drops ticks");

    engine.save().unwrap();
    let record = EpisodeRecord::load(
        rig.dataset_dir
            .path()
            .join("demo")
            .join("episode_000000.bin"),
    )
    .unwrap();
    // 降级样本在相机轨道上对应 held 标记，复用不是无痕的
    let held: usize = record.cameras[0].held.iter().filter(|h| **h).count();
    assert!(held >= status.degraded_samples);
    // tick 序号连续无洞
    for pair in record.tick_index.windows(2) {
        assert_eq!(pair[1], pair[0] + 1);
    }
}

#[test]
fn camera_stall_with_abort_tick_drops_ticks() {
    let rig = rig();
    // 开录前就让相机永久失速：最新一帧很快越出偏差窗口
    rig.camera_script.lock().unwrap().stall_from_sequence = Some(0);
    let engine = engine(
        &rig,
        EngineConfig {
            freq_hz: 50,
            stall_policy: StallPolicy::AbortTick,
            ..Default::default()
        },
    );

    engine
        .start(
            rig.robots.active_handles(),
            rig.cameras.active_handles(),
            "demo",
        )
        .unwrap();
    std::thread::sleep(Duration::from_millis(400));
    let status = engine.stop().unwrap();

    // 失速期间的 tick 被整体丢弃并计数，而不是带着旧帧入列
    assert!(status.dropped_ticks > 0, "aborted ticks must be counted");
    assert!(
        status.samples <= 3,
        "only ticks before the frame went stale may survive, got {}",
        status.samples
    );
    engine.discard().unwrap();
}

#[test]
fn episode_indices_are_monotone_and_samples_do_not_leak() {
    let rig = rig();
    let engine = engine(
        &rig,
        EngineConfig {
            freq_hz: 50,
            ..Default::default()
        },
    );

    engine
        .start(rig.robots.active_handles(), Vec::new(), "demo")
        .unwrap();
    std::thread::sleep(Duration::from_millis(300));
    let first = engine.stop().unwrap();
    let first_index = engine.save().unwrap();

    engine
        .start(rig.robots.active_handles(), Vec::new(), "demo")
        .unwrap();
    std::thread::sleep(Duration::from_millis(100));
    let second = engine.stop().unwrap();
    let second_index = engine.save().unwrap();

    assert_eq!(first_index, 0);
    assert_eq!(second_index, 1);

    let dir = rig.dataset_dir.path().join("demo");
    let ep0 = EpisodeRecord::load(dir.join("episode_000000.bin")).unwrap();
    let ep1 = EpisodeRecord::load(dir.join("episode_000001.bin")).unwrap();
    assert_eq!(ep0.metadata.episode_index, 0);
    assert_eq!(ep1.metadata.episode_index, 1);
    // 前一片段的样本不会漏进新片段
    assert_eq!(ep0.sample_count(), first.samples);
    assert_eq!(ep1.sample_count(), second.samples);
    assert!(ep1.sample_count() < ep0.sample_count());
}

#[test]
fn save_failure_retains_sealed_buffer_for_retry() {
    let rig = rig();
    // 数据集根指向一个普通文件，目录创建必然失败
    let blocked_root = rig.dataset_dir.path().join("not-a-dir");
    std::fs::write(&blocked_root, b"occupied").unwrap();
    let engine = RecordingEngine::new(
        EngineConfig {
            freq_hz: 100,
            ..Default::default()
        },
        &blocked_root,
    );

    engine
        .start(rig.robots.active_handles(), Vec::new(), "demo")
        .unwrap();
    std::thread::sleep(Duration::from_millis(100));
    let sealed = engine.stop().unwrap();

    let err = engine.save().unwrap_err();
    assert!(matches!(err, EngineError::DatasetWriteFailed(_)));

    // 缓冲原样保留，可显式丢弃
    let status = engine.status();
    assert_eq!(status.state, RecorderState::Sealed);
    assert_eq!(status.samples, sealed.samples);
    engine.discard().unwrap();
    assert_eq!(engine.status().state, RecorderState::Idle);
}

#[test]
fn robot_read_failures_degrade_samples_with_held_positions() {
    let rig = rig();
    rig.robot_script.lock().unwrap().positions = vec![0.5; 6];
    let engine = engine(
        &rig,
        EngineConfig {
            freq_hz: 50,
            ..Default::default()
        },
    );

    engine
        .start(rig.robots.active_handles(), Vec::new(), "demo")
        .unwrap();
    std::thread::sleep(Duration::from_millis(150));
    // 之后所有读取失败：状态停更，采样回退到上次已知位置并标记降级
    rig.robot_script.lock().unwrap().fail_next_reads = usize::MAX;
    std::thread::sleep(Duration::from_millis(250));
    let status = engine.stop().unwrap();

    assert!(status.degraded_samples > 0, "stale reads must mark samples");
    assert!(
        status.samples > status.degraded_samples,
        "early samples were fresh"
    );

    engine.save().unwrap();
    let record = EpisodeRecord::load(
        rig.dataset_dir
            .path()
            .join("demo")
            .join("episode_000000.bin"),
    )
    .unwrap();
    let track = &record.robots[0];
    let stale_count = track.stale.iter().filter(|s| **s).count();
    assert_eq!(stale_count, status.degraded_samples);
    // 降级样本沿用上次已知位置
    let last = record.sample_count() - 1;
    assert!(track.stale[last]);
    assert!((track.positions_at(last)[0] - 0.5).abs() < 1e-9);
}
