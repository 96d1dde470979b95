//! 应用上下文
//!
//! 两种模式（one-shot / shell）共用的装配逻辑：加载配置、打开标定
//! 存储、按配置与编译特性注册驱动工厂和相机后端、构造录制引擎。
//! 所有注册表都挂在这一个显式实例上，没有全局状态。

use anyhow::{Context, Result};
use magpie_camera::provider::{CameraProvider, ScanLimits};
use magpie_engine::{
    CameraManager, ConnectionManager, EngineConfig, RecordingEngine, StallPolicy,
};
use magpie_hw::driver::DriverFactory;
use magpie_hw::scan::ScanOptions;
use magpie_store::MagpieConfig;
use magpie_store::calibration::CalibrationStore;
use magpie_store::config::home_dir;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// 一次 CLI 会话的全部装配
pub struct AppContext {
    pub config: MagpieConfig,
    pub robots: ConnectionManager,
    pub cameras: CameraManager,
    pub engine: RecordingEngine,
}

impl AppContext {
    /// 按配置装配；`freq` / `policy` 覆盖配置里的录制默认值
    pub fn new(freq: Option<u32>, policy: Option<StallPolicy>) -> Result<Self> {
        let config = MagpieConfig::load_default().context("failed to locate app home")?;
        debug!(?config, "configuration loaded");

        let robots = ConnectionManager::new(
            robot_factories(),
            CalibrationStore::open_default().context("failed to open calibration store")?,
        );
        let cameras = CameraManager::new(
            camera_providers(&config),
            CalibrationStore::open_default().context("failed to open calibration store")?,
        );

        let engine_config = EngineConfig {
            freq_hz: freq.unwrap_or(config.default_freq),
            stall_policy: policy.unwrap_or(StallPolicy::HoldLast),
            ..Default::default()
        };
        let recordings = home_dir()
            .context("failed to locate app home")?
            .join("recordings");
        let engine = RecordingEngine::new(engine_config, recordings);

        Ok(Self {
            config,
            robots,
            cameras,
            engine,
        })
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            enable_can: self.config.enable_can,
            max_can_interfaces: self.config.max_can_interfaces,
            ..Default::default()
        }
    }

    pub fn scan_limits(&self) -> ScanLimits {
        ScanLimits {
            max_index: self.config.max_opencv_index,
            ..Default::default()
        }
    }

    /// 扫描并连接所有机器人，返回活跃句柄
    pub fn connect_robots(&self) -> Vec<Arc<magpie_engine::RobotHandle>> {
        self.robots.scan_and_resolve(&self.scan_options());
        self.robots.active_handles()
    }

    /// 扫描并打开所有相机流（`enable_cameras: false` 时跳过）
    pub fn connect_cameras(&self) -> Vec<Arc<magpie_engine::CameraHandle>> {
        if !self.config.enable_cameras {
            debug!("cameras disabled by configuration");
            return Vec::new();
        }
        self.cameras.scan_and_resolve(&self.scan_limits());
        self.cameras.active_handles()
    }

    /// 会话收尾：停工作线程、放总线
    pub fn teardown(&self) {
        self.robots.shutdown();
        self.cameras.shutdown();
    }
}

fn robot_factories() -> Vec<Box<dyn DriverFactory>> {
    #[allow(unused_mut)]
    let mut factories: Vec<Box<dyn DriverFactory>> = Vec::new();

    #[cfg(feature = "serial-bus")]
    factories.push(Box::new(magpie_hw::feetech::FeetechFactory));

    #[cfg(target_os = "linux")]
    factories.push(Box::new(magpie_hw::can_arm::CanArmFactory));

    #[cfg(feature = "mock")]
    factories.push(Box::new(magpie_hw::mock::MockArmFactory::default()));

    factories
}

fn camera_providers(config: &MagpieConfig) -> Vec<Box<dyn CameraProvider>> {
    #[allow(unused_mut)]
    let mut providers: Vec<Box<dyn CameraProvider>> = Vec::new();

    #[cfg(all(target_os = "linux", feature = "v4l2"))]
    providers.push(Box::new(magpie_camera::v4l2::V4lProvider));

    #[cfg(feature = "mock")]
    {
        providers.push(Box::new(magpie_camera::mock::MockCameraProvider::generic(1)));
        if config.enable_realsense {
            providers.push(Box::new(magpie_camera::mock::MockCameraProvider::depth(&[
                "829212070982",
            ])));
        }
    }

    #[cfg(not(feature = "mock"))]
    let _ = config;

    providers
}

/// 录制命令里等待用的小工具：睡到时限或中断标志
pub fn sleep_until(deadline: Option<std::time::Instant>, interrupted: &std::sync::atomic::AtomicBool) {
    use std::sync::atomic::Ordering;
    loop {
        if interrupted.load(Ordering::Acquire) {
            return;
        }
        if let Some(deadline) = deadline {
            if std::time::Instant::now() >= deadline {
                return;
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
