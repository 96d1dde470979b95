//! One-shot 命令实现
//!
//! 每条命令对应引擎层的一个公开操作，返回结构化的 [`CommandOutcome`]
//! （ok / 退出码 / 人类可读消息），由 `main` 统一映射进程退出码。

use crate::context::{AppContext, sleep_until};
use anyhow::Result;
use magpie_engine::EngineError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

/// 一条命令的结构化结果
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub ok: bool,
    pub code: i32,
    pub message: String,
}

impl CommandOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            code: 0,
            message: message.into(),
        }
    }

    pub fn from_error(error: &EngineError) -> Self {
        Self {
            ok: false,
            code: error.exit_code(),
            message: format!("{:#}", error),
        }
    }

    pub fn print(&self) {
        if self.ok {
            println!("✅ {}", self.message);
        } else {
            eprintln!("❌ {}", self.message);
        }
    }
}

impl From<Result<CommandOutcome, EngineError>> for CommandOutcome {
    fn from(result: Result<CommandOutcome, EngineError>) -> Self {
        match result {
            Ok(outcome) => outcome,
            Err(e) => CommandOutcome::from_error(&e),
        }
    }
}

/// `robot list`：扫描所有总线并解析每个候选设备
pub fn robot_list(ctx: &AppContext) -> CommandOutcome {
    let snapshots = ctx.robots.scan_and_resolve(&ctx.scan_options());
    if snapshots.is_empty() {
        println!("(no candidate devices on any bus)");
    }
    let mut connected = 0;
    for snapshot in &snapshots {
        println!("{}", snapshot);
        if matches!(snapshot.status, magpie_engine::SlotStatus::Connected { .. }) {
            connected += 1;
        }
    }
    CommandOutcome::success(format!(
        "{} candidate(s), {} connected",
        snapshots.len(),
        connected
    ))
}

/// `robot calibrate <slot>`：标定扫程 + 档案原子落盘
pub fn robot_calibrate(ctx: &AppContext, slot: usize) -> CommandOutcome {
    ctx.robots.scan_and_resolve(&ctx.scan_options());
    println!("⏳ 标定扫程进行中：请逐关节推到行程两端...");
    match ctx.robots.calibrate(slot) {
        Ok(profile) => CommandOutcome::success(format!(
            "calibration saved for serial {} ({} joints)",
            profile.serial,
            profile.as_joints().map(|j| j.joint_count()).unwrap_or(0)
        )),
        Err(e) => CommandOutcome::from_error(&e),
    }
}

/// `camera list`：枚举 + 打开全部相机流
pub fn camera_list(ctx: &AppContext) -> CommandOutcome {
    if !ctx.config.enable_cameras {
        return CommandOutcome::success("cameras disabled by configuration");
    }
    let snapshots = ctx.cameras.scan_and_resolve(&ctx.scan_limits());
    if snapshots.is_empty() {
        println!("(no cameras found)");
    }
    for snapshot in &snapshots {
        println!("{}", snapshot);
    }
    let streaming = snapshots
        .iter()
        .filter(|s| matches!(s.status, magpie_engine::CameraStatus::Streaming { .. }))
        .count();
    CommandOutcome::success(format!(
        "{} camera(s), {} streaming",
        snapshots.len(),
        streaming
    ))
}

/// `record`：连接 → 录制（到时限或 Ctrl-C）→ 封存 → 保存
pub fn record(ctx: &AppContext, dataset: &str, duration: Option<f64>) -> CommandOutcome {
    let robots = ctx.connect_robots();
    if robots.is_empty() {
        return CommandOutcome::from_error(&EngineError::DeviceNotFound(
            "no robot connected on any bus".to_string(),
        ));
    }
    let cameras = ctx.connect_cameras();

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        if let Err(e) = ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::Release);
        }) {
            warn!(error = %e, "Ctrl-C handler unavailable, relying on duration limit");
        }
    }

    let run = || -> Result<CommandOutcome, EngineError> {
        ctx.engine.start(robots, cameras, dataset)?;
        println!(
            "⏺  recording '{}' at {} Hz ({})",
            dataset,
            ctx.engine.config().freq_hz,
            duration
                .map(|d| format!("{}s", d))
                .unwrap_or_else(|| "until Ctrl-C".to_string())
        );

        let deadline = duration.map(|d| Instant::now() + Duration::from_secs_f64(d));
        sleep_until(deadline, &interrupted);

        let status = ctx.engine.stop()?;
        let index = ctx.engine.save()?;
        Ok(CommandOutcome::success(format!(
            "episode {} saved: {} samples, {} degraded, {} dropped tick(s)",
            index, status.samples, status.degraded_samples, status.dropped_ticks
        )))
    };
    let outcome = run().into();
    ctx.teardown();
    outcome
}

/// `config show`：当前生效配置（含默认值）
pub fn config_show(ctx: &AppContext) -> CommandOutcome {
    match serde_yaml::to_string(&ctx.config) {
        Ok(yaml) => {
            print!("{}", yaml);
            CommandOutcome::success("configuration printed")
        }
        Err(e) => CommandOutcome {
            ok: false,
            code: 1,
            message: format!("failed to render configuration: {}", e),
        },
    }
}
