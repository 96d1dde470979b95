//! REPL 模式（交互式 Shell）
//!
//! 设备连接与录制状态在整个会话内保持：`robot list` 连上的机械臂
//! 可以直接 `record start`，不需要每条命令重新扫描。Ctrl-C 在录制中
//! 表示封存当前片段，空闲时提示用 `exit` 退出。

use crate::commands::{self, CommandOutcome};
use crate::context::AppContext;
use anyhow::Result;
use magpie_engine::{ConnectionEvent, ConnectionEventKind, EngineError, RecorderState};
use rustyline::Editor;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;

const HISTORY_FILE: &str = ".magpie_history";

/// 运行交互式 Shell
pub fn run_shell(ctx: &AppContext) -> Result<()> {
    let mut rl = Editor::<(), DefaultHistory>::new()
        .map_err(|e| anyhow::anyhow!("failed to initialize readline: {}", e))?;
    rl.load_history(HISTORY_FILE).ok(); // 首次运行没有历史

    println!("Magpie CLI v{} - 交互式 Shell", env!("CARGO_PKG_VERSION"));
    println!("输入 'help' 查看帮助，'exit' 退出");
    println!();

    let events = ctx.robots.events();
    loop {
        // 后台读线程的降级事件在每条命令之间浮出，不依赖日志级别
        for event in events.try_iter() {
            eprintln!("⚠️  {}", connection_alert(&event));
        }

        match rl.readline("magpie> ") {
            Ok(line) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                rl.add_history_entry(line.as_str()).ok();

                if line == "exit" || line == "quit" {
                    break;
                }
                dispatch(ctx, &line).print();
            }

            Err(ReadlineError::Interrupted) => {
                // Ctrl-C：录制中 = 封存当前片段，空闲 = 提示退出方式
                if ctx.engine.status().state == RecorderState::Recording {
                    eprintln!("\n🛑 Ctrl-C：封存当前录制");
                    match ctx.engine.stop() {
                        Ok(status) => println!(
                            "⏹  sealed: {} samples ('record save' 保存，'record discard' 丢弃)",
                            status.samples
                        ),
                        Err(e) => eprintln!("❌ {}", e),
                    }
                } else {
                    println!("^C (use 'exit' to quit)");
                }
            }

            Err(ReadlineError::Eof) => break,

            Err(e) => {
                eprintln!("readline error: {:?}", e);
                break;
            }
        }
    }

    rl.save_history(HISTORY_FILE).ok();
    seal_on_exit(ctx);
    ctx.teardown();
    println!("👋 再见！");
    Ok(())
}

/// 退出前封存仍在进行的录制（未保存的片段随进程回收）
fn seal_on_exit(ctx: &AppContext) {
    if ctx.engine.status().state == RecorderState::Recording {
        if let Ok(status) = ctx.engine.stop() {
            eprintln!(
                "⚠️  exiting with an active recording: sealed {} samples (unsaved, will be discarded)",
                status.samples
            );
        }
    }
}

fn dispatch(ctx: &AppContext, line: &str) -> CommandOutcome {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        ["help"] => {
            print_help();
            CommandOutcome::success("see above")
        }

        ["robot", "list"] => commands::robot_list(ctx),
        ["calibrate", slot] | ["robot", "calibrate", slot] => match slot.parse::<usize>() {
            Ok(slot) => commands::robot_calibrate(ctx, slot),
            Err(_) => bad_usage(format!("invalid slot index '{}'", slot)),
        },
        ["camera", "list"] => commands::camera_list(ctx),
        ["config", "show"] => commands::config_show(ctx),

        ["record", "start"] => record_start(ctx, &ctx.config.default_dataset_name),
        ["record", "start", dataset] => record_start(ctx, dataset),
        ["record", "stop"] => ctx
            .engine
            .stop()
            .map(|status| {
                CommandOutcome::success(format!(
                    "sealed: {} samples, {} degraded, {} dropped tick(s)",
                    status.samples, status.degraded_samples, status.dropped_ticks
                ))
            })
            .into(),
        ["record", "save"] => ctx
            .engine
            .save()
            .map(|index| CommandOutcome::success(format!("episode {} saved", index)))
            .into(),
        ["record", "discard"] => ctx
            .engine
            .discard()
            .map(|_| CommandOutcome::success("sealed episode discarded"))
            .into(),
        ["record", "status"] => {
            let status = ctx.engine.status();
            CommandOutcome::success(format!(
                "{:?}: {} samples, {} degraded, {} dropped tick(s){}",
                status.state,
                status.samples,
                status.degraded_samples,
                status.dropped_ticks,
                status
                    .dataset
                    .map(|d| format!(" [dataset {}]", d))
                    .unwrap_or_default()
            ))
        }

        _ => bad_usage(format!("unknown command '{}', try 'help'", line)),
    }
}

/// 用会话里已连接的设备开始录制；没有就先连一轮
fn record_start(ctx: &AppContext, dataset: &str) -> CommandOutcome {
    let mut robots = ctx.robots.active_handles();
    if robots.is_empty() {
        robots = ctx.connect_robots();
    }
    if robots.is_empty() {
        return CommandOutcome::from_error(&EngineError::DeviceNotFound(
            "no robot connected, run 'robot list' first".to_string(),
        ));
    }
    let mut cameras = ctx.cameras.active_handles();
    if cameras.is_empty() {
        cameras = ctx.connect_cameras();
    }

    match ctx.engine.start(robots, cameras, dataset) {
        Ok(()) => CommandOutcome::success(format!(
            "recording '{}' at {} Hz ('record stop' 封存)",
            dataset,
            ctx.engine.config().freq_hz
        )),
        Err(e) => CommandOutcome::from_error(&e),
    }
}

/// 降级事件的操作者提示
fn connection_alert(event: &ConnectionEvent) -> String {
    match event.kind {
        ConnectionEventKind::ReadFailureDemotion { failures } => format!(
            "robot {} (slot {}) disconnected after {} consecutive read failures",
            event.serial, event.slot, failures
        ),
    }
}

fn bad_usage(message: String) -> CommandOutcome {
    CommandOutcome {
        ok: false,
        code: 1,
        message,
    }
}

fn print_help() {
    println!("可用命令：");
    println!("  robot list                 扫描并连接所有机器人");
    println!("  robot calibrate <slot>     对槽位执行标定扫程");
    println!("  camera list                枚举并打开所有相机");
    println!("  record start [dataset]     开始录制（默认数据集名来自配置）");
    println!("  record stop                停止并封存当前片段");
    println!("  record save                保存封存片段到数据集");
    println!("  record discard             丢弃封存片段");
    println!("  record status              录制状态");
    println!("  config show                当前生效配置");
    println!("  exit                       退出");
}
