//! # Magpie CLI
//!
//! 机器人数据采集命令行工具。
//!
//! ## 双模式架构
//!
//! ### One-shot 模式（推荐用于 CI/脚本）
//!
//! ```bash
//! # 设备发现
//! magpie-cli robot list
//! magpie-cli camera list
//!
//! # 标定槽位 0 的机械臂
//! magpie-cli robot calibrate 0
//!
//! # 录一段 30 秒、20Hz 的片段
//! magpie-cli record --dataset pick_place --freq 20 --duration 30
//! ```
//!
//! ### REPL 模式（推荐用于采集现场）
//!
//! ```bash
//! $ magpie-cli shell
//! magpie> robot list
//! magpie> record start pick_place
//! magpie> record stop
//! magpie> record save
//! magpie> exit
//! ```
//!
//! 退出码：0 成功；2 未找到设备；3 已在录制中；4 设备未标定；
//! 5 没有录制可停止；6 连接超时；1 其他错误。

use clap::{Parser, Subcommand};
use magpie_engine::StallPolicy;

mod commands;
mod context;
mod repl;

use commands::CommandOutcome;
use context::AppContext;

/// Magpie CLI - 机器人数据采集工具
#[derive(Parser, Debug)]
#[command(name = "magpie-cli")]
#[command(about = "Command-line interface for Magpie robot data capture", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 机器人发现与标定
    #[command(subcommand)]
    Robot(RobotCommand),

    /// 相机发现
    #[command(subcommand)]
    Camera(CameraCommand),

    /// 录制一个片段（连接 -> 录制 -> 封存 -> 保存）
    Record {
        /// 数据集名（缺省取配置里的 default_dataset_name）
        #[arg(long)]
        dataset: Option<String>,

        /// 采样频率 Hz（缺省取配置里的 default_freq）
        #[arg(long)]
        freq: Option<u32>,

        /// 录制时长（秒）；省略则录到 Ctrl-C
        #[arg(long)]
        duration: Option<f64>,

        /// 相机失速时丢弃整个 tick（默认复用上一帧并打降级标记）
        #[arg(long)]
        abort_on_stall: bool,
    },

    /// 配置管理
    #[command(subcommand)]
    Config(ConfigCommand),

    /// 启动交互式 Shell（REPL 模式）
    Shell,
}

#[derive(Subcommand, Debug)]
enum RobotCommand {
    /// 扫描所有总线并连接
    List,
    /// 对指定槽位执行标定扫程并落盘
    Calibrate { slot: usize },
}

#[derive(Subcommand, Debug)]
enum CameraCommand {
    /// 枚举并打开所有相机流
    List,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// 打印当前生效配置（含默认值）
    Show,
}

fn main() {
    // 初始化日志：未设置 RUST_LOG 时兜底为全局 warn，
    // 保证配置损坏、总线跳过、读失败降级等告警默认可见
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let outcome = run(cli).unwrap_or_else(|e| CommandOutcome {
        ok: false,
        code: 1,
        message: format!("{:#}", e),
    });
    outcome.print();
    std::process::exit(outcome.code);
}

fn run(cli: Cli) -> anyhow::Result<CommandOutcome> {
    let outcome = match cli.command {
        Commands::Robot(RobotCommand::List) => {
            let ctx = AppContext::new(None, None)?;
            let outcome = commands::robot_list(&ctx);
            ctx.teardown();
            outcome
        }

        Commands::Robot(RobotCommand::Calibrate { slot }) => {
            let ctx = AppContext::new(None, None)?;
            let outcome = commands::robot_calibrate(&ctx, slot);
            ctx.teardown();
            outcome
        }

        Commands::Camera(CameraCommand::List) => {
            let ctx = AppContext::new(None, None)?;
            let outcome = commands::camera_list(&ctx);
            ctx.teardown();
            outcome
        }

        Commands::Record {
            dataset,
            freq,
            duration,
            abort_on_stall,
        } => {
            let policy = abort_on_stall.then_some(StallPolicy::AbortTick);
            let ctx = AppContext::new(freq, policy)?;
            let dataset = dataset.unwrap_or_else(|| ctx.config.default_dataset_name.clone());
            commands::record(&ctx, &dataset, duration)
        }

        Commands::Config(ConfigCommand::Show) => {
            let ctx = AppContext::new(None, None)?;
            commands::config_show(&ctx)
        }

        Commands::Shell => {
            let ctx = AppContext::new(None, None)?;
            repl::run_shell(&ctx)?;
            CommandOutcome::success("session closed")
        }
    };
    Ok(outcome)
}
