//! # 时间戳处理
//!
//! 两种时间来源，用途不同：
//!
//! | 来源 | 单位 | 用途 |
//! |------|------|------|
//! | 单调时钟 | µs | 样本间偏差判定、tick 对齐（进程内基准） |
//! | 墙钟 | s | 片段/标定档案的创建时间（跨进程可读） |
//!
//! 单调时钟的零点是进程内首次调用时刻，所有 crate 共用同一个零点，
//! 因此机器人读取与相机帧的时间戳可以直接比较。

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// 进程级单调时钟（微秒）
pub fn monotonic_us() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Unix 墙钟（秒）
pub fn unix_time_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_is_nondecreasing() {
        let a = monotonic_us();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = monotonic_us();
        assert!(b > a);
    }

    #[test]
    fn unix_time_is_sane() {
        // 2020-01-01 之后
        assert!(unix_time_s() > 1_577_836_800);
    }
}
