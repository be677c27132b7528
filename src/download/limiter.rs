//!
//! # 限速模块
//! 按目标速率对单个分块 worker 进行节流
//!

use std::time::{Duration, Instant};

/// 基于时间的节流器
///
/// 每写入一批数据后比较实际用时和期望用时，落后于期望时让 worker
/// 睡到追平为止。limit 为 0 时完全关闭。
pub struct Pacer {
    limit: u64,
    start: Instant,
    downloaded: u64,
}

impl Pacer {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            start: Instant::now(),
            downloaded: 0,
        }
    }

    /// 记录新写入的字节数，返回需要补眠的时长
    pub fn record(&mut self, bytes: u64) -> Option<Duration> {
        if self.limit == 0 {
            return None;
        }

        self.downloaded += bytes;
        pacing_delay(self.downloaded, self.limit, self.start.elapsed())
    }
}

/// expected = downloaded / limit 秒，落后多少睡多少
fn pacing_delay(downloaded: u64, limit: u64, elapsed: Duration) -> Option<Duration> {
    let expected = Duration::from_secs_f64(downloaded as f64 / limit as f64);
    if elapsed < expected {
        Some(expected - elapsed)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limit_never_sleeps() {
        let mut pacer = Pacer::new(0);
        assert_eq!(pacer.record(10 * 1024 * 1024), None);
    }

    #[test]
    fn sleeps_when_ahead_of_budget() {
        // 1024 字节限速 1024 B/s，瞬间完成应当补眠接近 1 秒
        let delay = pacing_delay(1024, 1024, Duration::from_millis(10)).unwrap();
        assert!(delay > Duration::from_millis(900));
        assert!(delay <= Duration::from_secs(1));
    }

    #[test]
    fn no_sleep_when_behind_budget() {
        // 已经用了 2 秒，只下了 1 秒的量
        assert_eq!(pacing_delay(1024, 1024, Duration::from_secs(2)), None);
    }
}
