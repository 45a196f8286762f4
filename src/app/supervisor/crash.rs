//! 崩溃计数与重启退避

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 滑动窗口崩溃计数：`window` 内累计 `threshold` 次即判定为崩溃循环
#[derive(Debug)]
pub struct CrashWindow {
    threshold: usize,
    window: Duration,
    events: VecDeque<Instant>,
}

impl CrashWindow {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            events: VecDeque::new(),
        }
    }

    /// 记录一次崩溃，返回窗口内（含本次）的崩溃次数
    pub fn record(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.events.push_back(now);
        self.events.len()
    }

    /// 窗口内的崩溃次数
    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.events.len()
    }

    pub fn is_tripped(&self, count: usize) -> bool {
        count >= self.threshold
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn reset(&mut self) {
        self.events.clear();
    }

    fn prune(&mut self, now: Instant) {
        while let Some(first) = self.events.front() {
            if now.saturating_duration_since(*first) >= self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}

/// 第 n 次崩溃后的等待：`base * 2^(n-1)`，不超过 `max`
pub fn backoff_delay(base: Duration, max: Duration, crashes: usize) -> Duration {
    let exp = crashes.saturating_sub(1).min(16) as u32;
    base.saturating_mul(1u32 << exp).min(max)
}
