use std::collections::VecDeque;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// core 输出的一行
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    /// 产生该行的启动代次
    pub generation: u64,
    pub stream: LogStream,
    pub text: String,
    /// Unix 毫秒
    pub at: u64,
}

/// 定长日志缓冲，满了丢最旧的
#[derive(Debug)]
pub struct LogRing {
    capacity: usize,
    lines: VecDeque<LogLine>,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            lines: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn push(&mut self, line: LogLine) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 从旧到新
    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.iter().cloned().collect()
    }

    /// 最近 `n` 行
    pub fn tail(&self, n: usize) -> Vec<LogLine> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str) -> LogLine {
        LogLine {
            generation: 1,
            stream: LogStream::Stdout,
            text: text.into(),
            at: 0,
        }
    }

    #[test]
    fn oldest_evicted_at_capacity() {
        let mut ring = LogRing::new(3);
        for t in ["a", "b", "c", "d", "e"] {
            ring.push(line(t));
        }
        assert_eq!(ring.len(), 3);
        let texts: Vec<_> = ring.lines().into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["c", "d", "e"]);
    }

    #[test]
    fn tail_returns_newest() {
        let mut ring = LogRing::new(10);
        for t in ["a", "b", "c"] {
            ring.push(line(t));
        }
        let texts: Vec<_> = ring.tail(2).into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["b", "c"]);
        assert_eq!(ring.tail(10).len(), 3);
    }

    #[test]
    fn zero_capacity_keeps_one_line() {
        let mut ring = LogRing::new(0);
        ring.push(line("a"));
        ring.push(line("b"));
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.lines()[0].text, "b");
    }
}
