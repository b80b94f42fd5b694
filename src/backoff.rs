//! 상한이 있는 지수 백오프

use std::time::Duration;

/// 백오프 설정
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// 첫 재시도 대기 시간 (매번 2배)
    pub initial_delay: Duration,
    /// 한 번 대기의 최대값
    pub max_delay: Duration,
    /// 한 장애 구간에서 누적 대기 시간 상한. 넘으면 포기
    pub ceiling: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            ceiling: Duration::from_secs(120),
        }
    }
}

/// 장애 구간 하나에 대한 백오프 상태
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    next: Duration,
    elapsed: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Backoff {
            config,
            next: config.initial_delay,
            elapsed: Duration::ZERO,
            attempts: 0,
        }
    }

    /// 다음 대기 시간. 누적 대기가 상한을 넘으면 `None`
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.next.min(self.config.max_delay);
        if self.elapsed + delay > self.config.ceiling {
            return None;
        }
        self.elapsed += delay;
        self.attempts += 1;
        self.next = std::cmp::min(self.next * 2, self.config.max_delay);
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_until_cap() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            ceiling: Duration::from_secs(10),
        });
        let delays: Vec<u128> = (0..4)
            .filter_map(|_| backoff.next_delay())
            .map(|d| d.as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 350, 350]);
        assert_eq!(backoff.attempts(), 4);
    }

    #[test]
    fn test_ceiling_stops_retries() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(100),
            ceiling: Duration::from_millis(250),
        });
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.elapsed(), Duration::from_millis(200));
    }
}
