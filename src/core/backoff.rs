//! 指数退避 + 随机抖动
//!
//! delay_for(i) = base * 2^i + uniform[0, jitter)；默认不设上限，配置 max_delay 后只截断指数部分，抖动照常叠加。
//! 指数部分以 u128 纳秒计算，仅在超出 Duration::MAX 时饱和。

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffScheduler {
    base: Duration,
    jitter: Duration,
    max_delay: Option<Duration>,
}

impl BackoffScheduler {
    /// 默认抖动窗口：1 秒
    pub const DEFAULT_JITTER: Duration = Duration::from_secs(1);

    pub fn new(base: Duration) -> Self {
        Self {
            base,
            jitter: Self::DEFAULT_JITTER,
            max_delay: None,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Option<Duration>) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// 第 retry_index 次重试前的确定性部分（不含抖动）
    pub fn exponential_part(&self, retry_index: u32) -> Duration {
        let delay = scale_pow2(self.base, retry_index);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    pub fn delay_for(&self, retry_index: u32) -> Duration {
        self.exponential_part(retry_index)
            .saturating_add(self.sample_jitter())
    }

    fn sample_jitter(&self) -> Duration {
        let window = self.jitter.as_nanos().min(u64::MAX as u128) as u64;
        if window == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::thread_rng().gen_range(0..window))
    }
}

/// base * 2^exp，溢出时饱和到 Duration::MAX
fn scale_pow2(base: Duration, exp: u32) -> Duration {
    const NANOS_PER_SEC: u128 = 1_000_000_000;
    let base_nanos = base.as_nanos();
    if base_nanos == 0 {
        return Duration::ZERO;
    }
    let nanos = 1u128
        .checked_shl(exp)
        .and_then(|factor| base_nanos.checked_mul(factor));
    match nanos {
        Some(n) if n <= Duration::MAX.as_nanos() => {
            Duration::new((n / NANOS_PER_SEC) as u64, (n % NANOS_PER_SEC) as u32)
        }
        _ => Duration::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_within_window() {
        let scheduler = BackoffScheduler::new(Duration::from_millis(500));
        for i in 0..8 {
            let lower = Duration::from_millis(500) * 2u32.pow(i);
            let upper = lower + Duration::from_secs(1);
            for _ in 0..50 {
                let d = scheduler.delay_for(i);
                assert!(d >= lower && d < upper, "retry {i}: {d:?} not in [{lower:?}, {upper:?})");
            }
        }
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let scheduler = BackoffScheduler::new(Duration::from_secs(1)).with_jitter(Duration::ZERO);
        assert_eq!(scheduler.delay_for(0), Duration::from_secs(1));
        assert_eq!(scheduler.delay_for(1), Duration::from_secs(2));
        assert_eq!(scheduler.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn test_zero_base_only_jitter() {
        let scheduler = BackoffScheduler::new(Duration::ZERO);
        for i in 0..4 {
            assert!(scheduler.delay_for(i) < Duration::from_secs(1));
        }
    }

    #[test]
    fn test_cap_applies_to_exponential_part() {
        let scheduler = BackoffScheduler::new(Duration::from_secs(1))
            .with_jitter(Duration::ZERO)
            .with_max_delay(Some(Duration::from_secs(10)));
        assert_eq!(scheduler.delay_for(2), Duration::from_secs(4));
        assert_eq!(scheduler.delay_for(5), Duration::from_secs(10));
    }

    #[test]
    fn test_doubling_continues_past_32() {
        let scheduler = BackoffScheduler::new(Duration::from_millis(1)).with_jitter(Duration::ZERO);
        assert_eq!(scheduler.delay_for(31), Duration::from_millis(1 << 31));
        assert_eq!(scheduler.delay_for(32), Duration::from_millis(1 << 32));
        assert_eq!(scheduler.delay_for(33), Duration::from_millis(1 << 33));
        assert_eq!(scheduler.delay_for(40), Duration::from_millis(1 << 40));
    }

    #[test]
    fn test_large_index_saturates_at_duration_max() {
        let scheduler = BackoffScheduler::new(Duration::from_secs(1));
        assert_eq!(scheduler.exponential_part(100), Duration::MAX);
        assert_eq!(scheduler.exponential_part(u32::MAX), Duration::MAX);
        assert_eq!(scheduler.delay_for(200), Duration::MAX);
        assert_eq!(
            BackoffScheduler::new(Duration::ZERO).exponential_part(u32::MAX),
            Duration::ZERO
        );
    }
}
