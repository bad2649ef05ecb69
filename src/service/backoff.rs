//! 单页重试状态机, 与翻页游标相互独立

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::CrawlConfig;
use crate::models::state::RetryEntry;

/// 自适应退避: base * multiplier^(n-1), 不超过 ceiling
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub multiplier: f64,
    pub ceiling: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &CrawlConfig) -> Self {
        Self {
            max_retries: config.max_retries_per_page,
            base: Duration::from_millis(config.backoff_base_ms),
            multiplier: config.backoff_multiplier,
            ceiling: Duration::from_millis(config.backoff_ceiling_ms),
        }
    }

    /// 第 `failures` 次连续失败后的等待时间; 门户给出 retry-after 时以它为准
    pub fn delay_for(&self, failures: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.ceiling);
        }
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.base.as_millis() as f64 * self.multiplier.max(1.0).powi(exponent);
        let ceiling = self.ceiling.as_millis() as f64;
        if !millis.is_finite() || millis >= ceiling {
            self.ceiling
        } else {
            Duration::from_millis(millis as u64)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// 等待后重试同一页
    RetryAfter { delay: Duration, eligible_at: DateTime<Utc> },
    /// 重试预算耗尽, 放弃该页
    GiveUp,
}

/// 某一页的重试预算
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRetry {
    pub page: u32,
    failures: u32,
    given_up: bool,
}

impl PageRetry {
    pub fn new(page: u32) -> Self {
        Self {
            page,
            failures: 0,
            given_up: false,
        }
    }

    /// 从状态文件里的计数恢复
    pub fn resume(page: u32, entry: Option<&RetryEntry>) -> Self {
        Self {
            page,
            failures: entry.map(|e| e.count).unwrap_or(0),
            given_up: false,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn is_given_up(&self) -> bool {
        self.given_up
    }

    /// 当前是第几次尝试 (从 1 开始)
    pub fn attempt(&self) -> u32 {
        self.failures + 1
    }

    /// 记一次失败 (限流 / 瞬时错误 / 超时); 连续失败达到 max_retries 时放弃
    pub fn record_failure(
        &mut self,
        policy: &BackoffPolicy,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if self.given_up {
            return RetryDecision::GiveUp;
        }
        self.failures += 1;
        if self.failures >= policy.max_retries {
            self.given_up = true;
            return RetryDecision::GiveUp;
        }
        let delay = policy.delay_for(self.failures, retry_after);
        let eligible_at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        RetryDecision::RetryAfter { delay, eligible_at }
    }

    pub fn to_entry(&self, next_eligible_at: DateTime<Utc>, last_error: &str) -> RetryEntry {
        RetryEntry {
            count: self.failures,
            next_eligible_at,
            last_error: Some(last_error.to_string()),
        }
    }
}
