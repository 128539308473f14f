//! 重试 / 冷却策略：纯函数 (失败类别, 同类连续次数) → 决策
//!
//! - TRANSIENT：第一次失败等待固定延迟后重试同一端点，不冷却；之后按阶梯冷却该端点
//! - AUTH：不重试，整个提供方进入长时间冷却
//! - BILLING：不重试，整个提供方按阶梯冷却
//!
//! 阶梯只在同类连续失败时前进，到末级封顶；成功或类别变化后回到第一级。

use std::time::Duration;

use crate::config::ResilienceSection;
use crate::health::FailureClass;

/// 下一步动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// 等待 delay 后重试同一端点
    RetrySame { delay: Duration },
    /// 换下一个可用端点
    Failover,
}

/// 冷却作用范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownScope {
    Endpoint,
    /// 同一提供方的全部端点
    Provider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cooldown {
    pub duration: Duration,
    pub scope: CooldownScope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyDecision {
    pub action: RetryAction,
    pub cooldown: Option<Cooldown>,
}

/// 冷却策略（阶梯与延迟都是数据）
#[derive(Debug, Clone)]
pub struct CooldownPolicy {
    pub immediate_retry_delay: Duration,
    pub immediate_retries: u32,
    pub transient_ladder: Vec<Duration>,
    pub billing_ladder: Vec<Duration>,
    pub auth_cooldown: Duration,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self::from_config(&ResilienceSection::default())
    }
}

fn secs(list: &[u64]) -> Vec<Duration> {
    list.iter().map(|s| Duration::from_secs(*s)).collect()
}

fn ladder_step(ladder: &[Duration], index: usize) -> Option<Duration> {
    if ladder.is_empty() {
        return None;
    }
    Some(ladder[index.min(ladder.len() - 1)])
}

impl CooldownPolicy {
    pub fn from_config(section: &ResilienceSection) -> Self {
        Self {
            immediate_retry_delay: Duration::from_millis(section.immediate_retry_delay_ms),
            immediate_retries: section.immediate_retries,
            transient_ladder: secs(&section.transient_ladder_secs),
            billing_ladder: secs(&section.billing_ladder_secs),
            auth_cooldown: Duration::from_secs(section.auth_cooldown_secs),
        }
    }

    /// streak 是包含本次在内的同类连续失败次数（≥ 1）
    pub fn decide(&self, class: FailureClass, streak: u32) -> PolicyDecision {
        let streak = streak.max(1);
        match class {
            FailureClass::Transient => {
                if streak <= self.immediate_retries {
                    return PolicyDecision {
                        action: RetryAction::RetrySame {
                            delay: self.immediate_retry_delay,
                        },
                        cooldown: None,
                    };
                }
                let index = (streak - self.immediate_retries - 1) as usize;
                PolicyDecision {
                    action: RetryAction::Failover,
                    cooldown: ladder_step(&self.transient_ladder, index).map(|duration| Cooldown {
                        duration,
                        scope: CooldownScope::Endpoint,
                    }),
                }
            }
            FailureClass::Auth => PolicyDecision {
                action: RetryAction::Failover,
                cooldown: Some(Cooldown {
                    duration: self.auth_cooldown,
                    scope: CooldownScope::Provider,
                }),
            },
            FailureClass::Billing => PolicyDecision {
                action: RetryAction::Failover,
                cooldown: ladder_step(&self.billing_ladder, (streak - 1) as usize).map(|duration| {
                    Cooldown {
                        duration,
                        scope: CooldownScope::Provider,
                    }
                }),
            },
        }
    }

    /// 该类别最短的冷却（HALF_OPEN 探测失败而决策本身不含冷却时使用）
    pub fn first_step(&self, class: FailureClass) -> Cooldown {
        match class {
            FailureClass::Transient => Cooldown {
                duration: self
                    .transient_ladder
                    .first()
                    .copied()
                    .unwrap_or(self.immediate_retry_delay),
                scope: CooldownScope::Endpoint,
            },
            FailureClass::Auth => Cooldown {
                duration: self.auth_cooldown,
                scope: CooldownScope::Provider,
            },
            FailureClass::Billing => Cooldown {
                duration: self
                    .billing_ladder
                    .first()
                    .copied()
                    .unwrap_or(self.auth_cooldown),
                scope: CooldownScope::Provider,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: u64 = 60;
    const HOUR: u64 = 3600;

    #[test]
    fn test_transient_retries_once_then_climbs_ladder() {
        let policy = CooldownPolicy::default();

        let first = policy.decide(FailureClass::Transient, 1);
        assert_eq!(
            first.action,
            RetryAction::RetrySame {
                delay: Duration::from_millis(1500)
            }
        );
        assert!(first.cooldown.is_none());

        let expected = [MIN, 5 * MIN, HOUR, HOUR, HOUR];
        for (i, secs) in expected.iter().enumerate() {
            let d = policy.decide(FailureClass::Transient, i as u32 + 2);
            assert_eq!(d.action, RetryAction::Failover);
            assert_eq!(
                d.cooldown,
                Some(Cooldown {
                    duration: Duration::from_secs(*secs),
                    scope: CooldownScope::Endpoint
                })
            );
        }
    }

    #[test]
    fn test_auth_is_long_provider_cooldown() {
        let d = CooldownPolicy::default().decide(FailureClass::Auth, 1);
        assert_eq!(d.action, RetryAction::Failover);
        assert_eq!(
            d.cooldown,
            Some(Cooldown {
                duration: Duration::from_secs(6 * HOUR),
                scope: CooldownScope::Provider
            })
        );
    }

    #[test]
    fn test_billing_ladder_caps_at_last_step() {
        let policy = CooldownPolicy::default();
        let steps: Vec<u64> = (1..=4)
            .map(|s| policy.decide(FailureClass::Billing, s).cooldown.unwrap().duration.as_secs())
            .collect();
        assert_eq!(steps, vec![5 * HOUR, 12 * HOUR, 24 * HOUR, 24 * HOUR]);
    }

    #[test]
    fn test_empty_ladder_means_no_cooldown() {
        let policy = CooldownPolicy {
            transient_ladder: Vec::new(),
            ..CooldownPolicy::default()
        };
        let d = policy.decide(FailureClass::Transient, 3);
        assert_eq!(d.action, RetryAction::Failover);
        assert!(d.cooldown.is_none());
        assert_eq!(policy.first_step(FailureClass::Transient).duration, Duration::from_millis(1500));
    }
}
