use std::env;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::warn;

use crate::commission::{CommissionPolicy, CommissionSchedule};
use crate::domain::{Money, UserId};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub terminal_key: String,
    /// Shared secret for request tokens and webhook verification.
    pub password: String,
    pub timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://securepay.tinkoff.ru".to_string(),
            terminal_key: String::new(),
            password: String::new(),
            timeout: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WithdrawalConfig {
    pub min_amount: Money,
    pub max_per_window: usize,
    pub window: Duration,
    pub daily_limit: Money,
    /// Withdrawals this soon after a deposit are flagged, not blocked.
    pub soft_flag_after_deposit: Duration,
}

impl Default for WithdrawalConfig {
    fn default() -> Self {
        Self {
            min_amount: Money::from_units(1000),
            max_per_window: 3,
            window: Duration::from_secs(86_400),
            daily_limit: Money::from_units(150_000),
            soft_flag_after_deposit: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Account that receives commissions.
    pub platform_account: UserId,
    pub gateway: GatewayConfig,
    pub withdrawal: WithdrawalConfig,
    pub commission: CommissionSchedule,
    pub commission_policy: CommissionPolicy,
    pub xp_per_task: u32,
    pub effects_capacity: usize,
    pub webhook_bind: String,
    /// How often `serve` retries unconfirmed captures and polls stale payouts.
    pub capture_sweep: Duration,
    /// Age after which a payout with no final notification is polled.
    pub payout_poll_after: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            platform_account: 0,
            gateway: GatewayConfig::default(),
            withdrawal: WithdrawalConfig::default(),
            commission: CommissionSchedule::default(),
            commission_policy: CommissionPolicy::default(),
            xp_per_task: 50,
            effects_capacity: 256,
            webhook_bind: "0.0.0.0:8080".to_string(),
            capture_sweep: Duration::from_secs(300),
            payout_poll_after: Duration::from_secs(600),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let commission = match env::var("COMMISSION_TIERS") {
            Ok(pairs) => {
                let base = env_or("COMMISSION_BASE_RATE", Decimal::new(20, 2));
                CommissionSchedule::parse(base, &pairs).unwrap_or_else(|e| {
                    warn!(error = %e, "ignoring COMMISSION_TIERS");
                    defaults.commission.clone()
                })
            }
            Err(_) => defaults.commission.clone(),
        };

        Self {
            platform_account: env_or("ENGINE_PLATFORM_ACCOUNT", defaults.platform_account),
            gateway: GatewayConfig {
                base_url: env_or("GATEWAY_BASE_URL", defaults.gateway.base_url),
                terminal_key: env_or("GATEWAY_TERMINAL_KEY", defaults.gateway.terminal_key),
                password: env_or("GATEWAY_PASSWORD", defaults.gateway.password),
                timeout: Duration::from_millis(env_or("GATEWAY_TIMEOUT_MS", 10_000u64)),
            },
            withdrawal: WithdrawalConfig {
                min_amount: env_or("WITHDRAWAL_MIN_AMOUNT", defaults.withdrawal.min_amount),
                max_per_window: env_or(
                    "WITHDRAWAL_MAX_PER_WINDOW",
                    defaults.withdrawal.max_per_window,
                ),
                window: Duration::from_secs(env_or("WITHDRAWAL_WINDOW_SECS", 86_400u64)),
                daily_limit: env_or("WITHDRAWAL_DAILY_LIMIT", defaults.withdrawal.daily_limit),
                soft_flag_after_deposit: Duration::from_secs(env_or(
                    "WITHDRAWAL_SOFT_FLAG_SECS",
                    600u64,
                )),
            },
            commission,
            commission_policy: env_or("COMMISSION_POLICY", defaults.commission_policy),
            xp_per_task: env_or("XP_PER_TASK", defaults.xp_per_task),
            effects_capacity: env_or("EFFECTS_CAPACITY", defaults.effects_capacity),
            webhook_bind: env_or("WEBHOOK_BIND", defaults.webhook_bind),
            capture_sweep: Duration::from_secs(env_or("CAPTURE_SWEEP_SECS", 300u64)),
            payout_poll_after: Duration::from_secs(env_or("PAYOUT_POLL_AFTER_SECS", 600u64)),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "unparseable config value, using default");
            default
        }),
        Err(_) => default,
    }
}
