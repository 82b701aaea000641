use std::{env, fs, path::Path, str::FromStr, time::Duration};

use alloy_primitives::Address;
use serde::Deserialize;

use crate::{
    agent::scheduler::CronSchedule,
    errors::ConfigError,
    types::{ChainId, MicroUsdc},
};

/// Canonical USDC deployment on Base (6 decimals).
pub const USDC_BASE: &str = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913";

/// One monitored treasury on one chain.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub treasury_address: String,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

/// A tracked ERC-20 position. Reference price and daily volume are static
/// advisory inputs; live market data replaces them at L3 and above.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub address: String,
    #[serde(default)]
    pub usd_price: Option<f64>,
    #[serde(default)]
    pub daily_volume_usd: Option<f64>,
}

impl ChainConfig {
    pub fn chain_id(&self) -> ChainId {
        ChainId::new(self.chain_id)
    }

    pub fn treasury(&self) -> Result<Address, ConfigError> {
        parse_address("chains.treasury_address", &self.treasury_address)
    }
}

/// Risk thresholds feeding the escalation guards.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_lcr_threshold")]
    pub lcr_threshold: f64,
    #[serde(default = "default_lcr_critical")]
    pub lcr_critical: f64,
    #[serde(default = "default_depth_crisis_min_usd")]
    pub depth_crisis_min_usd: f64,
    #[serde(default = "default_participation_rate")]
    pub participation_rate: f64,
    #[serde(default = "default_vol_lookback")]
    pub vol_lookback: usize,
    #[serde(default = "default_projected_outflows_usd")]
    pub projected_outflows_usd: f64,
    #[serde(default = "default_projected_inflows_usd")]
    pub projected_inflows_usd: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            lcr_threshold: default_lcr_threshold(),
            lcr_critical: default_lcr_critical(),
            depth_crisis_min_usd: default_depth_crisis_min_usd(),
            participation_rate: default_participation_rate(),
            vol_lookback: default_vol_lookback(),
            projected_outflows_usd: default_projected_outflows_usd(),
            projected_inflows_usd: default_projected_inflows_usd(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SentinelConfig {
    #[serde(default = "default_budget_limit_usdc")]
    pub budget_limit_usdc: f64,
    #[serde(default = "default_cron_expression")]
    pub cron_expression: String,
    #[serde(default = "default_confirmation_blocks")]
    pub confirmation_blocks: u64,
    #[serde(default = "default_invoice_ttl_seconds")]
    pub invoice_ttl_seconds: u64,
    #[serde(default = "default_settlement_poll_interval_ms")]
    pub settlement_poll_interval_ms: u64,
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u64,
    #[serde(default = "default_minimum_operational_usdc")]
    pub minimum_operational_usdc: f64,
    #[serde(default = "default_warning_threshold_usdc")]
    pub warning_threshold_usdc: f64,
    #[serde(default = "default_grace_period_seconds")]
    pub grace_period_seconds: u64,
    pub chains: Vec<ChainConfig>,
    #[serde(default = "default_usdc_base_address")]
    pub usdc_base_address: String,
    pub gateway_recipient_address: String,
    pub gateway_url: String,
    /// Instrument quoted in market-data requests.
    #[serde(default = "default_market_instrument")]
    pub market_instrument: String,
    /// RPC endpoint for the Base chain (settlement side).
    pub base_rpc_url: String,
    /// Node-managed account the demo wallet transfers from. Absent means
    /// dry-run: the agent escalates but never pays.
    #[serde(default)]
    pub wallet_from_address: Option<String>,
    #[serde(default = "default_true")]
    pub dry_run: bool,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default)]
    pub risk: RiskConfig,
}

fn default_budget_limit_usdc() -> f64 {
    10.0
}

fn default_cron_expression() -> String {
    "*/15 * * * *".to_string()
}

fn default_confirmation_blocks() -> u64 {
    3
}

fn default_invoice_ttl_seconds() -> u64 {
    900
}

fn default_settlement_poll_interval_ms() -> u64 {
    5_000
}

fn default_run_timeout_ms() -> u64 {
    300_000
}

fn default_cooldown_minutes() -> u64 {
    5
}

fn default_minimum_operational_usdc() -> f64 {
    0.05
}

fn default_warning_threshold_usdc() -> f64 {
    0.5
}

fn default_grace_period_seconds() -> u64 {
    30
}

fn default_usdc_base_address() -> String {
    USDC_BASE.to_string()
}

fn default_market_instrument() -> String {
    "ETH-USD".to_string()
}

fn default_true() -> bool {
    true
}

fn default_db_path() -> String {
    "sentinel_db".to_string()
}

fn default_lcr_threshold() -> f64 {
    1.0
}

fn default_lcr_critical() -> f64 {
    0.8
}

fn default_depth_crisis_min_usd() -> f64 {
    250_000.0
}

fn default_participation_rate() -> f64 {
    0.1
}

fn default_vol_lookback() -> usize {
    96
}

fn default_projected_outflows_usd() -> f64 {
    0.0
}

fn default_projected_inflows_usd() -> f64 {
    0.0
}

impl SentinelConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut cfg: SentinelConfig = toml::from_str(&data)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        override_f64("SENTINEL_BUDGET_LIMIT_USDC", &mut self.budget_limit_usdc);
        override_string("SENTINEL_CRON_EXPRESSION", &mut self.cron_expression);
        override_u64(
            "SENTINEL_CONFIRMATION_BLOCKS",
            &mut self.confirmation_blocks,
        );
        override_u64("SENTINEL_INVOICE_TTL_SECONDS", &mut self.invoice_ttl_seconds);
        override_u64(
            "SENTINEL_SETTLEMENT_POLL_INTERVAL_MS",
            &mut self.settlement_poll_interval_ms,
        );
        override_u64("SENTINEL_RUN_TIMEOUT_MS", &mut self.run_timeout_ms);
        override_u64("SENTINEL_COOLDOWN_MINUTES", &mut self.cooldown_minutes);
        override_f64(
            "SENTINEL_MINIMUM_OPERATIONAL_USDC",
            &mut self.minimum_operational_usdc,
        );
        override_f64(
            "SENTINEL_WARNING_THRESHOLD_USDC",
            &mut self.warning_threshold_usdc,
        );
        override_string("SENTINEL_GATEWAY_URL", &mut self.gateway_url);
        override_string("SENTINEL_BASE_RPC_URL", &mut self.base_rpc_url);
        override_string("SENTINEL_DB_PATH", &mut self.db_path);
        override_bool("SENTINEL_DRY_RUN", &mut self.dry_run);
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.budget_limit_usdc <= 0.0 || !self.budget_limit_usdc.is_finite() {
            return Err(ConfigError::invalid(
                "budget_limit_usdc",
                "must be a positive number",
            ));
        }
        if self.minimum_operational_usdc < 0.0 {
            return Err(ConfigError::invalid(
                "minimum_operational_usdc",
                "must be non-negative",
            ));
        }
        if self.warning_threshold_usdc < self.minimum_operational_usdc {
            return Err(ConfigError::invalid(
                "warning_threshold_usdc",
                "must be at least minimum_operational_usdc",
            ));
        }
        if self.chains.is_empty() {
            return Err(ConfigError::invalid(
                "chains",
                "at least one chain must be configured",
            ));
        }
        CronSchedule::parse(&self.cron_expression)
            .map_err(|why| ConfigError::invalid("cron_expression", why))?;
        parse_address("usdc_base_address", &self.usdc_base_address)?;
        let recipient = parse_address(
            "gateway_recipient_address",
            &self.gateway_recipient_address,
        )?;
        if recipient == Address::ZERO {
            return Err(ConfigError::invalid(
                "gateway_recipient_address",
                "must not be the zero address",
            ));
        }
        url::Url::parse(&self.gateway_url)
            .map_err(|e| ConfigError::invalid("gateway_url", e.to_string()))?;
        url::Url::parse(&self.base_rpc_url)
            .map_err(|e| ConfigError::invalid("base_rpc_url", e.to_string()))?;
        for chain in &self.chains {
            chain.treasury()?;
            url::Url::parse(&chain.rpc_url)
                .map_err(|e| ConfigError::invalid("chains.rpc_url", e.to_string()))?;
            for token in &chain.tokens {
                parse_address("chains.tokens.address", &token.address)?;
            }
        }
        if let Some(from) = &self.wallet_from_address {
            parse_address("wallet_from_address", from)?;
        }
        if !self.dry_run && self.wallet_from_address.is_none() {
            return Err(ConfigError::invalid(
                "wallet_from_address",
                "required unless dry_run is set",
            ));
        }
        if self.risk.participation_rate <= 0.0 || self.risk.participation_rate > 1.0 {
            return Err(ConfigError::invalid(
                "risk.participation_rate",
                "must be within (0, 1]",
            ));
        }
        if self.risk.vol_lookback < 2 {
            return Err(ConfigError::invalid(
                "risk.vol_lookback",
                "needs at least two samples",
            ));
        }
        Ok(())
    }

    pub fn budget_limit(&self) -> MicroUsdc {
        MicroUsdc::from_usdc(self.budget_limit_usdc).unwrap_or(MicroUsdc::ZERO)
    }

    pub fn minimum_operational(&self) -> MicroUsdc {
        MicroUsdc::from_usdc(self.minimum_operational_usdc).unwrap_or(MicroUsdc::ZERO)
    }

    pub fn warning_threshold(&self) -> MicroUsdc {
        MicroUsdc::from_usdc(self.warning_threshold_usdc).unwrap_or(MicroUsdc::ZERO)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_minutes * 60)
    }

    pub fn invoice_ttl(&self) -> Duration {
        Duration::from_secs(self.invoice_ttl_seconds)
    }

    pub fn settlement_poll_interval(&self) -> Duration {
        Duration::from_millis(self.settlement_poll_interval_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }

    pub fn usdc_base(&self) -> Address {
        parse_address("usdc_base_address", &self.usdc_base_address)
            .expect("validated at startup")
    }

    pub fn gateway_recipient(&self) -> Address {
        parse_address("gateway_recipient_address", &self.gateway_recipient_address)
            .expect("validated at startup")
    }

    pub fn schedule(&self) -> CronSchedule {
        CronSchedule::parse(&self.cron_expression).expect("validated at startup")
    }
}

pub(crate) fn parse_address(field: &'static str, value: &str) -> Result<Address, ConfigError> {
    Address::from_str(value).map_err(|e| ConfigError::invalid(field, e.to_string()))
}

/// Parse a configured hex address outside the config loader (composition
/// root, tooling).
pub fn parse_address_str(value: &str) -> Result<Address, ConfigError> {
    parse_address("address", value)
}

fn override_f64(key: &str, field: &mut f64) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<f64>() {
            *field = parsed;
        }
    }
}

fn override_u64(key: &str, field: &mut u64) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<u64>() {
            *field = parsed;
        }
    }
}

fn override_bool(key: &str, field: &mut bool) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<bool>() {
            *field = parsed;
        }
    }
}

fn override_string(key: &str, field: &mut String) {
    if let Ok(value) = env::var(key) {
        if !value.is_empty() {
            *field = value;
        }
    }
}

/// Fixture configuration shared by unit and scenario tests.
#[doc(hidden)]
pub mod test_support {
    use super::*;

    pub fn test_config() -> SentinelConfig {
        SentinelConfig {
            budget_limit_usdc: 10.0,
            cron_expression: default_cron_expression(),
            confirmation_blocks: 3,
            invoice_ttl_seconds: 900,
            settlement_poll_interval_ms: 10,
            run_timeout_ms: 300_000,
            cooldown_minutes: 5,
            minimum_operational_usdc: 0.05,
            warning_threshold_usdc: 0.5,
            grace_period_seconds: 1,
            chains: vec![ChainConfig {
                chain_id: 8453,
                rpc_url: "http://localhost:8545".to_string(),
                treasury_address: "0x00000000000000000000000000000000000000aa".to_string(),
                tokens: vec![TokenConfig {
                    address: USDC_BASE.to_string(),
                    usd_price: Some(1.0),
                    daily_volume_usd: Some(1_000_000.0),
                }],
            }],
            usdc_base_address: USDC_BASE.to_string(),
            gateway_recipient_address: "0x00000000000000000000000000000000000000bb"
                .to_string(),
            gateway_url: "http://localhost:9000".to_string(),
            market_instrument: default_market_instrument(),
            base_rpc_url: "http://localhost:8545".to_string(),
            wallet_from_address: None,
            dry_run: true,
            db_path: "sentinel_db".to_string(),
            risk: RiskConfig::default(),
        }
    }
}
