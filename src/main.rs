use std::{collections::HashMap, env, sync::Arc};

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use treasury_sentinel::{
    agent::{CronSchedule, Scheduler, Sentinel},
    budget::BudgetLedger,
    chain::{
        rpc::{RetryPolicy, RpcClient},
        treasury::RpcTreasuryReader,
        verifier::SettlementVerifier,
    },
    config::{parse_address_str, SentinelConfig},
    escalation::{ledger::DEFAULT_LEDGER_CAP, EscalationContext, EscalationMachine, TransitionLedger},
    gateway::MarketDataGateway,
    metrics::MetricEngine,
    observer::{LogObserver, Observers},
    payment::{
        pipeline::PaymentPipeline,
        wallet::{DisabledWallet, NodeWallet, UsdcWallet},
        HttpTransport,
    },
    store::Store,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path =
        env::var("SENTINEL_CONFIG").unwrap_or_else(|_| "sentinel.toml".to_string());
    let cfg = SentinelConfig::from_file(&config_path)
        .with_context(|| format!("loading {config_path}"))?;
    info!(
        budget = %cfg.budget_limit(),
        cron = %cfg.cron_expression,
        chains = cfg.chains.len(),
        dry_run = cfg.dry_run,
        "sentinel starting"
    );

    let store = Arc::new(Store::open(&cfg.db_path).context("opening store")?);
    let budget = Arc::new(BudgetLedger::new(
        cfg.budget_limit(),
        cfg.minimum_operational(),
    ));

    let mut observers = Observers::new();
    observers.register(Arc::new(LogObserver));

    let base_url = Url::parse(&cfg.base_rpc_url).context("base_rpc_url")?;
    let base_rpc = Arc::new(RpcClient::new(base_url.clone(), RetryPolicy::default()));
    let verifier = Arc::new(
        SettlementVerifier::new(
            base_rpc,
            store.clone(),
            cfg.usdc_base(),
            cfg.gateway_recipient(),
            cfg.confirmation_blocks,
            cfg.settlement_poll_interval(),
        )
        .context("loading consumed settlements")?,
    );

    let wallet: Arc<dyn UsdcWallet> = match &cfg.wallet_from_address {
        Some(from) => {
            let from = parse_address_str(from).context("wallet_from_address")?;
            Arc::new(NodeWallet::new(
                RpcClient::new(base_url, RetryPolicy::default()),
                cfg.usdc_base(),
                from,
            ))
        }
        None => Arc::new(DisabledWallet),
    };

    let transport = Arc::new(HttpTransport::new(
        Url::parse(&cfg.gateway_url).context("gateway_url")?,
    ));
    let pipeline = Arc::new(PaymentPipeline::new(
        transport,
        budget.clone(),
        wallet,
        verifier,
        store.clone(),
        observers.clone(),
        cfg.invoice_ttl(),
        cfg.settlement_poll_interval(),
    ));
    let gateway = Arc::new(MarketDataGateway::new(pipeline));

    let schedule = cfg.schedule();
    let samples_per_day = 86_400.0 / schedule.period_hint().as_secs_f64();
    let mut volumes = HashMap::new();
    for chain in &cfg.chains {
        for token in &chain.tokens {
            if let (Ok(address), Some(volume)) =
                (parse_address_str(&token.address), token.daily_volume_usd)
            {
                volumes.insert(address, volume);
            }
        }
    }
    let engine = MetricEngine::new(cfg.risk.clone(), volumes, samples_per_day);

    let machine = EscalationMachine::new(
        EscalationContext::new(cfg.cooldown()),
        budget.clone(),
        TransitionLedger::new(store.clone(), DEFAULT_LEDGER_CAP),
        store.clone(),
        observers.clone(),
        cfg.risk.clone(),
        cfg.minimum_operational(),
        cfg.warning_threshold(),
    );

    let reader = Arc::new(RpcTreasuryReader::new(RetryPolicy::default()));
    let grace_period = cfg.grace_period();
    let agent = Arc::new(Sentinel::new(
        cfg, store, budget, reader, engine, machine, gateway,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    Scheduler::new(agent, schedule, grace_period, shutdown_rx)
        .run()
        .await
        .context("scheduler")?;
    Ok(())
}
