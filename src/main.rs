use std::{env, fs::File, path::Path, sync::Arc};

use tracing::{info, warn};

use settlement_engine::config::EngineConfig;
use settlement_engine::dlq::LogDeadLetters;
use settlement_engine::effects::Collaborators;
use settlement_engine::engine::Engine;
use settlement_engine::gateway::{HttpGateway, SandboxGateway};
use settlement_engine::ingestion::CsvReader;
use settlement_engine::{logging, report, webhook};

const USAGE: &str = "usage: settlement_engine replay <ops.csv> | settlement_engine serve";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init()?;
    let config = EngineConfig::from_env();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("replay") => {
            let file_path = args.next().ok_or(USAGE)?;
            replay(config, Path::new(&file_path)).await
        }
        Some("serve") => serve(config).await,
        _ => Err(USAGE.into()),
    }
}

/// Replays an operations journal against the sandbox provider and prints the
/// resulting balances.
async fn replay(config: EngineConfig, file_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let file = File::open(file_path)?;
    let gateway = Arc::new(SandboxGateway::new(config.gateway.password.clone()));
    let collaborators = Collaborators::logging(Arc::new(LogDeadLetters::default()));
    let engine = Engine::new(config, gateway, collaborators);

    let mut ingestion = CsvReader::new(file);
    engine.process(&mut ingestion).await;
    engine.shutdown().await?;

    report::write_balances(&engine.balances().await, std::io::stdout().lock())?;
    Ok(())
}

async fn serve(config: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let gateway = Arc::new(HttpGateway::new(config.gateway.clone())?);
    let collaborators = Collaborators::logging(Arc::new(LogDeadLetters::default()));
    let bind = config.webhook_bind.clone();
    let sweep_every = config.capture_sweep;
    let poll_after = config.payout_poll_after;
    let engine = Arc::new(Engine::new(config, gateway, collaborators));

    let sweeper = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let confirmed = engine.escrow().sweep_unconfirmed_captures().await;
                if confirmed > 0 {
                    info!(confirmed, "captures confirmed by sweep");
                }
                let settled = engine.reconciliation().poll_stale_payouts(poll_after).await;
                if settled > 0 {
                    info!(settled, "stale payouts settled from provider state");
                }
            }
        })
    };

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, "webhook listener started");
    axum::serve(listener, webhook::router(engine.webhook()))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "could not listen for shutdown signal");
            }
        })
        .await?;

    sweeper.abort();
    engine.shutdown().await?;
    Ok(())
}
