use std::{sync::Arc, time::Duration};

use anyhow::Context;
use signalrelay::{
    AppState, app,
    clock::{Clock, SystemClock},
    config::{Config, EngineKind},
    negotiation::{EngineFactory, LoopbackEngineFactory, RtcEngineFactory},
    relay::{CHAT_EXCHANGE, MemoryBroker, Relay, SESSION_EXCHANGE, Topic},
    store,
};
use tracing::info;

const NEGOTIATION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let kv = store::connect(&config.store, clock.clone())
        .await
        .context("failed to reach the store")?;

    let relay = Relay::new(Arc::new(MemoryBroker::new()), config.queue_capacity);
    for exchange in [CHAT_EXCHANGE, SESSION_EXCHANGE] {
        relay
            .declare(&Topic::new(exchange))
            .await
            .with_context(|| format!("failed to declare exchange `{exchange}`"))?;
    }

    let engines: Arc<dyn EngineFactory> = match config.engine {
        EngineKind::WebRtc => Arc::new(RtcEngineFactory::new(config.stun_urls.clone())),
        EngineKind::Loopback => Arc::new(LoopbackEngineFactory),
    };

    let state = AppState::new(&config, kv, relay.clone(), engines, clock);
    state.negotiator.spawn_sweeper(NEGOTIATION_SWEEP_INTERVAL);
    let app = app(state, config.request_timeout);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(
        addr = %config.bind_addr,
        store = ?config.store,
        delivery_mode = %config.delivery_mode,
        engine = ?config.engine,
        "listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    relay.close();
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
