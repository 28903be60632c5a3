use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ha_client::{EntityClient, HaConfig, HomeAssistantClient};
use nostr_bridge::{
    BridgeConfig, BridgeContext, EventRouter, MealPlannerHandler, RelayManager, MEALPLANNER_PREFIX,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = BridgeConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(version = nostr_bridge::version(), "Starting Nostr to Home Assistant bridge");

    let context = BridgeContext::from_config(&config)?;
    info!(
        bridge_pubkey = %context.keys.public_key().to_hex(),
        publisher = %context.publisher.to_hex(),
        relays = context.relays.len(),
        prefix = %context.entity_prefix,
        "Bridge context ready"
    );

    let ha_config = HaConfig::from_env()?;
    if !ha_config.has_token() {
        warn!("SUPERVISOR_TOKEN is not set; Home Assistant calls will be unauthenticated");
    }
    let ha = HomeAssistantClient::new(ha_config)?;
    match ha.check_api().await {
        Ok(message) => info!(message = %message, "Home Assistant API reachable"),
        Err(e) => warn!(error = %e, "Home Assistant API check failed; continuing"),
    }
    let client: Arc<dyn EntityClient> = Arc::new(ha);

    let mut router = EventRouter::new(
        context.conversation_key.clone(),
        context.entity_prefix.clone(),
        client,
    )
    .with_reassembler(config.chunk_reassembler());
    router.register(
        MEALPLANNER_PREFIX,
        MealPlannerHandler::new(context.entity_prefix.clone()),
    );

    let manager = RelayManager::new(context.relay_settings(&config), router);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    if let Err(e) = manager.run(shutdown_rx).await {
        error!(error = %e, "Bridge stopped with error");
        return Err(e.into());
    }

    info!("Bridge stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
