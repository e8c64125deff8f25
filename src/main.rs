use std::sync::Arc;

use anyhow::Context;
use gateway::{DiscordGateway, GatewayService};
use log::{error, info};
use tokio_util::sync::CancellationToken;

use citygate::{
    server, BotConfig, ConnectionSupervisor, EventRouter, GatewayOnboarding, JsonFileStoryStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = BotConfig::from_env().context("Failed to load configuration")?;

    let gateway = Arc::new(DiscordGateway::new(&config.token));
    let supervisor = Arc::new(ConnectionSupervisor::new(gateway.clone()));
    let stories = Arc::new(
        JsonFileStoryStore::open(&config.story_store_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open story store at {}",
                    config.story_store_path.display()
                )
            })?,
    );
    let onboarding = Arc::new(GatewayOnboarding::new(
        gateway.clone(),
        config.story_channel,
    ));
    let router = Arc::new(EventRouter::new(
        gateway.clone(),
        supervisor.clone(),
        onboarding,
        stories,
        &config,
    ));

    let cancel = CancellationToken::new();
    let http = tokio::spawn(server::serve(
        config.port,
        supervisor.status(),
        cancel.clone(),
    ));

    // Subscribe before connecting so the first session's events are kept.
    let events = gateway.subscribe();
    supervisor
        .connect()
        .await
        .context("Could not establish the gateway connection")?;

    let dispatch = tokio::spawn(router.run(events, cancel.clone()));
    info!("citygate is up");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    cancel.cancel();

    if let Err(e) = dispatch.await {
        error!("Event router task failed: {e}");
    }
    match http.await {
        Ok(Err(e)) => error!("HTTP host failed: {e}"),
        Err(e) => error!("HTTP host task failed: {e}"),
        Ok(Ok(())) => {}
    }
    Ok(())
}
