//! # Synapse Agent
//!
//! Publishes the virtual entities of this host to the hub.
//!
//! ## Entities
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  sensor.agent_uptime         reactive, every 60s                       │
//! │  switch.maintenance_mode     turn_on / turn_off / toggle from the hub  │
//! │  binary_sensor.maintenance   reactive, follows maintenance_mode        │
//! │  button.agent_ping           press counts into a local                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration
//! `SYNAPSE_CONFIG` points at a TOML file; otherwise the platform config
//! directory is used. Every `SYNAPSE_*` override from `SynapseConfig`
//! applies on top.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use synapse_core::{Domain, EntityEvent, EntityOptions, ReactiveBinding};
use synapse_sync::{
    ServiceDescriptor, SynapseConfig, SynapseContext, SynapseContextBuilder, SyncResult,
    VirtualEntity,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting Synapse agent");

    let config_path = std::env::var_os("SYNAPSE_CONFIG").map(PathBuf::from);
    let config = SynapseConfig::load(config_path)?;
    info!(
        app = %config.app.name,
        backend = %config.storage.backend,
        hub = config.hub.url.as_deref().unwrap_or("<none>"),
        "Configuration loaded"
    );

    let mut context = SynapseContextBuilder::new(config).build().await?;
    declare_entities(&context)?;

    context.start().await?;
    let status = context.status();
    info!(
        entities = status.entities,
        phase = %status.phase,
        hash = %status.hash,
        "Agent running, press Ctrl+C to stop"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
    }

    context.shutdown().await?;
    info!("Agent shutdown complete");
    Ok(())
}

/// Initializes the tracing subscriber.
///
/// `RUST_LOG` overrides the default filter.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,synapse=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::TRACE)
        .init();
}

fn declare_entities(context: &SynapseContext) -> SyncResult<()> {
    let started = Instant::now();
    context.add_entity(
        EntityOptions::new(Domain::Sensor, "Agent Uptime")
            .with_unique_id("agent_uptime")
            .with_value("device_class", "duration")
            .with_value("unit_of_measurement", "s")
            .with_reactive(
                "state",
                ReactiveBinding::new(move || json!(started.elapsed().as_secs()))
                    .every(Duration::from_secs(60)),
            ),
    )?;

    let maintenance = context.add_entity(
        EntityOptions::new(Domain::Switch, "Maintenance Mode")
            .with_unique_id("maintenance_mode")
            .with_value("is_on", false),
    )?;
    bind_switch(&maintenance);

    let registry = Arc::downgrade(context.registry());
    context.add_entity(
        EntityOptions::new(Domain::BinarySensor, "Maintenance Active")
            .with_unique_id("maintenance_active")
            .with_reactive(
                "is_on",
                ReactiveBinding::new(move || {
                    registry
                        .upgrade()
                        .and_then(|registry| registry.get("maintenance_mode", "is_on"))
                        .unwrap_or(Value::Bool(false))
                })
                .on_update_of("maintenance_mode"),
            ),
    )?;

    let ping = context.add_entity(
        EntityOptions::new(Domain::Button, "Agent Ping")
            .with_unique_id("agent_ping")
            .with_local_default("presses", 0),
    )?;
    let counter = ping.clone();
    ping.on(EntityEvent::Press, move |_| {
        let counter = counter.clone();
        tokio::spawn(async move {
            let presses = match counter.locals().get("presses").await {
                Ok(value) => value.and_then(|v| v.as_u64()).unwrap_or(0) + 1,
                Err(e) => {
                    warn!(error = %e, "Failed to read press count");
                    return;
                }
            };
            if let Err(e) = counter.locals().set("presses", presses).await {
                warn!(error = %e, "Failed to store press count");
            }
            info!(presses, "Ping pressed");
        });
    });

    context.register_service(
        ServiceDescriptor {
            name: "log_status".into(),
            description: "Write the agent status to the log".into(),
            fields: Value::Null,
        },
        |data| info!(?data, "log_status called"),
    );

    Ok(())
}

/// Wires hub commands of a switch to its state.
fn bind_switch(switch: &VirtualEntity) {
    for event in [EntityEvent::TurnOn, EntityEvent::TurnOff, EntityEvent::Toggle] {
        let target = switch.clone();
        switch.on(event, move |_| {
            let target = target.clone();
            tokio::spawn(async move {
                let current = target.state().and_then(|v| v.as_bool()).unwrap_or(false);
                let next = match event {
                    EntityEvent::TurnOn => true,
                    EntityEvent::TurnOff => false,
                    _ => !current,
                };
                if let Err(e) = target.set_state(next).await {
                    warn!(unique_id = %target.unique_id(), error = %e, "Failed to switch");
                }
            });
        });
    }
}
