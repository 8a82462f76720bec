//! flag-relay service binary.
//!
//! Starts the relay with configuration from the environment. In a full
//! deployment the topology layer is driven by the autoconfiguration source;
//! for manual setups, a single environment can be bootstrapped from
//! `RELAY_SDK_KEY` / `RELAY_MOBILE_KEY` / `RELAY_CLIENT_SIDE_ID`.

use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use flag_relay_app::routes;
use flag_relay_app::{MemoryStoreFactory, RelayEnvironments};
use flag_relay_core::config::RelayConfig;
use flag_relay_core::environment::{EnvironmentId, EnvironmentParams, FilterKey, ProjectKey};
use flag_relay_topology::messages::ConfigUpdateHandler;
use flag_relay_topology::router::ProjectRouter;

fn bootstrap_from_env(router: &ProjectRouter) {
    let Ok(sdk_key) = std::env::var("RELAY_SDK_KEY") else {
        info!("no RELAY_SDK_KEY set, waiting for autoconfiguration");
        return;
    };
    let env_id = std::env::var("RELAY_ENV_ID").unwrap_or_else(|_| "default".to_string());
    router.add_environment(EnvironmentParams {
        env_id: EnvironmentId::new(env_id.clone()),
        project_key: ProjectKey::new("default"),
        project_name: "Default".to_string(),
        env_key: env_id.clone(),
        env_name: env_id.clone(),
        sdk_key,
        expiring_sdk_key: None,
        mobile_key: std::env::var("RELAY_MOBILE_KEY").ok(),
        env_client_id: std::env::var("RELAY_CLIENT_SIDE_ID").ok(),
        filter_key: FilterKey::default(),
    });
    router.received_all_environments();
    info!(env = %env_id, "bootstrapped environment from process environment");
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RelayConfig::from_env()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;

    let relay = RelayEnvironments::new(config.clone(), Arc::new(MemoryStoreFactory));
    let router = ProjectRouter::new(relay.clone());
    bootstrap_from_env(&router);

    info!(host = %config.host, port = config.port, "starting flag-relay");
    let app_state = web::Data::from(relay);
    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .configure(routes::configure)
    })
    .workers(num_cpus::get())
    .bind((config.host.as_str(), config.port))?
    .run()
    .await
}
