mod config;
mod default_startup_script;
mod external_publish;
mod host_status_script;
mod lifecycle;
mod message_hub;
mod models;
mod script_api;
mod service_utils;
mod startup_scripts;
#[cfg(test)]
mod test_broker;
mod topic_filter;
mod topic_import_manager;
mod topic_importer;

use crate::config::Config;
use crate::default_startup_script::DefaultStartupScript;
use crate::host_status_script::HostStatusScript;
use crate::lifecycle::{Shutdown, SystemService};
use crate::message_hub::MessageHub;
use crate::script_api::HostMqttApi;
use crate::service_utils::{handle_shutdown, periodic_status_update};
use crate::startup_scripts::StartupScriptsService;
use crate::topic_import_manager::TopicImportManager;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Load configuration
    let config = Config::from_env();

    // Initialize logging
    let log_level = config
        .as_ref()
        .map(|cfg| cfg.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match config {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    let system = SystemService::new();
    let shutdown = Shutdown::new();

    // Local hub and topic imports
    let hub = MessageHub::new();
    let hub_task = hub.start(shutdown.subscribe());
    let imports = TopicImportManager::new(
        hub.clone(),
        Duration::from_millis(config.import_reconnect_interval_ms),
    );

    // Startup scripts
    let mqtt_api = Arc::new(HostMqttApi::new(hub.clone(), imports.clone()));
    let startup_scripts = StartupScriptsService::new(mqtt_api, config.clone());
    startup_scripts.register(Arc::new(DefaultStartupScript));
    startup_scripts.register(Arc::new(HostStatusScript::from_config(&config)));
    info!("Registered startup scripts: {:?}", startup_scripts.startup_script_uids());
    startup_scripts.start();
    system.add_listener(startup_scripts.clone());

    system.on_services_initialized();
    system.on_configuration_loaded();

    let status_task = periodic_status_update(
        hub.clone(),
        imports.clone(),
        Duration::from_secs(config.status_interval_secs),
        shutdown.subscribe(),
    );

    system.on_startup_completed();
    info!(
        "Host started in {:?}. Active startup scripts: {:?}, topic imports: {:?}",
        system.startup_duration().unwrap_or_default(),
        startup_scripts.active_scripts(),
        imports.topic_import_uids()
    );

    handle_shutdown(&shutdown, &system, imports.clone()).await;

    // Wait for tasks to complete
    let _ = status_task.await;
    if let Some(hub_task) = hub_task {
        let _ = hub_task.await;
    }
    info!("All services shut down successfully.");
}
