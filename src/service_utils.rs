use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};
use crate::lifecycle::{Shutdown, SystemService};
use crate::message_hub::MessageHub;
use crate::topic_import_manager::TopicImportManager;

/// Builds the status line logged periodically.
pub fn status_summary(hub: &MessageHub, imports: &TopicImportManager) -> String {
    let status = hub.status();
    let subscribers: Vec<String> = hub
        .subscribers()
        .into_iter()
        .map(|s| format!("{}({})", s.uid, s.topic_filter))
        .collect();
    let retained: Vec<String> = hub.retained_messages().into_iter().map(|m| m.topic).collect();
    let import_states: Vec<String> = imports
        .topic_import_uids()
        .into_iter()
        .map(|uid| {
            let state = imports
                .topic_import_state(&uid)
                .map(|state| state.to_string())
                .unwrap_or_else(|| "stopped".to_string());
            format!("{}: {}", uid, state)
        })
        .collect();

    format!(
        "inbound={} outbound={} subscribers={} [{}] retained={} [{}] imports=[{}]",
        status.inbound_count,
        status.outbound_count,
        status.subscribers_count,
        subscribers.join(", "),
        status.retained_count,
        retained.join(", "),
        import_states.join(", ")
    )
}

/// Start periodic status updates
pub fn periodic_status_update(
    hub: Arc<MessageHub>,
    imports: Arc<TopicImportManager>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    info!("Status: {}", status_summary(&hub, &imports));
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}

/// Handle graceful shutdown: wait for Ctrl+C, notify lifecycle listeners,
/// disconnect all imports and then stop background tasks.
pub async fn handle_shutdown(shutdown: &Shutdown, system: &SystemService, imports: Arc<TopicImportManager>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
    }

    system.on_shutdown();
    imports.stop_all().await;
    shutdown.trigger();
}
