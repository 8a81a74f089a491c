use crate::message_hub::MessageHub;
use crate::models::ImportTopicParameters;
use crate::topic_importer::{ClientState, TopicImporter};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

pub struct TopicImportManager {
    importers: Mutex<HashMap<String, TopicImporter>>,
    /// Stops still in flight after a replace or `stop_topic_import`.
    stopping: Mutex<Vec<JoinHandle<()>>>,
    hub: Arc<MessageHub>,
    reconnect_interval: Duration,
}

impl TopicImportManager {
    pub fn new(hub: Arc<MessageHub>, reconnect_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            importers: Mutex::new(HashMap::new()),
            stopping: Mutex::new(Vec::new()),
            hub,
            reconnect_interval,
        })
    }

    fn importers(&self) -> MutexGuard<'_, HashMap<String, TopicImporter>> {
        self.importers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stopping(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.stopping.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stop_in_background(&self, importer: TopicImporter) {
        let handle = tokio::spawn(importer.stop());
        let mut stopping = self.stopping();
        stopping.retain(|h| !h.is_finished());
        stopping.push(handle);
    }

    pub fn topic_import_uids(&self) -> Vec<String> {
        let mut uids: Vec<String> = self.importers().keys().cloned().collect();
        uids.sort();
        uids
    }

    pub fn topic_import_state(&self, uid: &str) -> Option<ClientState> {
        self.importers().get(uid).map(TopicImporter::state)
    }

    /// Starts an import and returns its uid. A running import with the same
    /// uid is replaced.
    pub fn start_topic_import(&self, uid: &str, parameters: ImportTopicParameters) -> String {
        let uid = if uid.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            uid.to_string()
        };

        let topic = parameters.topic.clone();
        let server = parameters.server.clone();
        let importer = TopicImporter::start(&uid, parameters, self.hub.clone(), self.reconnect_interval);

        let replaced = self.importers().insert(uid.clone(), importer);
        if let Some(existing) = replaced {
            self.stop_in_background(existing);
        }

        info!(
            "Started importer '{}' for topic '{}' from server '{}'.",
            uid, topic, server
        );
        uid
    }

    /// Removes the import and disconnects it in the background. Unknown
    /// uids are ignored.
    pub fn stop_topic_import(&self, uid: &str) {
        let removed = self.importers().remove(uid);
        if let Some(importer) = removed {
            self.stop_in_background(importer);
            info!("Stopped importer '{}'.", uid);
        }
    }

    /// Disconnects every import and waits until each one is down, including
    /// imports already stopping in the background.
    pub async fn stop_all(&self) {
        let importers: Vec<TopicImporter> = self.importers().drain().map(|(_, i)| i).collect();
        for importer in importers {
            let uid = importer.uid().to_string();
            importer.stop().await;
            info!("Stopped importer '{}'.", uid);
        }

        let stopping: Vec<JoinHandle<()>> = self.stopping().drain(..).collect();
        for handle in stopping {
            if let Err(e) = handle.await {
                warn!("Stopping an importer failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_broker;
    use tokio::time::timeout;

    fn manager() -> Arc<TopicImportManager> {
        TopicImportManager::new(MessageHub::new(), Duration::from_secs(60))
    }

    fn unreachable(topic: &str) -> ImportTopicParameters {
        ImportTopicParameters::new("127.0.0.1", 1, topic)
    }

    #[tokio::test]
    async fn start_with_name_registers_uid() {
        let manager = manager();
        let uid = manager.start_topic_import("heating-server", unreachable("#"));
        assert_eq!(uid, "heating-server");
        assert_eq!(manager.topic_import_uids(), vec!["heating-server"]);
        assert!(manager.topic_import_state("heating-server").is_some());
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn empty_uid_is_generated() {
        let manager = manager();
        let uid = manager.start_topic_import("", unreachable("#"));
        assert!(Uuid::parse_str(&uid).is_ok());
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn same_uid_replaces_existing_importer() {
        let manager = manager();
        manager.start_topic_import("garden", unreachable("a/#"));
        manager.start_topic_import("garden", unreachable("b/#"));
        assert_eq!(manager.topic_import_uids(), vec!["garden"]);
        manager.stop_all().await;
    }

    #[tokio::test]
    async fn stop_removes_and_ignores_unknown() {
        let manager = manager();
        manager.start_topic_import("a", unreachable("#"));
        manager.start_topic_import("b", unreachable("#"));

        manager.stop_topic_import("a");
        manager.stop_topic_import("does-not-exist");
        assert_eq!(manager.topic_import_uids(), vec!["b"]);

        manager.stop_all().await;
        assert!(manager.topic_import_uids().is_empty());
    }

    #[tokio::test]
    async fn stop_topic_import_disconnects_from_broker() {
        let (listener, port) = test_broker::bind().await;
        let manager = manager();
        manager.start_topic_import("heating-server", ImportTopicParameters::new("127.0.0.1", port, "#"));
        let (mut stream, _) = test_broker::accept_subscriber(&listener).await;

        manager.stop_topic_import("heating-server");
        manager.stop_all().await;

        let disconnected = timeout(Duration::from_secs(3), test_broker::wait_for_disconnect(&mut stream))
            .await
            .unwrap();
        assert!(disconnected);
        assert!(manager.topic_import_uids().is_empty());
    }
}
