//! API surface handed to startup scripts: the `mqtt` and `log` collaborators.

use crate::external_publish;
use crate::message_hub::MessageHub;
use crate::models::{
    ExternalPublishParameters, ImportTopicParameters, IncomingMessage, ParameterError, PublishParameters,
};
use crate::topic_filter;
use crate::topic_import_manager::TopicImportManager;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid parameters: {0}")]
    InvalidParameter(#[from] ParameterError),
    #[error("Invalid topic filter '{0}'.")]
    InvalidTopicFilter(String),
}

pub type ScriptCallback = Box<dyn Fn(Value) + Send + Sync>;

pub trait MqttApi: Send + Sync {
    /// Starts importing a remote topic. Returns the uid in use.
    fn start_topic_import(&self, uid: &str, parameters: Value) -> Result<String, ApiError>;

    fn stop_topic_import(&self, uid: &str) -> Result<(), ApiError>;

    fn topic_import_uids(&self) -> Vec<String>;

    fn publish(&self, parameters: Value) -> Result<(), ApiError>;

    /// Publishes one message to another broker and waits for the outcome.
    /// Broker failures come back as a result mapping (`type` is `success`,
    /// `exception.connecting_failed` or another `exception.*`); only bad
    /// parameters are errors.
    fn publish_external(&self, parameters: Value) -> Result<Value, ApiError>;

    fn subscribe(&self, uid: &str, topic_filter: &str, callback: ScriptCallback) -> Result<String, ApiError>;

    fn unsubscribe(&self, uid: &str);
}

pub trait LogApi: Send + Sync {
    fn info(&self, message: &str);
    fn warning(&self, message: &str);
    fn error(&self, message: &str);
    fn debug(&self, message: &str);
}

/// Collaborators visible to a single hook invocation.
#[derive(Clone)]
pub struct ScriptContext {
    pub mqtt: Arc<dyn MqttApi>,
    pub log: Arc<dyn LogApi>,
}

impl ScriptContext {
    pub fn new(mqtt: Arc<dyn MqttApi>, log: Arc<dyn LogApi>) -> Self {
        Self { mqtt, log }
    }
}

/// `mqtt` backed by the local hub and the topic import manager.
pub struct HostMqttApi {
    hub: Arc<MessageHub>,
    imports: Arc<TopicImportManager>,
}

impl HostMqttApi {
    pub fn new(hub: Arc<MessageHub>, imports: Arc<TopicImportManager>) -> Self {
        Self { hub, imports }
    }
}

fn message_to_value(subscription_uid: &str, message: &IncomingMessage) -> Value {
    json!({
        "subscription_uid": subscription_uid,
        "client_id": message.client_id,
        "topic": message.topic,
        "payload": message.payload,
        "qos": message.qos as u8,
        "retain": message.retain,
    })
}

impl MqttApi for HostMqttApi {
    fn start_topic_import(&self, uid: &str, parameters: Value) -> Result<String, ApiError> {
        let parameters = ImportTopicParameters::from_value(&parameters)?;
        if !topic_filter::is_valid_filter(&parameters.topic) {
            return Err(ApiError::InvalidTopicFilter(parameters.topic));
        }
        Ok(self.imports.start_topic_import(uid, parameters))
    }

    fn stop_topic_import(&self, uid: &str) -> Result<(), ApiError> {
        self.imports.stop_topic_import(uid);
        Ok(())
    }

    fn topic_import_uids(&self) -> Vec<String> {
        self.imports.topic_import_uids()
    }

    fn publish(&self, parameters: Value) -> Result<(), ApiError> {
        let parameters = PublishParameters::from_value(&parameters)?;
        self.hub.publish(parameters);
        Ok(())
    }

    fn publish_external(&self, parameters: Value) -> Result<Value, ApiError> {
        let parameters = ExternalPublishParameters::from_value(&parameters)?;
        match external_publish::publish_blocking(&parameters) {
            Ok(()) => Ok(external_publish::success_value()),
            Err(e) => {
                tracing::warn!(
                    "External publish of '{}' to {}:{} failed: {}",
                    parameters.message.topic,
                    parameters.server,
                    parameters.port,
                    e
                );
                Ok(e.to_value())
            }
        }
    }

    fn subscribe(&self, uid: &str, topic_filter: &str, callback: ScriptCallback) -> Result<String, ApiError> {
        if !topic_filter::is_valid_filter(topic_filter) {
            return Err(ApiError::InvalidTopicFilter(topic_filter.to_string()));
        }

        let uid = if uid.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            uid.to_string()
        };
        let subscription_uid = uid.clone();
        Ok(self.hub.subscribe(&uid, topic_filter, move |message| {
            callback(message_to_value(&subscription_uid, message))
        }))
    }

    fn unsubscribe(&self, uid: &str) {
        self.hub.unsubscribe(uid);
    }
}

/// `log` writing through tracing, tagged with the calling script.
pub struct TracingLog {
    script_uid: String,
}

impl TracingLog {
    pub fn new(script_uid: impl Into<String>) -> Self {
        Self {
            script_uid: script_uid.into(),
        }
    }
}

impl LogApi for TracingLog {
    fn info(&self, message: &str) {
        tracing::info!(target: "startup_script", script = %self.script_uid, "{}", message);
    }

    fn warning(&self, message: &str) {
        tracing::warn!(target: "startup_script", script = %self.script_uid, "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "startup_script", script = %self.script_uid, "{}", message);
    }

    fn debug(&self, message: &str) {
        tracing::debug!(target: "startup_script", script = %self.script_uid, "{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_broker;
    use tokio::sync::{broadcast, mpsc};
    use tokio::time::{timeout, Duration};

    fn host_api() -> (HostMqttApi, broadcast::Sender<()>) {
        let (shutdown, _) = broadcast::channel(1);
        let hub = MessageHub::new();
        hub.start(shutdown.subscribe()).unwrap();
        let imports = TopicImportManager::new(hub.clone(), Duration::from_secs(60));
        (HostMqttApi::new(hub, imports), shutdown)
    }

    #[tokio::test]
    async fn publish_reaches_script_subscription() {
        let (api, _shutdown) = host_api();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let uid = api
            .subscribe("lights", "lights/+", Box::new(move |m: Value| {
                let _ = tx.send(m);
            }))
            .unwrap();
        assert_eq!(uid, "lights");

        api.publish(json!({"topic": "lights/kitchen", "payload": "on", "qos": 1})).unwrap();

        let message = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(message["subscription_uid"], "lights");
        assert_eq!(message["topic"], "lights/kitchen");
        assert_eq!(message["payload"], json!([111, 110]));
        assert_eq!(message["qos"], 1);
        assert_eq!(message["retain"], false);
    }

    #[tokio::test]
    async fn start_topic_import_validates_mapping() {
        let (api, _shutdown) = host_api();

        let missing_server = api.start_topic_import("x", json!({"topic": "#"}));
        assert!(matches!(missing_server, Err(ApiError::InvalidParameter(_))));

        let bad_filter = api.start_topic_import("x", json!({"server": "127.0.0.1", "topic": "a/#/b"}));
        assert!(matches!(bad_filter, Err(ApiError::InvalidTopicFilter(_))));

        assert!(api.topic_import_uids().is_empty());
    }

    #[tokio::test]
    async fn start_and_stop_topic_import() {
        let (api, _shutdown) = host_api();

        let uid = api
            .start_topic_import("heating-server", json!({"server": "127.0.0.1", "port": 1, "topic": "#"}))
            .unwrap();
        assert_eq!(uid, "heating-server");
        assert_eq!(api.topic_import_uids(), vec!["heating-server"]);

        api.stop_topic_import(&uid).unwrap();
        assert!(api.topic_import_uids().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn publish_external_reports_outcome() {
        let (api, _shutdown) = host_api();
        let (listener, port) = test_broker::bind().await;

        let broker = tokio::spawn(async move {
            let mut stream = test_broker::accept_client(&listener).await;
            let received = test_broker::receive_publish(&mut stream).await;
            let disconnected = test_broker::wait_for_disconnect(&mut stream).await;
            (received, disconnected)
        });

        let result = api
            .publish_external(json!({
                "server": "127.0.0.1",
                "port": port,
                "topic": "wirehome/host/status",
                "payload": "online",
                "timeout": 2000
            }))
            .unwrap();
        assert_eq!(result, json!({"type": "success"}));

        let (received, disconnected) = broker.await.unwrap();
        assert_eq!(received.topic, "wirehome/host/status");
        assert_eq!(received.payload, b"online".to_vec());
        assert!(disconnected);

        // Nothing listens on port 1 of the loopback interface.
        let refused = api
            .publish_external(json!({"server": "127.0.0.1", "port": 1, "topic": "a"}))
            .unwrap();
        assert_eq!(refused, json!({"type": "exception.connecting_failed"}));

        let invalid = api.publish_external(json!({"port": 1, "topic": "a"}));
        assert!(matches!(invalid, Err(ApiError::InvalidParameter(_))));
    }
}
