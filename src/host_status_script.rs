//! Built-in script that announces the host's online/offline status and
//! traces the traffic passing through the local hub.

use crate::config::Config;
use crate::script_api::ScriptContext;
use crate::startup_scripts::{ScriptError, StartupScript};
use serde_json::{json, Value};

pub const STATUS_TOPIC: &str = "wirehome/host/status";
const TRAFFIC_SUBSCRIPTION: &str = "host_status.traffic";

pub struct HostStatusScript {
    status_broker: Option<(String, u16)>,
}

impl HostStatusScript {
    pub fn new(status_broker: Option<(String, u16)>) -> Self {
        Self { status_broker }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config
                .status_broker_server
                .clone()
                .map(|server| (server, config.status_broker_port)),
        )
    }

    /// Publishes `state` retained into the hub and, when configured, to the
    /// status broker. An unreachable status broker is only a warning.
    fn announce(&self, ctx: &ScriptContext, state: &str) -> Result<(), ScriptError> {
        ctx.mqtt.publish(json!({
            "topic": STATUS_TOPIC,
            "payload": state,
            "retain": true
        }))?;

        let Some((server, port)) = &self.status_broker else {
            return Ok(());
        };

        let result = ctx.mqtt.publish_external(json!({
            "server": server,
            "port": port,
            "topic": STATUS_TOPIC,
            "payload": state,
            "retain": true
        }))?;

        match result["type"].as_str() {
            Some("success") => {
                ctx.log.debug(&format!("Status '{}' sent to {}:{}.", state, server, port));
                Ok(())
            }
            Some("exception.connecting_failed") => {
                ctx.log
                    .warning(&format!("Status broker {}:{} is not reachable.", server, port));
                Ok(())
            }
            _ => Err(ScriptError::Failed(format!(
                "Sending status '{}' to {}:{} failed: {}",
                state, server, port, result
            ))),
        }
    }
}

impl StartupScript for HostStatusScript {
    fn uid(&self) -> &str {
        "host_status"
    }

    fn on_startup_completed(&self, ctx: &ScriptContext) -> Result<(), ScriptError> {
        let log = ctx.log.clone();
        ctx.mqtt.subscribe(
            TRAFFIC_SUBSCRIPTION,
            "#",
            Box::new(move |message: Value| {
                match (message["topic"].as_str(), message["payload"].as_array()) {
                    (Some(topic), Some(payload)) => {
                        log.debug(&format!("Hub message on '{}' ({} bytes).", topic, payload.len()))
                    }
                    _ => log.error(&format!("Unexpected hub message: {}", message)),
                }
            }),
        )?;

        self.announce(ctx, "online")
    }

    /// Stops the imports before going offline so no traffic arrives after
    /// the announcement.
    fn on_shutdown(&self, ctx: &ScriptContext) -> Result<(), ScriptError> {
        ctx.mqtt.unsubscribe(TRAFFIC_SUBSCRIPTION);
        for uid in ctx.mqtt.topic_import_uids() {
            ctx.mqtt.stop_topic_import(&uid)?;
            ctx.log.info(&format!("Topic import '{}' stopped.", uid));
        }

        self.announce(ctx, "offline")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script_api::{LogApi, MqttApi};
    use crate::startup_scripts::test_support::{Call, Recorder};
    use std::sync::Arc;

    fn context(recorder: &Recorder) -> ScriptContext {
        let mqtt: Arc<dyn MqttApi> = Arc::new(recorder.clone());
        let log: Arc<dyn LogApi> = Arc::new(recorder.clone());
        ScriptContext::new(mqtt, log)
    }

    fn status(state: &str) -> Value {
        json!({"topic": STATUS_TOPIC, "payload": state, "retain": true})
    }

    #[test]
    fn startup_watches_hub_and_announces_online_locally() {
        let recorder = Recorder::default();
        let ctx = context(&recorder);

        HostStatusScript::new(None).on_startup_completed(&ctx).unwrap();

        assert_eq!(
            recorder.calls(),
            vec![
                Call::Subscribe(TRAFFIC_SUBSCRIPTION.to_string(), "#".to_string()),
                Call::Publish(status("online")),
            ]
        );

        recorder.deliver(TRAFFIC_SUBSCRIPTION, json!({"topic": "heating/room1", "payload": [50, 49]}));
        recorder.deliver(TRAFFIC_SUBSCRIPTION, json!({"payload": "?"}));
        let logs: Vec<Call> = recorder.calls().into_iter().skip(2).collect();
        assert_eq!(
            logs,
            vec![
                Call::Log("debug", "Hub message on 'heating/room1' (2 bytes).".to_string()),
                Call::Log("error", "Unexpected hub message: {\"payload\":\"?\"}".to_string()),
            ]
        );
    }

    #[test]
    fn configured_status_broker_receives_status() {
        let recorder = Recorder::default();
        let ctx = context(&recorder);
        let config = Config {
            status_broker_server: Some("192.168.1.16".to_string()),
            status_broker_port: 1884,
            ..Config::default()
        };

        HostStatusScript::from_config(&config).on_startup_completed(&ctx).unwrap();

        let calls = recorder.calls();
        assert_eq!(
            calls[2],
            Call::PublishExternal(json!({
                "server": "192.168.1.16",
                "port": 1884,
                "topic": STATUS_TOPIC,
                "payload": "online",
                "retain": true
            }))
        );
        assert_eq!(
            calls[3],
            Call::Log("debug", "Status 'online' sent to 192.168.1.16:1884.".to_string())
        );
    }

    #[test]
    fn unreachable_status_broker_is_a_warning() {
        let recorder = Recorder::with_external_result(json!({"type": "exception.connecting_failed"}));
        let ctx = context(&recorder);

        HostStatusScript::new(Some(("192.168.1.16".to_string(), 1883)))
            .on_startup_completed(&ctx)
            .unwrap();

        assert_eq!(
            recorder.calls().last(),
            Some(&Call::Log("warning", "Status broker 192.168.1.16:1883 is not reachable.".to_string()))
        );
    }

    #[test]
    fn failed_status_publish_is_a_script_error() {
        let recorder = Recorder::with_external_result(json!({
            "type": "exception.timeout",
            "exception.type": "Timeout",
            "exception.message": "Publish was not completed within 5s."
        }));
        let ctx = context(&recorder);

        let result = HostStatusScript::new(Some(("192.168.1.16".to_string(), 1883))).on_startup_completed(&ctx);

        assert!(matches!(result, Err(ScriptError::Failed(_))));
    }

    #[test]
    fn shutdown_stops_imports_and_announces_offline() {
        let recorder = Recorder::default();
        let ctx = context(&recorder);
        ctx.mqtt.start_topic_import("heating-server", json!({})).unwrap();

        HostStatusScript::new(None).on_shutdown(&ctx).unwrap();

        assert_eq!(
            recorder.calls()[1..].to_vec(),
            vec![
                Call::Unsubscribe(TRAFFIC_SUBSCRIPTION.to_string()),
                Call::StopTopicImport("heating-server".to_string()),
                Call::Log("info", "Topic import 'heating-server' stopped.".to_string()),
                Call::Publish(status("offline")),
            ]
        );
        assert!(ctx.mqtt.topic_import_uids().is_empty());
    }
}
