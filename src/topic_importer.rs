use crate::message_hub::MessageHub;
use crate::models::{ImportTopicParameters, PublishParameters};
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Transport};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

/// How long `stop` waits for the DISCONNECT to go out before aborting.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error(message) => write!(f, "error ({})", message),
        }
    }
}

/// Client options shared by topic imports and one-shot external publishes.
pub fn build_mqtt_options(
    client_id: &str,
    server: &str,
    port: u16,
    username: Option<&str>,
    password: Option<&str>,
    use_tls: bool,
) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(client_id, server, port);
    mqtt_options.set_keep_alive(Duration::from_secs(10));
    mqtt_options.set_clean_session(true);

    if let Some(username) = username {
        mqtt_options.set_credentials(username, password.unwrap_or_default());
    }

    if use_tls {
        mqtt_options.set_transport(Transport::tls_with_default_config());
    }

    mqtt_options
}

/// Mirrors one topic (filter) of a remote broker into the local hub.
pub struct TopicImporter {
    uid: String,
    client: AsyncClient,
    client_state: Arc<Mutex<ClientState>>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TopicImporter {
    /// Creates the client and spawns its connection task. Must run inside a
    /// tokio runtime.
    pub fn start(
        uid: &str,
        parameters: ImportTopicParameters,
        hub: Arc<MessageHub>,
        reconnect_interval: Duration,
    ) -> Self {
        debug!(
            "Configuring topic import '{}' for {}:{}...",
            uid, parameters.server, parameters.port
        );

        let mqtt_options = build_mqtt_options(
            &parameters.client_id,
            &parameters.server,
            parameters.port,
            parameters.username.as_deref(),
            parameters.password.as_deref(),
            parameters.use_tls,
        );

        let (client, eventloop) = AsyncClient::new(mqtt_options, 10);
        let client_state = Arc::new(Mutex::new(ClientState::Connecting));
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(maintain_connection(
            uid.to_string(),
            parameters,
            client.clone(),
            eventloop,
            client_state.clone(),
            stop_rx,
            hub,
            reconnect_interval,
        ));

        Self {
            uid: uid.to_string(),
            client,
            client_state,
            stop_tx,
            task,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn state(&self) -> ClientState {
        self.client_state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Sends DISCONNECT through the connection task and waits for it to end.
    /// The task is aborted if it does not finish within `DISCONNECT_TIMEOUT`.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.client.try_disconnect() {
            debug!("Importer '{}' could not request disconnect: {}", self.uid, e);
        }

        let mut task = self.task;
        if timeout(DISCONNECT_TIMEOUT, &mut task).await.is_err() {
            warn!("Importer '{}' did not disconnect in time. Aborting.", self.uid);
            task.abort();
        }
        set_state(&self.client_state, ClientState::Disconnected);
    }
}

fn set_state(client_state: &Mutex<ClientState>, state: ClientState) {
    match client_state.lock() {
        Ok(mut guard) => *guard = state,
        Err(poisoned) => *poisoned.into_inner() = state,
    }
}

#[allow(clippy::too_many_arguments)]
async fn maintain_connection(
    uid: String,
    parameters: ImportTopicParameters,
    client: AsyncClient,
    mut eventloop: EventLoop,
    client_state: Arc<Mutex<ClientState>>,
    mut stop_rx: watch::Receiver<bool>,
    hub: Arc<MessageHub>,
    reconnect_interval: Duration,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(
                    "Importer '{}' connected to {}:{}.",
                    uid, parameters.server, parameters.port
                );
                // Clean sessions drop subscriptions, so subscribe on every connect.
                match client.subscribe(&parameters.topic, parameters.qos).await {
                    Ok(_) => set_state(&client_state, ClientState::Connected),
                    Err(e) => {
                        error!(
                            "Importer '{}' failed to subscribe to topic '{}': {}",
                            uid, parameters.topic, e
                        );
                        set_state(&client_state, ClientState::Error(e.to_string()));
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                hub.publish(PublishParameters {
                    qos: publish.qos,
                    retain: publish.retain,
                    ..PublishParameters::new(publish.topic.clone(), publish.payload.to_vec())
                });
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                debug!("Importer '{}' subscribed to '{}'.", uid, parameters.topic);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("Importer '{}' disconnected from {}.", uid, parameters.server);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if *stop_rx.borrow() {
                    break;
                }

                error!("Error while maintaining MQTT client connection of importer '{}': {:?}", uid, e);
                set_state(&client_state, ClientState::Error(e.to_string()));

                warn!(
                    "Importer '{}' lost connection to {}:{}. Retrying in {:?}...",
                    uid, parameters.server, parameters.port, reconnect_interval
                );
                tokio::select! {
                    _ = sleep(reconnect_interval) => {}
                    _ = stop_rx.changed() => break,
                }
                set_state(&client_state, ClientState::Connecting);
            }
        }
    }
}
