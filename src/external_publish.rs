//! One-shot publishes to brokers other than the local hub: connect, publish
//! a single message, disconnect.

use crate::models::ExternalPublishParameters;
use crate::topic_importer::build_mqtt_options;
use log::{debug, warn};
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, Outgoing, Packet, QoS};
use serde_json::{json, Value};
use std::thread;
use thiserror::Error;
use tokio::time::{timeout, Duration};

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ExternalPublishError {
    #[error("Connecting to '{0}' failed: {1}")]
    ConnectingFailed(String, String),
    #[error("Publish was not completed within {0:?}.")]
    Timeout(Duration),
    #[error("Connection failed while publishing: {0}")]
    Connection(String),
    #[error("Client request failed: {0}")]
    Client(#[from] ClientError),
    #[error("Publish worker failed: {0}")]
    Worker(String),
}

impl ExternalPublishError {
    fn result_type(&self) -> &'static str {
        match self {
            Self::ConnectingFailed(..) => "exception.connecting_failed",
            Self::Timeout(_) => "exception.timeout",
            Self::Client(_) => "exception.invalid_operation",
            Self::Connection(_) | Self::Worker(_) => "exception",
        }
    }

    fn exception_type(&self) -> &'static str {
        match self {
            Self::ConnectingFailed(..) => "ConnectingFailed",
            Self::Timeout(_) => "Timeout",
            Self::Connection(_) => "Connection",
            Self::Client(_) => "Client",
            Self::Worker(_) => "Worker",
        }
    }

    /// Result mapping handed back to scripts.
    pub fn to_value(&self) -> Value {
        match self {
            Self::ConnectingFailed(..) => json!({ "type": self.result_type() }),
            _ => json!({
                "type": self.result_type(),
                "exception.type": self.exception_type(),
                "exception.message": self.to_string(),
            }),
        }
    }
}

pub fn success_value() -> Value {
    json!({ "type": "success" })
}

/// Publishes one message and disconnects. `parameters.timeout` bounds the
/// connect and the publish handshake together.
pub async fn publish(parameters: &ExternalPublishParameters) -> Result<(), ExternalPublishError> {
    let address = format!("{}:{}", parameters.server, parameters.port);
    let options = build_mqtt_options(
        &parameters.client_id,
        &parameters.server,
        parameters.port,
        parameters.username.as_deref(),
        parameters.password.as_deref(),
        parameters.use_tls,
    );
    let (client, mut eventloop) = AsyncClient::new(options, 10);

    let message = &parameters.message;
    client
        .publish(message.topic.clone(), message.qos, message.retain, message.payload.clone())
        .await?;

    let mut connected = false;
    let outcome = timeout(
        parameters.timeout,
        drive(&mut eventloop, message.qos, &address, &mut connected),
    )
    .await;
    let result = match outcome {
        Ok(result) => result,
        Err(_) if !connected => Err(ExternalPublishError::ConnectingFailed(
            address.clone(),
            format!("no CONNACK within {:?}", parameters.timeout),
        )),
        Err(_) => Err(ExternalPublishError::Timeout(parameters.timeout)),
    };

    if connected {
        disconnect(&client, &mut eventloop, &address).await;
    }
    result
}

/// Polls until the publish is complete for its QoS level.
async fn drive(
    eventloop: &mut EventLoop,
    qos: QoS,
    address: &str,
    connected: &mut bool,
) -> Result<(), ExternalPublishError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                debug!("Connected to '{}' for external publish.", address);
                *connected = true;
            }
            Ok(Event::Outgoing(Outgoing::Publish(_))) if qos == QoS::AtMostOnce => return Ok(()),
            Ok(Event::Incoming(Packet::PubAck(_))) if qos == QoS::AtLeastOnce => return Ok(()),
            Ok(Event::Incoming(Packet::PubComp(_))) if qos == QoS::ExactlyOnce => return Ok(()),
            Ok(_) => {}
            Err(e) if !*connected => {
                return Err(ExternalPublishError::ConnectingFailed(address.to_string(), e.to_string()))
            }
            Err(e) => return Err(ExternalPublishError::Connection(e.to_string())),
        }
    }
}

async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop, address: &str) {
    if let Err(e) = client.disconnect().await {
        debug!("Could not request disconnect from '{}': {}", address, e);
        return;
    }

    let sent = timeout(DISCONNECT_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
    })
    .await;

    if !matches!(sent, Ok(true)) {
        warn!("Disconnect from '{}' was not sent cleanly.", address);
    }
}

/// Runs [`publish`] to completion from synchronous code. The publish gets
/// its own thread and runtime so callers already inside a runtime do not
/// nest one.
pub fn publish_blocking(parameters: &ExternalPublishParameters) -> Result<(), ExternalPublishError> {
    thread::scope(|scope| {
        let worker = scope.spawn(|| {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| ExternalPublishError::Worker(e.to_string()))?;
            runtime.block_on(publish(parameters))
        });
        worker
            .join()
            .unwrap_or_else(|_| Err(ExternalPublishError::Worker("publish thread panicked".to_string())))
    })
}
