//! Push delivery back to an open relay connection.
//!
//! A connection is either terminated by this process (`/ws`), in which case a
//! per-socket writer task drains a queue held in the [`ConnectionRegistry`], or
//! held by an API Gateway WebSocket API, in which case messages go through the
//! gateway's management API via the [`CallbackChannel`].

use super::protocol::OutboundMessage;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, timeout::TimeoutConfig};
use aws_sdk_apigatewaymanagement::{
    Client as GatewayClient, Config as GatewayConfig, error::DisplayErrorContext,
    primitives::Blob,
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

/// Capacity of each local connection's outbound queue. A full queue applies
/// back-pressure to the sender.
const OUTBOUND_QUEUE_CAPACITY: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Connection {0} is not open")]
    NotConnected(String),
    #[error("Connection {0} has no callback endpoint (missing domain or stage)")]
    NoEndpoint(String),
    #[error("Failed to serialize outbound message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Gateway delivery failed: {0}")]
    Gateway(String),
}

/// Where an outbound message should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAddress {
    pub connection_id: String,
    pub domain_name: Option<String>,
    pub stage: Option<String>,
}

impl RelayAddress {
    pub fn local(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            domain_name: None,
            stage: None,
        }
    }

    /// Base URL of the gateway's management API for this connection's stage.
    /// A domain that already names a scheme is used as is.
    pub fn gateway_endpoint(&self) -> Option<String> {
        match (&self.domain_name, &self.stage) {
            (Some(domain), Some(stage)) if !domain.is_empty() && !stage.is_empty() => {
                let domain = domain.trim_end_matches('/');
                if domain.starts_with("https://") || domain.starts_with("http://") {
                    Some(format!("{}/{}", domain, stage))
                } else {
                    Some(format!("https://{}/{}", domain, stage))
                }
            }
            _ => None,
        }
    }
}

/// Pushes a message to the other end of a call's relay connection.
#[async_trait]
pub trait RelayChannel: Send + Sync {
    async fn send(&self, address: &RelayAddress, message: &OutboundMessage)
    -> Result<(), ChannelError>;
}

/// Outbound queues for the connections this process terminates.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, mpsc::Sender<OutboundMessage>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a queue for `connection_id`. The caller owns the receiving end and
    /// is expected to forward everything to the socket.
    pub async fn register(&self, connection_id: &str) -> mpsc::Receiver<OutboundMessage> {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        if self
            .connections
            .write()
            .await
            .insert(connection_id.to_string(), tx)
            .is_some()
        {
            warn!(%connection_id, "Replaced an existing registration for connection");
        }
        debug!(%connection_id, "Connection registered");
        rx
    }

    pub async fn unregister(&self, connection_id: &str) {
        if self.connections.write().await.remove(connection_id).is_some() {
            debug!(%connection_id, "Connection unregistered");
        }
    }

    pub async fn contains(&self, connection_id: &str) -> bool {
        self.connections.read().await.contains_key(connection_id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

#[async_trait]
impl RelayChannel for ConnectionRegistry {
    async fn send(
        &self,
        address: &RelayAddress,
        message: &OutboundMessage,
    ) -> Result<(), ChannelError> {
        // Clone the sender so the map lock is not held while waiting on a full queue.
        let tx = self
            .connections
            .read()
            .await
            .get(&address.connection_id)
            .cloned()
            .ok_or_else(|| ChannelError::NotConnected(address.connection_id.clone()))?;

        tx.send(message.clone())
            .await
            .map_err(|_| ChannelError::NotConnected(address.connection_id.clone()))
    }
}

/// Delivers to connections held by an API Gateway WebSocket API through
/// `PostToConnection`. One SDK client is kept per gateway endpoint.
pub struct CallbackChannel {
    base: GatewayConfig,
    clients: RwLock<HashMap<String, GatewayClient>>,
}

impl CallbackChannel {
    /// Uses the default AWS credential chain (environment, profile, IAM role)
    /// and region.
    pub async fn from_env(timeout: Duration) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .timeout_config(TimeoutConfig::builder().operation_timeout(timeout).build())
            .load()
            .await;
        Self::from_conf(GatewayConfig::new(&sdk_config))
    }

    pub fn from_conf(base: GatewayConfig) -> Self {
        Self {
            base,
            clients: RwLock::new(HashMap::new()),
        }
    }

    async fn client_for(&self, endpoint: &str) -> GatewayClient {
        if let Some(client) = self.clients.read().await.get(endpoint) {
            return client.clone();
        }
        debug!(%endpoint, "Creating gateway management client");
        let client =
            GatewayClient::from_conf(self.base.to_builder().endpoint_url(endpoint).build());
        self.clients
            .write()
            .await
            .entry(endpoint.to_string())
            .or_insert(client)
            .clone()
    }
}

#[async_trait]
impl RelayChannel for CallbackChannel {
    async fn send(
        &self,
        address: &RelayAddress,
        message: &OutboundMessage,
    ) -> Result<(), ChannelError> {
        let endpoint = address
            .gateway_endpoint()
            .ok_or_else(|| ChannelError::NoEndpoint(address.connection_id.clone()))?;
        let payload = serde_json::to_vec(message)?;

        let client = self.client_for(&endpoint).await;
        client
            .post_to_connection()
            .connection_id(&address.connection_id)
            .data(Blob::new(payload))
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_gone_exception() {
                    ChannelError::NotConnected(address.connection_id.clone())
                } else {
                    ChannelError::Gateway(DisplayErrorContext(&service_error).to_string())
                }
            })?;
        Ok(())
    }
}

/// The channel the orchestrator talks to: local sockets first, then the
/// gateway callback when one is configured.
pub struct RelayChannels {
    local: Arc<ConnectionRegistry>,
    callback: Option<CallbackChannel>,
}

impl RelayChannels {
    pub fn new(local: Arc<ConnectionRegistry>, callback: Option<CallbackChannel>) -> Self {
        if callback.is_some() {
            info!("Gateway callback delivery enabled for non-local connections");
        }
        Self { local, callback }
    }
}

#[async_trait]
impl RelayChannel for RelayChannels {
    async fn send(
        &self,
        address: &RelayAddress,
        message: &OutboundMessage,
    ) -> Result<(), ChannelError> {
        if self.local.contains(&address.connection_id).await {
            return self.local.send(address, message).await;
        }
        match &self.callback {
            Some(callback) => callback.send(address, message).await,
            None => Err(ChannelError::NotConnected(address.connection_id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_config::Region;
    use aws_credential_types::Credentials;
    use axum::{
        Router,
        body::Bytes,
        extract::{Path, State},
        http::StatusCode,
        response::IntoResponse,
        routing::post,
    };
    use std::sync::Mutex;

    #[test]
    fn test_gateway_endpoint_requires_domain_and_stage() {
        let address = RelayAddress {
            connection_id: "abc=".to_string(),
            domain_name: Some("example.execute-api.us-east-1.amazonaws.com".to_string()),
            stage: Some("prod".to_string()),
        };
        assert_eq!(
            address.gateway_endpoint().as_deref(),
            Some("https://example.execute-api.us-east-1.amazonaws.com/prod")
        );

        let local_gateway = RelayAddress {
            connection_id: "abc=".to_string(),
            domain_name: Some("http://localhost:3001/".to_string()),
            stage: Some("dev".to_string()),
        };
        assert_eq!(
            local_gateway.gateway_endpoint().as_deref(),
            Some("http://localhost:3001/dev")
        );

        assert_eq!(RelayAddress::local("abc=").gateway_endpoint(), None);
    }

    #[tokio::test]
    async fn test_registry_delivers_in_order() {
        let registry = ConnectionRegistry::new();
        let mut rx = registry.register("conn-1").await;
        let address = RelayAddress::local("conn-1");

        registry
            .send(&address, &OutboundMessage::text("Hi ", false))
            .await
            .unwrap();
        registry
            .send(&address, &OutboundMessage::text("", true))
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(OutboundMessage::text("Hi ", false)));
        assert_eq!(rx.recv().await, Some(OutboundMessage::text("", true)));
    }

    #[tokio::test]
    async fn test_registry_rejects_unknown_and_closed_connections() {
        let registry = ConnectionRegistry::new();
        let err = registry
            .send(&RelayAddress::local("missing"), &OutboundMessage::text("x", true))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NotConnected(id) if id == "missing"));

        let rx = registry.register("conn-2").await;
        drop(rx);
        let err = registry
            .send(&RelayAddress::local("conn-2"), &OutboundMessage::text("x", true))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_registry_unregister() {
        let registry = ConnectionRegistry::new();
        let _rx = registry.register("conn-3").await;
        assert!(registry.contains("conn-3").await);
        assert_eq!(registry.len().await, 1);

        registry.unregister("conn-3").await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_relay_channels_prefers_local_and_fails_without_callback() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut rx = registry.register("local").await;
        let channels = RelayChannels::new(registry.clone(), None);

        channels
            .send(&RelayAddress::local("local"), &OutboundMessage::text("ok", true))
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(OutboundMessage::text("ok", true)));

        let err = channels
            .send(&RelayAddress::local("remote"), &OutboundMessage::text("x", true))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NotConnected(_)));
    }

    type Posted = Arc<Mutex<Vec<(String, String, Vec<u8>)>>>;

    /// Serves `POST /{stage}/@connections/{id}` the way the management API does,
    /// answering every request with `status`.
    async fn spawn_gateway(status: StatusCode) -> (String, Posted) {
        let posted: Posted = Arc::default();
        let app = Router::new()
            .route(
                "/{stage}/@connections/{id}",
                post(
                    move |State(posted): State<Posted>,
                          Path((stage, id)): Path<(String, String)>,
                          body: Bytes| async move {
                        posted.lock().unwrap().push((stage, id, body.to_vec()));
                        if status.is_success() {
                            status.into_response()
                        } else {
                            (
                                status,
                                [("x-amzn-ErrorType", "GoneException")],
                                r#"{"message":"Connection is gone"}"#,
                            )
                                .into_response()
                        }
                    },
                ),
            )
            .with_state(posted.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), posted)
    }

    fn test_channel() -> CallbackChannel {
        CallbackChannel::from_conf(
            GatewayConfig::builder()
                .behavior_version(BehaviorVersion::latest())
                .region(Region::new("us-east-1"))
                .credentials_provider(Credentials::new("AKIDTEST", "secret", None, None, "test"))
                .build(),
        )
    }

    fn gateway_address(domain: &str, connection_id: &str) -> RelayAddress {
        RelayAddress {
            connection_id: connection_id.to_string(),
            domain_name: Some(domain.to_string()),
            stage: Some("prod".to_string()),
        }
    }

    #[tokio::test]
    async fn test_callback_channel_posts_message_to_connection() {
        let (domain, posted) = spawn_gateway(StatusCode::OK).await;
        let channel = test_channel();

        channel
            .send(
                &gateway_address(&domain, "conn-123"),
                &OutboundMessage::text("Hi there", true),
            )
            .await
            .unwrap();

        let posted = posted.lock().unwrap().clone();
        assert_eq!(posted.len(), 1);
        let (stage, id, body) = &posted[0];
        assert_eq!(stage, "prod");
        assert_eq!(id, "conn-123");
        let body: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"type": "text", "token": "Hi there", "last": true})
        );
    }

    #[tokio::test]
    async fn test_callback_channel_maps_gone_connection() {
        let (domain, _posted) = spawn_gateway(StatusCode::GONE).await;
        let channel = test_channel();

        let err = channel
            .send(
                &gateway_address(&domain, "conn-gone"),
                &OutboundMessage::text("x", true),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NotConnected(id) if id == "conn-gone"));
    }

    #[tokio::test]
    async fn test_relay_channels_falls_back_to_gateway() {
        let (domain, posted) = spawn_gateway(StatusCode::OK).await;
        let channels = RelayChannels::new(Arc::new(ConnectionRegistry::new()), Some(test_channel()));

        channels
            .send(
                &gateway_address(&domain, "remote"),
                &OutboundMessage::text("", true),
            )
            .await
            .unwrap();
        assert_eq!(posted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_callback_channel_without_endpoint() {
        let err = test_channel()
            .send(&RelayAddress::local("conn"), &OutboundMessage::text("x", true))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NoEndpoint(_)));
    }
}
