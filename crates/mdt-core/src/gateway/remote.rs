//! Hosted gateway client
//!
//! Snapshot queries and mutations go over the project's REST endpoint
//! (`/rest/v1/<table>`); change feeds use the realtime websocket
//! (`/realtime/v1/websocket`), one socket per subscribed table.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{RequestBuilder, Response};
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::protocol::{ClientMessage, ServerMessage, PROTOCOL_VSN};
use super::{Channel, ChannelSender, ChannelStatus, Gateway};
use crate::config::Config;
use crate::error::GatewayError;
use crate::query::{filter_literal, Query};

/// Gateway for a hosted project
#[derive(Debug, Clone)]
pub struct RemoteGateway {
    http: reqwest::Client,
    rest_url: String,
    realtime_url: String,
    api_key: String,
    heartbeat: Duration,
    refs: Arc<AtomicU64>,
}

impl RemoteGateway {
    /// Create a gateway for the project at `base_url`
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        Self::build(
            base_url,
            &realtime_url_for(base_url),
            api_key,
            Duration::from_secs(30),
            Duration::from_secs(25),
        )
    }

    /// Create a gateway from loaded configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let Some(ref base_url) = config.gateway_url else {
            anyhow::bail!("Gateway URL not configured. Set gateway_url or MDT_GATEWAY_URL.");
        };
        let Some(ref api_key) = config.api_key else {
            anyhow::bail!("API key not configured. Set api_key or MDT_API_KEY.");
        };

        Self::build(
            base_url,
            &config.realtime_endpoint().unwrap_or_else(|| realtime_url_for(base_url)),
            api_key,
            config.request_timeout(),
            config.heartbeat_interval(),
        )
    }

    fn build(
        base_url: &str,
        realtime_url: &str,
        api_key: &str,
        timeout: Duration,
        heartbeat: Duration,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(api_key).context("API key is not a valid header value")?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .context("API key is not a valid header value")?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            rest_url: format!("{}/rest/v1", base_url.trim_end_matches('/')),
            realtime_url: realtime_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            heartbeat,
            refs: Arc::new(AtomicU64::new(1)),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.rest_url, table)
    }

    fn socket_url(&self) -> String {
        format!(
            "{}/realtime/v1/websocket?apikey={}&vsn={}",
            self.realtime_url, self.api_key, PROTOCOL_VSN
        )
    }

    fn next_ref(&self) -> String {
        self.refs.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Send a request that returns the affected rows
    async fn send_rows(&self, request: RequestBuilder) -> Result<Vec<Value>, GatewayError> {
        let response = check_status(request.send().await?).await?;
        Ok(response.json::<Vec<Value>>().await?)
    }
}

/// Derive the websocket base from an http(s) base URL
fn realtime_url_for(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        trimmed.to_string()
    }
}

async fn check_status(response: Response) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    // Error bodies are `{"message": ..}` objects; fall back to raw text
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(body);

    Err(GatewayError::Status {
        status: status.as_u16(),
        message,
    })
}

fn first_row(rows: Vec<Value>, table: &str, id: Option<&str>) -> Result<Value, GatewayError> {
    rows.into_iter().next().ok_or_else(|| match id {
        Some(id) => GatewayError::Status {
            status: 404,
            message: format!("no '{}' row with id '{}'", table, id),
        },
        None => GatewayError::InvalidResponse(format!("'{}' insert returned no row", table)),
    })
}

#[async_trait]
impl Gateway for RemoteGateway {
    async fn query(&self, table: &str, query: &Query) -> Result<Vec<Value>, GatewayError> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        if let Some(ref filter) = query.filter {
            for (column, value) in filter.conditions() {
                params.push((column.clone(), format!("eq.{}", filter_literal(value))));
            }
        }
        if let Some(order) = query.order {
            params.push(("order".to_string(), order.to_clause()));
        }

        debug!(table, "Fetching snapshot");
        self.send_rows(self.http.get(self.table_url(table)).query(&params))
            .await
    }

    async fn insert(&self, table: &str, record: Value) -> Result<Value, GatewayError> {
        let rows = self
            .send_rows(
                self.http
                    .post(self.table_url(table))
                    .header("Prefer", "return=representation")
                    .json(&record),
            )
            .await?;
        first_row(rows, table, None)
    }

    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value, GatewayError> {
        let rows = self
            .send_rows(
                self.http
                    .patch(self.table_url(table))
                    .query(&[("id", format!("eq.{}", id))])
                    .header("Prefer", "return=representation")
                    .json(&patch),
            )
            .await?;
        first_row(rows, table, Some(id))
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), GatewayError> {
        let request = self
            .http
            .delete(self.table_url(table))
            .query(&[("id", format!("eq.{}", id))]);
        check_status(request.send().await?).await?;
        Ok(())
    }

    async fn subscribe_changes(&self, table: &str) -> Result<Channel, GatewayError> {
        debug!(table, url = %self.realtime_url, "Opening realtime socket");
        let (ws_stream, _response) = connect_async(self.socket_url()).await?;

        let (sender, channel) = Channel::pair();
        tokio::spawn(realtime_loop(
            ws_stream,
            table.to_string(),
            self.api_key.clone(),
            self.heartbeat,
            Arc::clone(&self.refs),
            sender,
        ));

        Ok(channel)
    }
}

/// Pump one realtime socket into a change feed channel
///
/// Runs until the socket closes, the server reports an error, or the
/// receiving side of the channel is dropped.
async fn realtime_loop<S>(
    ws_stream: S,
    table: String,
    api_key: String,
    heartbeat: Duration,
    refs: Arc<AtomicU64>,
    sender: ChannelSender,
) where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = ws_stream.split();
    let next_ref = || refs.fetch_add(1, Ordering::Relaxed).to_string();

    let join_ref = next_ref();
    let join = ClientMessage::join(&table, Some(&api_key), &join_ref);
    if let Err(e) = send(&mut write, &join).await {
        sender.status(ChannelStatus::ChannelError(e.to_string()));
        return;
    }

    let mut ticker = tokio::time::interval(heartbeat);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match ServerMessage::decode(&text) {
                            Ok(message) => {
                                if !handle_server_message(message, &join_ref, &table, &sender) {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(table = %table, "Failed to decode realtime frame: {}", e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        sender.status(ChannelStatus::ChannelError(
                            "realtime socket closed".to_string(),
                        ));
                        break;
                    }
                    Some(Err(e)) => {
                        sender.status(ChannelStatus::ChannelError(e.to_string()));
                        break;
                    }
                    _ => {}
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = send(&mut write, &ClientMessage::heartbeat(&next_ref())).await {
                    sender.status(ChannelStatus::ChannelError(e.to_string()));
                    break;
                }
            }
            _ = sender.closed() => {
                debug!(table = %table, "Change feed dropped, leaving topic");
                send(&mut write, &ClientMessage::leave(&table, &next_ref())).await.ok();
                break;
            }
        }
    }

    write.close().await.ok();
}

/// Returns false when the feed is finished
fn handle_server_message(
    message: ServerMessage,
    join_ref: &str,
    table: &str,
    sender: &ChannelSender,
) -> bool {
    match message {
        ServerMessage::Reply {
            payload, reference, ..
        } if reference.as_deref() == Some(join_ref) => {
            if payload.is_ok() {
                info!(table, "Realtime subscription acknowledged");
                sender.status(ChannelStatus::Subscribed)
            } else {
                sender.status(ChannelStatus::ChannelError(payload.reason()));
                false
            }
        }
        ServerMessage::PostgresChanges { payload, .. } => sender.change(payload.data.into()),
        ServerMessage::System { payload, .. } if payload.status != "ok" => {
            let message = payload
                .message
                .unwrap_or_else(|| "realtime extension error".to_string());
            sender.status(ChannelStatus::ChannelError(message));
            false
        }
        ServerMessage::Error { .. } => {
            sender.status(ChannelStatus::ChannelError("channel crashed".to_string()));
            false
        }
        ServerMessage::Close { .. } => {
            sender.status(ChannelStatus::ChannelError("channel closed by server".to_string()));
            false
        }
        _ => true,
    }
}

async fn send<W>(write: &mut W, message: &ClientMessage) -> Result<(), GatewayError>
where
    W: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = message
        .encode()
        .map_err(|e| GatewayError::Realtime(e.to_string()))?;
    write.send(Message::Text(text)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::protocol::{ChangeData, ChangesPayload, ReplyPayload, SystemPayload};
    use crate::gateway::{ChangeKind, ChannelMessage};
    use serde_json::json;

    #[test]
    fn test_realtime_url_for() {
        assert_eq!(
            realtime_url_for("https://abc.supabase.co/"),
            "wss://abc.supabase.co"
        );
        assert_eq!(realtime_url_for("http://localhost:54321"), "ws://localhost:54321");
    }

    #[test]
    fn test_urls() {
        let gateway = RemoteGateway::new("https://abc.example.co", "key").unwrap();
        assert_eq!(gateway.table_url("units"), "https://abc.example.co/rest/v1/units");
        assert_eq!(
            gateway.socket_url(),
            "wss://abc.example.co/realtime/v1/websocket?apikey=key&vsn=1.0.0"
        );
    }

    #[test]
    fn test_from_config_requires_url_and_key() {
        let config = Config::default();
        assert!(RemoteGateway::from_config(&config).is_err());

        let config = Config {
            gateway_url: Some("https://abc.example.co".to_string()),
            api_key: Some("key".to_string()),
            ..Config::default()
        };
        assert!(RemoteGateway::from_config(&config).is_ok());
    }

    #[test]
    fn test_refs_are_unique() {
        let gateway = RemoteGateway::new("https://abc.example.co", "key").unwrap();
        assert_ne!(gateway.next_ref(), gateway.next_ref());
    }

    #[tokio::test]
    async fn test_join_reply_acknowledges() {
        let (sender, mut channel) = Channel::pair();
        let reply = ServerMessage::Reply {
            topic: "realtime:public:units".to_string(),
            payload: ReplyPayload {
                status: "ok".to_string(),
                response: json!({}),
            },
            reference: Some("3".to_string()),
        };

        assert!(handle_server_message(reply, "3", "units", &sender));
        assert_eq!(
            channel.next().await,
            Some(ChannelMessage::Status(ChannelStatus::Subscribed))
        );
    }

    #[tokio::test]
    async fn test_heartbeat_reply_is_ignored() {
        let (sender, _channel) = Channel::pair();
        let reply = ServerMessage::Reply {
            topic: "phoenix".to_string(),
            payload: ReplyPayload {
                status: "ok".to_string(),
                response: json!({}),
            },
            reference: Some("9".to_string()),
        };
        assert!(handle_server_message(reply, "3", "units", &sender));
    }

    #[tokio::test]
    async fn test_changes_are_forwarded() {
        let (sender, mut channel) = Channel::pair();
        let message = ServerMessage::PostgresChanges {
            topic: "realtime:public:units".to_string(),
            payload: ChangesPayload {
                data: ChangeData {
                    kind: ChangeKind::Insert,
                    record: Some(json!({"id": "u2", "name": "Bravo"})),
                    old_record: None,
                },
            },
        };

        assert!(handle_server_message(message, "1", "units", &sender));
        match channel.next().await {
            Some(ChannelMessage::Change(change)) => {
                assert_eq!(change.event_type, ChangeKind::Insert)
            }
            other => panic!("Expected change, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_system_error_ends_feed() {
        let (sender, mut channel) = Channel::pair();
        let message = ServerMessage::System {
            topic: "realtime:public:units".to_string(),
            payload: SystemPayload {
                status: "error".to_string(),
                message: Some("table not in publication".to_string()),
            },
        };

        assert!(!handle_server_message(message, "1", "units", &sender));
        assert_eq!(
            channel.next().await,
            Some(ChannelMessage::Status(ChannelStatus::ChannelError(
                "table not in publication".to_string()
            )))
        );
    }
}
