//! A2A Client Adapter
//!
//! HTTP implementation of [`RemoteAgentTransport`]: fetches agent cards and
//! talks JSON-RPC to the agent's base URL. `message/stream` responses are
//! read as server-sent events, one JSON-RPC response per event.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::protocol::{
    message_params, JsonRpcRequest, JsonRpcResponse, EXTENDED_CARD_PATH, METHOD_CANCEL,
    METHOD_SEND, METHOD_STREAM, PUBLIC_CARD_PATH,
};
use crate::domain::{RemoteAgentTransport, RemoteRequest, RemoteStream, RemoteUpdate};
use crate::error::{DiscoveryError, DiscoveryResult, DispatchError, DispatchResult};
use crate::registry::normalize_address;

pub struct HttpA2aTransport {
    client: Client,
    request_id: AtomicU64,
}

impl HttpA2aTransport {
    /// `connect_timeout` bounds connection setup only; call deadlines are
    /// enforced by the caller
    pub fn new(connect_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_default();
        Self::with_client(client)
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            request_id: AtomicU64::new(0),
        }
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn get_card(
        &self,
        address: &str,
        path: &str,
        credential: Option<&SecretString>,
    ) -> DiscoveryResult<Value> {
        let url = format!("{}{}", normalize_address(address), path);
        let mut req_builder = self.client.get(&url);
        if let Some(credential) = credential {
            req_builder = req_builder.bearer_auth(credential.expose_secret());
        }

        let response = req_builder.send().await.map_err(|e| DiscoveryError::Unreachable {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(DiscoveryError::Unauthorized {
                address: address.to_string(),
                reason: status.to_string(),
            });
        }
        if status.is_server_error() {
            return Err(DiscoveryError::Unreachable {
                address: address.to_string(),
                reason: format!("server returned {}", status),
            });
        }
        if !status.is_success() {
            return Err(DiscoveryError::Malformed {
                address: address.to_string(),
                reason: format!("card request returned {}", status),
            });
        }

        response.json().await.map_err(|e| DiscoveryError::Malformed {
            address: address.to_string(),
            reason: e.to_string(),
        })
    }

    async fn post(&self, address: &str, method: &str, params: Value) -> DispatchResult<reqwest::Response> {
        let request = JsonRpcRequest::new(self.next_id(), method, params);
        debug!(address = %address, method = %method, "Sending JSON-RPC request");

        let response = self
            .client
            .post(normalize_address(address))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("agent returned {}: {}", status, text);
            return Err(if status.is_server_error() {
                DispatchError::Transport(message)
            } else {
                DispatchError::Protocol(message)
            });
        }
        Ok(response)
    }

    async fn call(&self, address: &str, method: &str, params: Value) -> DispatchResult<Value> {
        let response: JsonRpcResponse = self.post(address, method, params).await?.json().await?;
        response.into_result()
    }

    async fn open_stream(&self, address: &str, params: Value) -> DispatchResult<RemoteStream> {
        let response = self.post(address, METHOD_STREAM, params).await?;
        let address = address.to_string();

        let updates = response
            .bytes_stream()
            .eventsource()
            .filter_map(move |event| {
                let address = address.clone();
                async move {
                    match event {
                        Ok(event) if event.data.trim().is_empty() => None,
                        Ok(event) => Some(parse_event(&event.data)),
                        Err(e) => {
                            warn!(address = %address, error = %e, "Event stream broke");
                            Some(Err(DispatchError::Transport(e.to_string())))
                        }
                    }
                }
            });
        Ok(Box::pin(updates))
    }
}

fn parse_event(data: &str) -> DispatchResult<RemoteUpdate> {
    let response: JsonRpcResponse = serde_json::from_str(data)?;
    RemoteUpdate::from_result(&response.into_result()?)
}

#[async_trait]
impl RemoteAgentTransport for HttpA2aTransport {
    async fn fetch_card(&self, address: &str) -> DiscoveryResult<Value> {
        self.get_card(address, PUBLIC_CARD_PATH, None).await
    }

    async fn fetch_extended_card(
        &self,
        address: &str,
        credential: &SecretString,
    ) -> DiscoveryResult<Value> {
        self.get_card(address, EXTENDED_CARD_PATH, Some(credential)).await
    }

    async fn send(&self, address: &str, request: &RemoteRequest) -> DispatchResult<RemoteStream> {
        let params = message_params(request);
        if request.streaming {
            return self.open_stream(address, params).await;
        }

        let result = self.call(address, METHOD_SEND, params).await?;
        let update = RemoteUpdate::from_result(&result)?.finished();
        Ok(Box::pin(futures::stream::once(async move { Ok(update) })))
    }

    async fn cancel(&self, address: &str, remote_task_id: &str) -> DispatchResult<()> {
        self.call(address, METHOD_CANCEL, json!({ "id": remote_task_id }))
            .await
            .map(|_| ())
    }
}
