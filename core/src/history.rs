/// History service: request/response path for stored messages
///
/// Endpoints consumed:
///   GET  /api/conversations                  → {"conversations":[ConversationSummary]}
///   GET  /api/conversations/:participant_id  → {"messages":[HistoryRecord]}
use crate::error::{ChatError, Result};
use crate::events::ConversationSummary;
use crate::message::{ChatMessage, Origin};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, AUTHORIZATION};
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// One stored message as returned by the history service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub sender_id: String,
    pub receiver_id: String,
    pub text: String,
    pub client_timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<i64>,
}

impl HistoryRecord {
    /// Validate through the message model, tagging `origin = History`
    pub fn into_message(self) -> Result<ChatMessage> {
        let message = ChatMessage::new(
            self.sender_id,
            self.receiver_id,
            self.text,
            self.client_timestamp,
            Origin::History,
        )?;
        Ok(match self.server_timestamp {
            Some(ts) => message.with_server_timestamp(ts),
            None => message,
        })
    }
}

/// Convert records, skipping (and logging) the ones the model rejects
pub fn records_into_messages(records: Vec<HistoryRecord>) -> Vec<ChatMessage> {
    records
        .into_iter()
        .filter_map(|record| match record.into_message() {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Skipping invalid history record: {}", e);
                None
            }
        })
        .collect()
}

#[async_trait]
pub trait HistoryService: Send + Sync {
    /// Stored messages exchanged with one participant
    async fn fetch_history(&self, participant_id: &str) -> Result<Vec<HistoryRecord>>;

    /// Conversations the signed-in user takes part in
    async fn fetch_conversation_list(&self) -> Result<Vec<ConversationSummary>>;
}

#[derive(Deserialize)]
struct ConversationListResponse {
    conversations: Vec<ConversationSummary>,
}

#[derive(Deserialize)]
struct HistoryResponse {
    messages: Vec<HistoryRecord>,
}

/// `HistoryService` over the REST backend
#[derive(Clone)]
pub struct HttpHistoryService {
    base_url: String,
    auth_token: Option<String>,
    request_timeout: Duration,
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl HttpHistoryService {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
            request_timeout: Duration::from_secs(10),
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let uri = format!("{}{}", self.base_url, path);
        debug!("GET {}", uri);

        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(&uri)
            .header(ACCEPT, "application/json");
        if let Some(token) = &self.auth_token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let req = builder
            .body(Empty::<Bytes>::new())
            .map_err(|e| ChatError::Http(format!("invalid request {}: {}", uri, e)))?;

        let resp = timeout(self.request_timeout, self.client.request(req))
            .await
            .map_err(|_| ChatError::Timeout(format!("GET {}", uri)))?
            .map_err(|e| {
                if e.is_connect() {
                    ChatError::Connection(format!("GET {}: {}", uri, e))
                } else {
                    ChatError::Http(format!("GET {}: {}", uri, e))
                }
            })?;

        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| ChatError::Http(format!("body read error: {}", e)))?
            .to_bytes();

        if !status.is_success() {
            return Err(ChatError::Http(format!(
                "GET {} returned {}: {}",
                uri,
                status,
                String::from_utf8_lossy(&body)
            )));
        }

        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl HistoryService for HttpHistoryService {
    async fn fetch_history(&self, participant_id: &str) -> Result<Vec<HistoryRecord>> {
        let path = format!(
            "/api/conversations/{}",
            urlencoding::encode(participant_id)
        );
        let resp: HistoryResponse = self.get_json(&path).await?;
        Ok(resp.messages)
    }

    async fn fetch_conversation_list(&self) -> Result<Vec<ConversationSummary>> {
        let resp: ConversationListResponse = self.get_json("/api/conversations").await?;
        Ok(resp.conversations)
    }
}
