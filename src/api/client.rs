use crate::api::models::{ChatId, ChatRecord, Conversation, MediaUpload, Message, UserId, UserSummary};
use crate::auth::{CredentialSource, Credentials};
use crate::error::{Error, Result};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client as HttpClient;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::time::Duration;

/// Backend surface the messaging core depends on.
#[async_trait]
pub trait MessengerApi: Send + Sync {
    async fn conversations(&self) -> Result<Vec<Conversation>>;
    async fn messages(&self, chat_id: ChatId) -> Result<Vec<Message>>;
    async fn mark_read(&self, chat_id: ChatId) -> Result<()>;
    async fn send_message(&self, receiver_id: UserId, content: &str) -> Result<()>;
    async fn send_media(
        &self,
        receiver_id: UserId,
        content: Option<&str>,
        media: Vec<MediaUpload>,
    ) -> Result<()>;
    async fn unread_count(&self) -> Result<u64>;
    async fn user(&self, user_id: UserId) -> Result<UserSummary>;
}

pub struct ApiClient {
    pub http: HttpClient,
    base_api: String,
    credentials: Credentials,
}

impl ApiClient {
    pub fn new(base_url: &str, credentials: Credentials) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_api: Self::base_api(base_url),
            credentials,
        })
    }

    fn base_api(base_url: &str) -> String {
        let trimmed = base_url.trim_end_matches('/');
        if trimmed.ends_with("/api") { trimmed.to_string() } else { format!("{}/api", trimmed) }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_api, path)
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let token = self.credentials.bearer_token().ok_or(Error::NotAuthenticated)?;
        Ok(req.bearer_auth(token))
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let req = self.with_auth(self.http.get(self.endpoint(path)))?;
        read_body(req.send().await?).await
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let req = self.with_auth(self.http.post(self.endpoint(path)).json(body))?;
        read_body(req.send().await?).await
    }
}

async fn read_body(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    if !status.is_success() {
        let message = resp.text().await.unwrap_or_default();
        return Err(Error::Status {
            status: status.as_u16(),
            message: message.trim().to_string(),
        });
    }
    let text = resp.text().await?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    unwrap_envelope(serde_json::from_str(&text)?)
}

/// Strips the `{success, data, error}` wrapper when the backend uses it.
fn unwrap_envelope(json: Value) -> Result<Value> {
    if json.get("success").and_then(Value::as_bool) == Some(false) {
        let reason = json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("request rejected");
        return Err(Error::Rejected(reason.to_string()));
    }
    match json {
        Value::Object(mut map) if map.contains_key("data") => {
            Ok(map.remove("data").unwrap_or(Value::Null))
        }
        other => Ok(other),
    }
}

fn extract_list(json: Value, keys: &[&str]) -> Vec<Value> {
    match json {
        Value::Array(items) => items,
        Value::Object(mut map) => keys
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl MessengerApi for ApiClient {
    async fn conversations(&self) -> Result<Vec<Conversation>> {
        let json = self.get_json("/conversations").await?;
        let items = extract_list(json, &["conversations", "chats", "data"]);
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<ChatRecord>(item) {
                Ok(record) => {
                    let id = record.id;
                    match record.into_conversation() {
                        Some(conv) => out.push(conv),
                        None => warn!("skipping conversation {id}: no counterpart or invalid id"),
                    }
                }
                Err(e) => warn!("skipping malformed conversation record: {e}"),
            }
        }
        debug!("fetched {} conversations", out.len());
        Ok(out)
    }

    async fn messages(&self, chat_id: ChatId) -> Result<Vec<Message>> {
        let json = self.get_json(&format!("/conversations/{chat_id}/messages")).await?;
        let items = extract_list(json, &["messages", "data"]);
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<Message>(item) {
                Ok(msg) => out.push(msg),
                Err(e) => warn!("skipping malformed message in chat {chat_id}: {e}"),
            }
        }
        Ok(out)
    }

    async fn mark_read(&self, chat_id: ChatId) -> Result<()> {
        self.post_json(&format!("/conversations/{chat_id}/mark-read"), &serde_json::json!({}))
            .await?;
        Ok(())
    }

    async fn send_message(&self, receiver_id: UserId, content: &str) -> Result<()> {
        let body = serde_json::json!({
            "receiver_id": receiver_id,
            "content": content,
        });
        self.post_json("/messages/send", &body).await?;
        Ok(())
    }

    async fn send_media(
        &self,
        receiver_id: UserId,
        content: Option<&str>,
        media: Vec<MediaUpload>,
    ) -> Result<()> {
        let mut form = Form::new().text("receiver_id", receiver_id.to_string());
        if let Some(text) = content.filter(|t| !t.trim().is_empty()) {
            form = form.text("content", text.trim().to_string());
        }
        for upload in media {
            let mut part = Part::bytes(upload.bytes).file_name(upload.file_name);
            if let Some(mime) = upload.content_type {
                part = part.mime_str(&mime)?;
            }
            form = form.part("media", part);
        }
        let req = self.with_auth(self.http.post(self.endpoint("/messages/send-media")).multipart(form))?;
        read_body(req.send().await?).await?;
        Ok(())
    }

    async fn unread_count(&self) -> Result<u64> {
        let json = self.get_json("/messages/unread").await?;
        Ok(json.get("count").and_then(Value::as_u64).unwrap_or(0))
    }

    async fn user(&self, user_id: UserId) -> Result<UserSummary> {
        let json = self.get_json(&format!("/users/{user_id}")).await?;
        let json = match json {
            Value::Object(mut map) if map.contains_key("user") => map.remove("user").unwrap_or(Value::Null),
            other => other,
        };
        Ok(serde_json::from_value(json)?)
    }
}
