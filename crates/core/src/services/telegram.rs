//! Telegram Bot API implementation of [`DeliveryGateway`].

use std::time::Duration;

use async_trait::async_trait;
use herald_common::config::DeliveryConfig;
use herald_common::{AppError, AppResult};
use herald_db::MessageLocation;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use super::delivery::{
    DeliveryError, DeliveryGateway, MediaItem, MediaKind, MemberStatus, MessageRef,
    classify_provider_error,
};

/// Largest album the Bot API accepts in one `sendMediaGroup` call.
const MAX_MEDIA_GROUP: usize = 10;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    error_code: Option<u16>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message_id: i32,
    chat: ApiChat,
}

#[derive(Debug, Deserialize)]
struct ApiChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct ApiChatMember {
    status: MemberStatus,
}

impl From<ApiMessage> for MessageRef {
    fn from(message: ApiMessage) -> Self {
        Self {
            chat_id: message.chat.id,
            message_id: message.message_id,
        }
    }
}

/// Bot API client.
#[derive(Clone)]
pub struct TelegramGateway {
    client: reqwest::Client,
    base_url: String,
}

impl TelegramGateway {
    /// Build a client from the delivery settings.
    pub fn new(config: &DeliveryConfig) -> AppResult<Self> {
        let token = config
            .bot_token
            .as_deref()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| AppError::Config("delivery.bot_token is required".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: format!("{}/bot{token}", config.api_url.trim_end_matches('/')),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: &Value) -> Result<T, DeliveryError> {
        let response = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("{method} failed: {e}")))?;

        let status = response.status().as_u16();
        let parsed: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| DeliveryError::Transient(format!("Invalid {method} response ({status}): {e}")))?;

        into_result(parsed, status)
    }

    async fn send_single(
        &self,
        contact_id: i64,
        item: &MediaItem,
        caption: Option<&str>,
    ) -> Result<MessageRef, DeliveryError> {
        let (method, field) = match item.kind {
            MediaKind::Photo => ("sendPhoto", "photo"),
            MediaKind::Video => ("sendVideo", "video"),
            MediaKind::Document => ("sendDocument", "document"),
        };
        let mut body = json!({ "chat_id": contact_id });
        body[field] = json!(item.file);
        if let Some(caption) = caption {
            body["caption"] = json!(caption);
            body["parse_mode"] = json!("HTML");
        }
        let message: ApiMessage = self.call(method, &body).await?;
        Ok(message.into())
    }
}

fn into_result<T>(response: ApiResponse<T>, http_status: u16) -> Result<T, DeliveryError> {
    if response.ok {
        if let Some(result) = response.result {
            return Ok(result);
        }
    }

    let code = response.error_code.unwrap_or(http_status);
    let description = response
        .description
        .unwrap_or_else(|| "no description".to_string());

    let error = match classify_provider_error(code, &description) {
        DeliveryError::RateLimited { retry_after } => DeliveryError::RateLimited {
            retry_after: response
                .parameters
                .and_then(|p| p.retry_after)
                .map_or(retry_after, Duration::from_secs),
        },
        other => other,
    };
    Err(error)
}

const fn media_type(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Photo => "photo",
        MediaKind::Video => "video",
        MediaKind::Document => "document",
    }
}

/// `InputMedia` entries for one album; the caption goes on the first item.
fn media_group(items: &[MediaItem], caption: Option<&str>) -> Vec<Value> {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let mut media = json!({
                "type": media_type(item.kind),
                "media": item.file,
            });
            if let (0, Some(caption)) = (i, caption) {
                media["caption"] = json!(caption);
                media["parse_mode"] = json!("HTML");
            }
            media
        })
        .collect()
}

#[async_trait]
impl DeliveryGateway for TelegramGateway {
    async fn send_message(&self, contact_id: i64, html: &str) -> Result<MessageRef, DeliveryError> {
        let body = json!({
            "chat_id": contact_id,
            "text": html,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        let message: ApiMessage = self.call("sendMessage", &body).await?;
        debug!(contact_id, message_id = message.message_id, "Message sent");
        Ok(message.into())
    }

    async fn send_media(
        &self,
        contact_id: i64,
        items: &[MediaItem],
        caption: Option<&str>,
    ) -> Result<Vec<MessageRef>, DeliveryError> {
        if let [item] = items {
            return Ok(vec![self.send_single(contact_id, item, caption).await?]);
        }

        let mut sent = Vec::with_capacity(items.len());
        for (i, chunk) in items.chunks(MAX_MEDIA_GROUP).enumerate() {
            let caption = if i == 0 { caption } else { None };
            let body = json!({
                "chat_id": contact_id,
                "media": media_group(chunk, caption),
            });
            let messages: Vec<ApiMessage> = self.call("sendMediaGroup", &body).await?;
            sent.extend(messages.into_iter().map(MessageRef::from));
        }
        Ok(sent)
    }

    async fn delete_message(&self, location: MessageLocation) -> Result<(), DeliveryError> {
        let body = json!({
            "chat_id": location.chat_id,
            "message_id": location.message_id,
        });
        let _: bool = self.call("deleteMessage", &body).await?;
        Ok(())
    }

    async fn get_member_status(
        &self,
        group_id: i64,
        contact_id: i64,
    ) -> Result<MemberStatus, DeliveryError> {
        let body = json!({ "chat_id": group_id, "user_id": contact_id });
        let member: ApiChatMember = self.call("getChatMember", &body).await?;
        Ok(member.status)
    }
}
