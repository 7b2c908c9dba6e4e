//! Telegram integration: delivery client and source listener.
//!
//! Built on the Bot API, which has one structural gap: it does not emit
//! deletion updates, so delete synchronization only runs when another
//! ingestion path supplies `Deleted` events. Creations and edits arrive
//! as `channel_post` / `edited_channel_post` updates.

use crate::config::SessionConfig;
use crate::error::{RelayError, RelayResult};
use crate::events::{RawMessage, RawSourceEvent};
use crate::router::DeliveryClient;
use crate::session::SourceListener;
use async_trait::async_trait;
use dashmap::DashMap;
use secrecy::{ExposeSecret, SecretString};
use teloxide::prelude::*;
use teloxide::types::{ChatId, InputFile, MessageId, Recipient, UpdateKind};
use teloxide::{ApiError, RequestError};
use tokio::sync::mpsc;

/// `@username` or a numeric chat id, as validated by the config layer.
fn recipient(channel: &str) -> Recipient {
    match channel.parse::<i64>() {
        Ok(id) => Recipient::Id(ChatId(id)),
        Err(_) => Recipient::ChannelUsername(channel.to_string()),
    }
}

fn map_request_err(e: RequestError) -> RelayError {
    match e {
        RequestError::RetryAfter(secs) => RelayError::RateLimited {
            retry_after: Some(secs.duration()),
        },
        RequestError::Network(e) => RelayError::TransientNetwork(e.to_string()),
        RequestError::Io(e) => RelayError::TransientNetwork(e.to_string()),
        other => RelayError::Rejected(other.to_string()),
    }
}

/// Delivery through the Bot API. Bots are cached per token so the fan-out
/// reuses one HTTP client per credential.
#[derive(Default)]
pub struct TelegramDelivery {
    bots: DashMap<String, Bot>,
}

impl TelegramDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    fn bot(&self, credential: &SecretString) -> Bot {
        self.bots
            .entry(credential.expose_secret().to_string())
            .or_insert_with(|| Bot::new(credential.expose_secret()))
            .clone()
    }
}

#[async_trait]
impl DeliveryClient for TelegramDelivery {
    async fn send(
        &self,
        credential: &SecretString,
        channel: &str,
        text: &str,
        image: Option<&[u8]>,
    ) -> RelayResult<i64> {
        let bot = self.bot(credential);
        let message = match image {
            Some(bytes) => {
                let photo = InputFile::memory(bytes.to_vec());
                let mut req = bot.send_photo(recipient(channel), photo);
                if !text.is_empty() {
                    req = req.caption(text.to_string());
                }
                req.await.map_err(map_request_err)?
            }
            None => bot
                .send_message(recipient(channel), text.to_string())
                .await
                .map_err(map_request_err)?,
        };
        Ok(i64::from(message.id.0))
    }

    async fn edit(
        &self,
        credential: &SecretString,
        channel: &str,
        message_id: i64,
        text: &str,
    ) -> RelayResult<()> {
        let bot = self.bot(credential);
        let result = bot
            .edit_message_text(recipient(channel), MessageId(message_id as i32), text.to_string())
            .await;
        match result {
            Ok(_) => Ok(()),
            // Identical content is already in sync
            Err(RequestError::Api(ApiError::MessageNotModified)) => Ok(()),
            Err(e) => Err(map_request_err(e)),
        }
    }

    async fn delete(
        &self,
        credential: &SecretString,
        channel: &str,
        message_id: i64,
    ) -> RelayResult<()> {
        let bot = self.bot(credential);
        let result = bot
            .delete_message(recipient(channel), MessageId(message_id as i32))
            .await;
        match result {
            Ok(_) => Ok(()),
            // Already gone counts as synchronized
            Err(RequestError::Api(ApiError::MessageToDeleteNotFound))
            | Err(RequestError::Api(ApiError::MessageIdInvalid)) => Ok(()),
            Err(e) => Err(map_request_err(e)),
        }
    }
}

/// Long-polling listener for channel posts and edits.
pub struct TelegramListener {
    token: SecretString,
}

impl TelegramListener {
    pub fn new(token: SecretString) -> Self {
        Self { token }
    }
}

#[async_trait]
impl SourceListener for TelegramListener {
    async fn listen(
        &self,
        session: &SessionConfig,
        events: mpsc::Sender<RawSourceEvent>,
    ) -> RelayResult<()> {
        let bot = Bot::new(self.token.expose_secret());

        // Surface a revoked token before entering the poll loop.
        if let Err(e) = bot.get_me().await {
            return match e {
                RequestError::Api(_) => Err(RelayError::CredentialInvalid {
                    session: session.id.clone(),
                }),
                other => Err(map_request_err(other)),
            };
        }

        let mut offset: i32 = 0;
        loop {
            let updates = bot
                .get_updates()
                .offset(offset)
                .timeout(30)
                .await
                .map_err(map_request_err)?;

            for update in updates {
                offset = offset.max(update.id.0 as i32 + 1);
                let event = match update.kind {
                    UpdateKind::ChannelPost(msg) => {
                        raw_message(&bot, &msg).await.map(RawSourceEvent::Created)
                    }
                    UpdateKind::EditedChannelPost(msg) => {
                        raw_message(&bot, &msg).await.map(RawSourceEvent::Edited)
                    }
                    _ => None,
                };
                if let Some(event) = event {
                    if events.send(event).await.is_err() {
                        tracing::info!(session = %session.id, "event channel closed, listener exiting");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn raw_message(bot: &Bot, msg: &Message) -> Option<RawMessage> {
    let channel = match msg.chat.username() {
        Some(name) => format!("@{name}"),
        None => msg.chat.id.0.to_string(),
    };
    let text = msg
        .text()
        .or_else(|| msg.caption())
        .unwrap_or_default()
        .to_string();
    if text.is_empty() && msg.photo().is_none() {
        return None;
    }

    // Largest rendition only; trap hashing works on decoded pixels, so
    // any single rendition is enough.
    let image = match msg.photo().and_then(|sizes| sizes.last()) {
        Some(photo) => match fetch_photo(bot, photo.file.id.clone()).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!(message_id = msg.id.0, error = %e, "photo download failed");
                None
            }
        },
        None => None,
    };

    Some(RawMessage {
        channel,
        message_id: i64::from(msg.id.0),
        text,
        image,
    })
}

async fn fetch_photo(
    bot: &Bot,
    file_id: impl Into<teloxide::types::FileId>,
) -> RelayResult<Vec<u8>> {
    use teloxide::net::Download;

    let file = bot.get_file(file_id.into()).await.map_err(map_request_err)?;
    let mut buf = Vec::new();
    bot.download_file(&file.path, &mut buf)
        .await
        .map_err(|e| RelayError::TransientNetwork(e.to_string()))?;
    Ok(buf)
}
