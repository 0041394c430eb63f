//! Telegram channel: long-polls the Bot API for source messages and
//! delivers composed payloads to destinations.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channels::directory::CachedAuthorDirectory;
use crate::error::ChannelError;
use crate::pipeline::forwarder::Forwarder;
use crate::pipeline::rules::Rule;
use crate::pipeline::types::{
    AuthorId, AuthorInfo, ChatId, ContentKind, Delivery, ForwardPayload, InboundMessage,
    MediaAttachment, MessageSender, PayloadItem, QuotedMessage, ReplyReference, SourceKind,
    TextEntity,
};

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Maximum caption length on media.
const TELEGRAM_MAX_CAPTION_LENGTH: usize = 1024;

/// Most items in one sendMediaGroup call.
const TELEGRAM_MAX_GROUP_SIZE: usize = 10;

/// Back-off after a failed poll.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

// ── API client ──────────────────────────────────────────────────────

/// Thin Bot API client.
#[derive(Clone)]
pub struct TelegramApi {
    bot_token: SecretString,
    client: reqwest::Client,
}

impl TelegramApi {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{method}",
            self.bot_token.expose_secret()
        )
    }

    /// Call `method` and unwrap the `result` field.
    async fn call(&self, method: &str, body: &Value) -> Result<Value, ChannelError> {
        self.call_with_timeout(method, body, None).await
    }

    async fn call_with_timeout(
        &self,
        method: &str,
        body: &Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ChannelError> {
        let mut request = self.client.post(self.api_url(method)).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let resp = request.send().await.map_err(|e| ChannelError::SendFailed {
            name: "telegram".into(),
            reason: format!("{method}: {e}"),
        })?;
        let status = resp.status();
        let data: Value = resp
            .json()
            .await
            .map_err(|e| ChannelError::Http(format!("{method} returned unreadable body ({status}): {e}")))?;

        if data.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(data.get("result").cloned().unwrap_or(Value::Null));
        }

        let description = data
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("no description")
            .to_string();

        // 429 is a throttle, not a verdict on the request.
        if status.is_client_error() && status.as_u16() != 429 {
            Err(ChannelError::Rejected {
                destination: body.get("chat_id").and_then(Value::as_i64).unwrap_or(0),
                reason: format!("{method}: {description}"),
            })
        } else {
            Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!("{method} ({status}): {description}"),
            })
        }
    }

    /// Verify the token. Returns the bot's username.
    pub async fn get_me(&self) -> Result<String, ChannelError> {
        let me = self
            .call("getMe", &json!({}))
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;
        Ok(me
            .get("username")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string())
    }
}

// ── Inbound ─────────────────────────────────────────────────────────

/// A converted update plus every author it mentions.
#[derive(Debug, Clone)]
pub struct ParsedUpdate {
    pub message: InboundMessage,
    pub authors: Vec<(AuthorId, AuthorInfo)>,
}

/// Convert a `message` or `channel_post` update.
pub fn parse_update(update: &Value) -> Option<ParsedUpdate> {
    let message = update
        .get("message")
        .or_else(|| update.get("channel_post"))?;

    let chat = message.get("chat")?;
    let source_id = chat.get("id").and_then(Value::as_i64)?;
    let id = message.get("message_id").and_then(Value::as_i64)?;

    let mut authors = Vec::new();
    let author_id = message.get("from").and_then(|from| {
        let (author_id, info) = parse_user(from)?;
        authors.push((author_id, info));
        Some(author_id)
    });

    let (text, entities) = message_text(message);
    let mut inbound = InboundMessage::text(source_id, id, text).with_entities(entities);
    inbound.author_id = author_id;
    inbound.date = message
        .get("date")
        .and_then(Value::as_i64)
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now);
    inbound.source_kind = match chat.get("type").and_then(Value::as_str) {
        Some("channel") => SourceKind::Channel,
        Some("group" | "supergroup") => SourceKind::Group,
        _ => SourceKind::Private,
    };
    inbound.source_title = chat_name(chat);
    inbound.forwarded_from = forward_origin(message);

    if let Some(media) = parse_media(message) {
        inbound = inbound.with_media(media);
    }
    if let Some(group) = message.get("media_group_id").and_then(Value::as_str) {
        inbound = inbound.with_group(group_id(group));
    }

    if let Some(reply) = message.get("reply_to_message") {
        if let Some(reply_id) = reply.get("message_id").and_then(Value::as_i64) {
            let quoted_author = reply.get("from").and_then(parse_user);
            let author_name = quoted_author
                .as_ref()
                .and_then(|(_, info)| info.display_name.clone())
                .or_else(|| reply.get("sender_chat").and_then(chat_name))
                .unwrap_or_else(|| "Unknown".into());
            let (quoted_text, _) = message_text(reply);
            let quoted = QuotedMessage {
                author_id: quoted_author.as_ref().map(|(id, _)| *id),
                author_name,
                text: quoted_text,
                kind: parse_media(reply).map(|m| m.kind).unwrap_or(ContentKind::Text),
                forwarded_from: forward_origin(reply),
            };
            if let Some(entry) = quoted_author {
                authors.push(entry);
            }
            inbound = inbound.with_reply(ReplyReference {
                message_id: reply_id,
                resolved: Some(quoted),
            });
        }
    }

    Some(ParsedUpdate {
        message: inbound,
        authors,
    })
}

fn parse_user(user: &Value) -> Option<(AuthorId, AuthorInfo)> {
    let id = user.get("id").and_then(Value::as_i64)?;
    let first = user.get("first_name").and_then(Value::as_str).unwrap_or("");
    let last = user.get("last_name").and_then(Value::as_str).unwrap_or("");
    let display_name = format!("{first} {last}").trim().to_string();
    Some((
        id,
        AuthorInfo {
            is_bot: user.get("is_bot").and_then(Value::as_bool).unwrap_or(false),
            handle: user
                .get("username")
                .and_then(Value::as_str)
                .map(String::from),
            display_name: (!display_name.is_empty()).then_some(display_name),
        },
    ))
}

fn chat_name(chat: &Value) -> Option<String> {
    chat.get("title")
        .or_else(|| chat.get("first_name"))
        .or_else(|| chat.get("username"))
        .and_then(Value::as_str)
        .map(String::from)
}

/// Text or caption, with its entities.
fn message_text(message: &Value) -> (String, Vec<TextEntity>) {
    let (text, entities) = match message.get("text").and_then(Value::as_str) {
        Some(text) => (text, message.get("entities")),
        None => (
            message.get("caption").and_then(Value::as_str).unwrap_or(""),
            message.get("caption_entities"),
        ),
    };
    let entities = entities
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(parse_entity).collect())
        .unwrap_or_default();
    (text.to_string(), entities)
}

fn parse_entity(entity: &Value) -> Option<TextEntity> {
    let kind = entity.get("type").and_then(Value::as_str)?;
    let offset = entity.get("offset").and_then(Value::as_u64)? as usize;
    let length = entity.get("length").and_then(Value::as_u64)? as usize;
    let mut parsed = TextEntity::new(kind, offset, length);
    parsed.url = entity.get("url").and_then(Value::as_str).map(String::from);
    parsed.user_id = entity
        .get("user")
        .and_then(|u| u.get("id"))
        .and_then(Value::as_i64);
    Some(parsed)
}

fn parse_media(message: &Value) -> Option<MediaAttachment> {
    let file_id = |v: &Value| v.get("file_id").and_then(Value::as_str).map(String::from);
    let attachment = |kind, file_id| MediaAttachment {
        kind,
        file_id,
        file_name: None,
    };

    if let Some(sizes) = message.get("photo").and_then(Value::as_array) {
        // Sizes are ordered smallest first.
        return Some(attachment(ContentKind::Photo, sizes.last().and_then(file_id)));
    }
    // Animations also carry a `document` field; check them first.
    if let Some(animation) = message.get("animation") {
        return Some(attachment(ContentKind::Gif, file_id(animation)));
    }
    if let Some(video) = message.get("video") {
        return Some(attachment(ContentKind::Video, file_id(video)));
    }
    if let Some(voice) = message.get("voice") {
        return Some(attachment(ContentKind::Voice, file_id(voice)));
    }
    if let Some(note) = message.get("video_note") {
        return Some(attachment(ContentKind::RoundVideo, file_id(note)));
    }
    if let Some(audio) = message.get("audio") {
        return Some(attachment(ContentKind::Audio, file_id(audio)));
    }
    if let Some(sticker) = message.get("sticker") {
        return Some(attachment(ContentKind::Sticker, file_id(sticker)));
    }
    if let Some(document) = message.get("document") {
        return Some(MediaAttachment {
            kind: ContentKind::Document,
            file_id: file_id(document),
            file_name: document
                .get("file_name")
                .and_then(Value::as_str)
                .map(String::from),
        });
    }
    None
}

fn forward_origin(message: &Value) -> Option<String> {
    if let Some(origin) = message.get("forward_origin") {
        let name = match origin.get("type").and_then(Value::as_str) {
            Some("user") => origin.get("sender_user").and_then(|u| {
                u.get("first_name").and_then(Value::as_str).map(String::from)
            }),
            Some("hidden_user") => origin
                .get("sender_user_name")
                .and_then(Value::as_str)
                .map(String::from),
            Some("chat") => origin.get("sender_chat").and_then(chat_name),
            Some("channel") => origin.get("chat").and_then(chat_name),
            _ => None,
        };
        if name.is_some() {
            return name;
        }
    }
    message
        .get("forward_from")
        .and_then(|u| u.get("first_name"))
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| message.get("forward_from_chat").and_then(chat_name))
}

/// Media group ids are numeric strings; anything else is hashed.
fn group_id(raw: &str) -> i64 {
    match raw.parse::<i64>() {
        Ok(id) if id != 0 => id,
        _ => {
            let mut hasher = DefaultHasher::new();
            raw.hash(&mut hasher);
            (hasher.finish() >> 1) as i64 | 1
        }
    }
}

/// Spawn the long-poll loop feeding `forwarder`.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling;
/// the loop notices after the current long-poll returns.
pub fn spawn_poller(
    api: TelegramApi,
    forwarder: Arc<Forwarder>,
    directory: Arc<CachedAuthorDirectory>,
    poll_timeout_secs: u64,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(poll_timeout_secs, "Telegram poller started");
        let request_timeout = Duration::from_secs(poll_timeout_secs + 10);
        let mut offset: i64 = 0;

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Telegram poller shutting down");
                return;
            }

            let body = json!({
                "offset": offset,
                "timeout": poll_timeout_secs,
                "allowed_updates": ["message", "channel_post"],
            });
            let updates = match api
                .call_with_timeout("getUpdates", &body, Some(request_timeout))
                .await
            {
                Ok(updates) => updates,
                Err(e) => {
                    warn!(error = %e, "Telegram poll error");
                    tokio::time::sleep(POLL_RETRY_DELAY).await;
                    continue;
                }
            };

            let Some(updates) = updates.as_array() else {
                continue;
            };
            for update in updates {
                if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                    offset = uid + 1;
                }
                let Some(parsed) = parse_update(update) else {
                    continue;
                };
                for (author_id, info) in parsed.authors {
                    directory.remember(author_id, info);
                }
                let triage = forwarder.on_event(parsed.message).await;
                debug!(?triage, "Telegram update triaged");
            }
        }
    });

    (handle, shutdown_flag)
}

// ── Outbound ────────────────────────────────────────────────────────

/// Delivers payloads by re-sending text and file references.
pub struct TelegramSender {
    api: TelegramApi,
}

impl TelegramSender {
    pub fn new(api: TelegramApi) -> Self {
        Self { api }
    }

    async fn send_item(
        &self,
        destination: ChatId,
        topic_id: Option<i64>,
        item: &PayloadItem,
    ) -> Result<Delivery, ChannelError> {
        let Some(media) = &item.media else {
            return self
                .send_text(destination, topic_id, &item.text, &item.entities)
                .await;
        };
        let Some(file_id) = &media.file_id else {
            // Degraded send: the file never became available.
            if item.text.is_empty() {
                return Err(ChannelError::InvalidMessage(format!(
                    "{} in message {} has no file reference",
                    media.kind.label(),
                    item.source_message_id
                )));
            }
            warn!(
                source_message_id = item.source_message_id,
                "Media unavailable, sending text only"
            );
            return self
                .send_text(destination, topic_id, &item.text, &item.entities)
                .await;
        };

        let (method, field, captioned) = media_method(media.kind);
        let caption_fits = utf16_len(&item.text) <= TELEGRAM_MAX_CAPTION_LENGTH;

        let mut body = json!({ "chat_id": destination });
        body[field] = Value::String(file_id.clone());
        with_topic(&mut body, topic_id);
        if captioned && caption_fits && !item.text.is_empty() {
            body["caption"] = Value::String(item.text.clone());
            if !item.entities.is_empty() {
                body["caption_entities"] = entities_json(&item.entities);
            }
        }

        let result = self.api.call(method, &body).await?;
        let delivery = delivery_from(&result)?;

        // Text that could not ride along as a caption follows as its own message.
        if !item.text.is_empty() && (!captioned || !caption_fits) {
            self.send_text(destination, topic_id, &item.text, &item.entities)
                .await?;
        }
        Ok(delivery)
    }

    async fn send_text(
        &self,
        destination: ChatId,
        topic_id: Option<i64>,
        text: &str,
        entities: &[TextEntity],
    ) -> Result<Delivery, ChannelError> {
        if text.trim().is_empty() {
            return Err(ChannelError::InvalidMessage("empty text".into()));
        }

        let chunks = split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH);
        let single = chunks.len() == 1;
        let mut first = None;
        for chunk in &chunks {
            let mut body = json!({ "chat_id": destination, "text": chunk });
            with_topic(&mut body, topic_id);
            // Offsets only line up when the text was not split.
            if single && !entities.is_empty() {
                body["entities"] = entities_json(entities);
            }
            let result = self.api.call("sendMessage", &body).await?;
            let delivery = delivery_from(&result)?;
            first.get_or_insert(delivery);
        }
        first.ok_or_else(|| ChannelError::InvalidMessage("empty text".into()))
    }

    async fn send_media_group(
        &self,
        destination: ChatId,
        topic_id: Option<i64>,
        items: &[PayloadItem],
    ) -> Result<Delivery, ChannelError> {
        let mut first = None;
        for chunk in items.chunks(TELEGRAM_MAX_GROUP_SIZE) {
            if let [item] = chunk {
                let delivery = self.send_item(destination, topic_id, item).await?;
                first.get_or_insert(delivery);
                continue;
            }

            let media: Vec<Value> = chunk
                .iter()
                .filter_map(|item| {
                    let attachment = item.media.as_ref()?;
                    let file_id = attachment.file_id.as_ref()?;
                    let mut entry = json!({
                        "type": group_media_type(attachment.kind),
                        "media": file_id,
                    });
                    if !item.text.is_empty()
                        && utf16_len(&item.text) <= TELEGRAM_MAX_CAPTION_LENGTH
                    {
                        entry["caption"] = Value::String(item.text.clone());
                        if !item.entities.is_empty() {
                            entry["caption_entities"] = entities_json(&item.entities);
                        }
                    }
                    Some(entry)
                })
                .collect();
            if media.is_empty() {
                continue;
            }

            let mut body = json!({ "chat_id": destination, "media": media });
            with_topic(&mut body, topic_id);
            let result = self.api.call("sendMediaGroup", &body).await?;
            let delivery = result
                .as_array()
                .and_then(|sent| sent.first())
                .ok_or_else(|| ChannelError::Http("sendMediaGroup returned no messages".into()))
                .and_then(delivery_from)?;
            first.get_or_insert(delivery);
        }
        first.ok_or_else(|| ChannelError::InvalidMessage("album has no sendable media".into()))
    }
}

#[async_trait]
impl MessageSender for TelegramSender {
    async fn send(&self, rule: &Rule, payload: ForwardPayload) -> Result<Delivery, ChannelError> {
        let destination = payload.destination;
        let topic_id = payload.topic_id;
        debug!(
            destination,
            destination_name = rule.destination_name.as_deref().unwrap_or(""),
            items = payload.items.len(),
            "Sending payload"
        );

        match payload.items.as_slice() {
            [] => Err(ChannelError::InvalidMessage("empty payload".into())),
            [item] => self.send_item(destination, topic_id, item).await,
            items => {
                let mut first = None;
                for run in group_runs(items) {
                    let delivery = match run {
                        [item] => self.send_item(destination, topic_id, item).await?,
                        run => self.send_media_group(destination, topic_id, run).await?,
                    };
                    first.get_or_insert(delivery);
                }
                first.ok_or_else(|| ChannelError::InvalidMessage("empty payload".into()))
            }
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// (method, file field, accepts a caption)
fn media_method(kind: ContentKind) -> (&'static str, &'static str, bool) {
    match kind {
        ContentKind::Photo => ("sendPhoto", "photo", true),
        ContentKind::Video => ("sendVideo", "video", true),
        ContentKind::Voice => ("sendVoice", "voice", true),
        ContentKind::RoundVideo => ("sendVideoNote", "video_note", false),
        ContentKind::Gif => ("sendAnimation", "animation", true),
        ContentKind::Audio => ("sendAudio", "audio", true),
        ContentKind::Document | ContentKind::Text => ("sendDocument", "document", true),
        ContentKind::Sticker => ("sendSticker", "sticker", false),
    }
}

/// Kinds `sendMediaGroup` accepts together. Photos and videos mix; audio and
/// documents only group with their own kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupFamily {
    Visual,
    Audio,
    Document,
}

fn group_family(item: &PayloadItem) -> Option<GroupFamily> {
    let media = item.media.as_ref()?;
    media.file_id.as_ref()?;
    match media.kind {
        ContentKind::Photo | ContentKind::Video => Some(GroupFamily::Visual),
        ContentKind::Audio => Some(GroupFamily::Audio),
        ContentKind::Document => Some(GroupFamily::Document),
        _ => None,
    }
}

/// Split a payload into consecutive runs that can each go out as one call:
/// same-family media runs, and everything else one item at a time.
fn group_runs(items: &[PayloadItem]) -> Vec<&[PayloadItem]> {
    let mut runs = Vec::new();
    let mut start = 0;
    for end in 1..=items.len() {
        let family = group_family(&items[start]);
        let split = end == items.len()
            || family.is_none()
            || group_family(&items[end]) != family;
        if split {
            runs.push(&items[start..end]);
            start = end;
        }
    }
    runs
}

fn group_media_type(kind: ContentKind) -> &'static str {
    match kind {
        ContentKind::Photo => "photo",
        ContentKind::Video => "video",
        ContentKind::Audio => "audio",
        _ => "document",
    }
}

fn with_topic(body: &mut Value, topic_id: Option<i64>) {
    if let Some(topic) = topic_id {
        body["message_thread_id"] = json!(topic);
    }
}

fn entities_json(entities: &[TextEntity]) -> Value {
    Value::Array(
        entities
            .iter()
            .map(|e| {
                let mut entity = json!({
                    "type": e.kind,
                    "offset": e.offset,
                    "length": e.length,
                });
                if let Some(url) = &e.url {
                    entity["url"] = Value::String(url.clone());
                }
                if let Some(user_id) = e.user_id {
                    entity["user"] = json!({ "id": user_id, "is_bot": false, "first_name": "" });
                }
                entity
            })
            .collect(),
    )
}

fn delivery_from(result: &Value) -> Result<Delivery, ChannelError> {
    result
        .get("message_id")
        .and_then(Value::as_i64)
        .map(|message_id| Delivery { message_id })
        .ok_or_else(|| ChannelError::Http("response has no message_id".into()))
}

/// Split a message into chunks of at most `max_len` characters.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let Some((limit, _)) = remaining.char_indices().nth(max_len) else {
            chunks.push(remaining.to_string());
            break;
        };

        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(limit);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { limit } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────
