//! Shared types for the forwarding pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::pipeline::rules::Rule;

pub type ChatId = i64;
pub type MessageId = i64;
pub type AuthorId = i64;

// ── Inbound message ─────────────────────────────────────────────────

/// Whether a message's media payload can be referenced yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaState {
    None,
    Incomplete,
    Complete,
}

/// Content classification used by the per-rule type filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Photo,
    Video,
    Voice,
    RoundVideo,
    Gif,
    Audio,
    Document,
    Sticker,
}

impl ContentKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Voice => "voice",
            Self::RoundVideo => "round_video",
            Self::Gif => "gif",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Sticker => "sticker",
        }
    }
}

/// What kind of chat a message came from. Drives the attribution header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Private,
    Group,
    Channel,
}

/// A formatting span over message text. Offsets and lengths are in UTF-16
/// code units, as the platform counts them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEntity {
    pub kind: String,
    pub offset: usize,
    pub length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<AuthorId>,
}

impl TextEntity {
    pub fn new(kind: impl Into<String>, offset: usize, length: usize) -> Self {
        Self {
            kind: kind.into(),
            offset,
            length,
            url: None,
            user_id: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Same entity moved `shift` code units to the right.
    pub fn shifted(&self, shift: usize) -> Self {
        Self {
            offset: self.offset + shift,
            ..self.clone()
        }
    }
}

/// Media attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub kind: ContentKind,
    /// Platform reference used to re-send the file. `None` until downloadable.
    pub file_id: Option<String>,
    pub file_name: Option<String>,
}

/// Content of a replied-to message, once the platform has materialized it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotedMessage {
    pub author_id: Option<AuthorId>,
    pub author_name: String,
    pub text: String,
    pub kind: ContentKind,
    pub forwarded_from: Option<String>,
}

/// A reply pointer. `resolved` stays `None` while the target is still loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyReference {
    pub message_id: MessageId,
    pub resolved: Option<QuotedMessage>,
}

/// A message observed on a source chat.
///
/// Immutable once built; the pipeline shares it as `Arc<InboundMessage>`
/// between the triage intake and whichever buffer currently holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub source_id: ChatId,
    pub id: MessageId,
    pub is_outgoing: bool,
    /// Client-generated id of an outgoing message; 0 when unknown.
    pub random_id: i64,
    /// Media group identifier; 0 if the message is not part of an album.
    pub group_id: i64,
    pub author_id: Option<AuthorId>,
    pub date: DateTime<Utc>,
    pub text: String,
    pub entities: Vec<TextEntity>,
    pub media: Option<MediaAttachment>,
    pub media_state: MediaState,
    pub reply_to: Option<ReplyReference>,
    pub source_kind: SourceKind,
    pub source_title: Option<String>,
    pub forwarded_from: Option<String>,
}

impl InboundMessage {
    /// A plain text message from `author_id` in `source_id`.
    pub fn text(source_id: ChatId, id: MessageId, text: impl Into<String>) -> Self {
        Self {
            source_id,
            id,
            is_outgoing: false,
            random_id: 0,
            group_id: 0,
            author_id: None,
            date: Utc::now(),
            text: text.into(),
            entities: Vec::new(),
            media: None,
            media_state: MediaState::None,
            reply_to: None,
            source_kind: SourceKind::default(),
            source_title: None,
            forwarded_from: None,
        }
    }

    pub fn with_author(mut self, author_id: AuthorId) -> Self {
        self.author_id = Some(author_id);
        self
    }

    pub fn with_group(mut self, group_id: i64) -> Self {
        self.group_id = group_id;
        self
    }

    pub fn with_media(mut self, media: MediaAttachment) -> Self {
        self.media_state = if media.file_id.is_some() {
            MediaState::Complete
        } else {
            MediaState::Incomplete
        };
        self.media = Some(media);
        self
    }

    pub fn with_reply(mut self, reply: ReplyReference) -> Self {
        self.reply_to = Some(reply);
        self
    }

    pub fn with_entities(mut self, entities: Vec<TextEntity>) -> Self {
        self.entities = entities;
        self
    }

    pub fn with_source(mut self, kind: SourceKind, title: impl Into<String>) -> Self {
        self.source_kind = kind;
        self.source_title = Some(title.into());
        self
    }

    pub fn with_date(mut self, date: DateTime<Utc>) -> Self {
        self.date = date;
        self
    }

    pub fn outgoing(mut self, random_id: i64) -> Self {
        self.is_outgoing = true;
        self.random_id = random_id;
        self
    }

    /// Dedup identity of this event.
    pub fn event_key(&self) -> EventKey {
        if self.is_outgoing && self.random_id != 0 {
            EventKey::Outgoing {
                random_id: self.random_id,
            }
        } else {
            EventKey::Message {
                source_id: self.source_id,
                message_id: self.id,
            }
        }
    }

    /// Unclassified content counts as text.
    pub fn content_kind(&self) -> ContentKind {
        self.media
            .as_ref()
            .map(|m| m.kind)
            .unwrap_or(ContentKind::Text)
    }

    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }

    pub fn has_pending_reply_reference(&self) -> bool {
        self.reply_to.as_ref().is_some_and(|r| r.resolved.is_none())
    }

    pub fn document_file_name(&self) -> Option<&str> {
        self.media
            .as_ref()
            .filter(|m| m.kind == ContentKind::Document)
            .and_then(|m| m.file_name.as_deref())
    }

    /// Text the keyword filter looks at: message text plus document filename.
    pub fn searchable_text(&self) -> String {
        match self.document_file_name() {
            Some(name) => format!("{} {}", self.text, name).trim().to_string(),
            None => self.text.clone(),
        }
    }
}

// ── Event identity ──────────────────────────────────────────────────

/// Two events with equal keys inside the dedup window are one logical event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKey {
    Outgoing { random_id: i64 },
    Message { source_id: ChatId, message_id: MessageId },
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Outgoing { random_id } => write!(f, "outgoing:{random_id}"),
            Self::Message {
                source_id,
                message_id,
            } => write!(f, "{source_id}:{message_id}"),
        }
    }
}

// ── Author identity ─────────────────────────────────────────────────

/// Identity details for filter evaluation and attribution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorInfo {
    pub is_bot: bool,
    pub handle: Option<String>,
    pub display_name: Option<String>,
}

/// Who sent a message, as the author-type gate sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorType {
    Outgoing,
    User,
    Bot,
}

impl AuthorType {
    pub fn classify(message: &InboundMessage, author: Option<&AuthorInfo>) -> Self {
        if message.is_outgoing {
            Self::Outgoing
        } else if author.is_some_and(|a| a.is_bot) {
            Self::Bot
        } else {
            Self::User
        }
    }
}

// ── Dispatch units ──────────────────────────────────────────────────

/// One unit of work for the dispatch worker: a single message or a whole album.
#[derive(Debug, Clone)]
pub enum DispatchUnit {
    Single(Arc<InboundMessage>),
    /// Members sorted by message id ascending, never empty.
    Album {
        group_id: i64,
        messages: Vec<Arc<InboundMessage>>,
    },
}

impl DispatchUnit {
    pub fn single(message: InboundMessage) -> Self {
        Self::Single(Arc::new(message))
    }

    /// Build an album unit, sorting members by id. `None` if `messages` is empty.
    pub fn album(group_id: i64, mut messages: Vec<Arc<InboundMessage>>) -> Option<Self> {
        if messages.is_empty() {
            return None;
        }
        messages.sort_by_key(|m| m.id);
        Some(Self::Album { group_id, messages })
    }

    pub fn messages(&self) -> &[Arc<InboundMessage>] {
        match self {
            Self::Single(message) => std::slice::from_ref(message),
            Self::Album { messages, .. } => messages,
        }
    }

    /// The message that represents the unit: the only one, or the lowest id.
    pub fn first(&self) -> &Arc<InboundMessage> {
        match self {
            Self::Single(message) => message,
            Self::Album { messages, .. } => &messages[0],
        }
    }

    pub fn source_id(&self) -> ChatId {
        self.first().source_id
    }

    pub fn key(&self) -> EventKey {
        self.first().event_key()
    }

    pub fn newest_id(&self) -> MessageId {
        self.messages().iter().map(|m| m.id).max().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.messages().len()
    }

    pub fn is_album(&self) -> bool {
        matches!(self, Self::Album { .. })
    }
}

// ── Outbound payload ────────────────────────────────────────────────

/// One message in an outbound request. Albums carry several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadItem {
    pub text: String,
    pub entities: Vec<TextEntity>,
    pub media: Option<MediaAttachment>,
    pub source_message_id: MessageId,
}

/// A fully composed request for the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardPayload {
    pub destination: ChatId,
    pub topic_id: Option<i64>,
    pub items: Vec<PayloadItem>,
}

impl ForwardPayload {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Result of a successful send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: MessageId,
}

// ── Collaborator traits ─────────────────────────────────────────────

/// Rule configuration lookup. Synchronous, no side effects.
pub trait RuleResolver: Send + Sync {
    fn resolve_rule(&self, source_id: ChatId) -> Option<Rule>;
}

/// Identity lookup for filter evaluation.
pub trait AuthorDirectory: Send + Sync {
    fn author_info(&self, author_id: AuthorId) -> Option<AuthorInfo>;
}

/// Formatting/attribution step invoked just before sending.
pub trait PayloadBuilder: Send + Sync {
    fn build(&self, unit: &DispatchUnit, rule: &Rule) -> ForwardPayload;
}

/// Submits composed payloads to the destination.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, rule: &Rule, payload: ForwardPayload) -> Result<Delivery, ChannelError>;
}
