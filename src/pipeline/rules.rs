//! Per-source forwarding rules and the filter engine.
//!
//! The engine is a pure evaluation over (message, rule, author). Checks run
//! cheapest-first and short-circuit on the first rejection:
//! - author type (outgoing / user / bot toggles)
//! - author allow-list (user or bot only)
//! - content type toggles
//! - keyword/regex, local AND optional global pattern
//! - length bounds, text-only messages

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pipeline::types::{
    AuthorInfo, AuthorType, ChatId, ContentKind, DispatchUnit, InboundMessage,
};

fn enabled() -> bool {
    true
}

/// Whether forwarded content names its original author/source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribution {
    Keep,
    #[default]
    Strip,
}

/// Per-content-type toggles. Everything is forwarded unless switched off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFilters {
    #[serde(default = "enabled")]
    pub text: bool,
    #[serde(default = "enabled")]
    pub media_captions: bool,
    #[serde(default = "enabled")]
    pub photos: bool,
    #[serde(default = "enabled")]
    pub videos: bool,
    #[serde(default = "enabled")]
    pub documents: bool,
    #[serde(default = "enabled")]
    pub audio: bool,
    #[serde(default = "enabled")]
    pub voice: bool,
    #[serde(default = "enabled")]
    pub video_messages: bool,
    #[serde(default = "enabled")]
    pub stickers: bool,
    #[serde(default = "enabled")]
    pub gifs: bool,
}

impl Default for ContentFilters {
    fn default() -> Self {
        Self {
            text: true,
            media_captions: true,
            photos: true,
            videos: true,
            documents: true,
            audio: true,
            voice: true,
            video_messages: true,
            stickers: true,
            gifs: true,
        }
    }
}

impl ContentFilters {
    pub fn allows(&self, kind: ContentKind) -> bool {
        match kind {
            ContentKind::Text => self.text,
            ContentKind::Photo => self.photos,
            ContentKind::Video => self.videos,
            ContentKind::Voice => self.voice,
            ContentKind::RoundVideo => self.video_messages,
            ContentKind::Gif => self.gifs,
            ContentKind::Audio => self.audio,
            ContentKind::Document => self.documents,
            ContentKind::Sticker => self.stickers,
        }
    }
}

/// Forwarding configuration for one source chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub destination: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_name: Option<String>,
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default = "enabled")]
    pub forward_users: bool,
    #[serde(default = "enabled")]
    pub forward_bots: bool,
    #[serde(default = "enabled")]
    pub forward_outgoing: bool,
    /// Numeric ids or handles (with or without `@`). Empty means no restriction.
    #[serde(default)]
    pub allowed_authors: Vec<String>,
    #[serde(default)]
    pub filters: ContentFilters,
    #[serde(default)]
    pub keyword_pattern: String,
    #[serde(default)]
    pub use_global_pattern: bool,
    /// Overrides the configured minimum text length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    /// Overrides the configured maximum text length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub attribution: Attribution,
    #[serde(default = "enabled")]
    pub quote_replies: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_topic_id: Option<i64>,
}

impl Rule {
    /// An enabled rule forwarding everything to `destination`.
    pub fn to(destination: ChatId) -> Self {
        Self {
            destination,
            destination_name: None,
            enabled: true,
            forward_users: true,
            forward_bots: true,
            forward_outgoing: true,
            allowed_authors: Vec::new(),
            filters: ContentFilters::default(),
            keyword_pattern: String::new(),
            use_global_pattern: false,
            min_length: None,
            max_length: None,
            attribution: Attribution::default(),
            quote_replies: true,
            destination_topic_id: None,
        }
    }

    pub fn with_keyword(mut self, pattern: impl Into<String>) -> Self {
        self.keyword_pattern = pattern.into();
        self
    }

    pub fn with_allowed_authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_authors = authors.into_iter().map(Into::into).collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn allows_author_type(&self, author_type: AuthorType) -> bool {
        match author_type {
            AuthorType::Outgoing => self.forward_outgoing,
            AuthorType::User => self.forward_users,
            AuthorType::Bot => self.forward_bots,
        }
    }

    /// Allow-list entries normalized for comparison.
    fn normalized_authors(&self) -> Vec<String> {
        self.allowed_authors
            .iter()
            .map(|a| a.trim().trim_start_matches('@').to_lowercase())
            .filter(|a| !a.is_empty())
            .collect()
    }
}

/// Why the filter engine dropped a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterRejection {
    AuthorType(AuthorType),
    AuthorNotAllowed,
    ContentType(ContentKind),
    Keyword,
    Length { chars: usize },
}

impl FilterRejection {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AuthorType(_) => "author_type",
            Self::AuthorNotAllowed => "author_not_allowed",
            Self::ContentType(_) => "content_type",
            Self::Keyword => "keyword",
            Self::Length { .. } => "length",
        }
    }
}

// ── Keyword matching ────────────────────────────────────────────────

/// A keyword pattern: case-insensitive regex, or a plain substring when the
/// pattern does not compile.
#[derive(Debug, Clone)]
pub enum KeywordMatcher {
    Regex(Regex),
    Substring(String),
}

impl KeywordMatcher {
    pub fn new(pattern: &str) -> Self {
        match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(regex) => Self::Regex(regex),
            Err(e) => {
                debug!(pattern, error = %e, "Keyword pattern is not a valid regex, using substring match");
                Self::Substring(pattern.to_lowercase())
            }
        }
    }

    pub fn is_match(&self, text: &str) -> bool {
        match self {
            Self::Regex(regex) => regex.is_match(text),
            Self::Substring(needle) => text.to_lowercase().contains(needle.as_str()),
        }
    }
}

// ── Filter engine ───────────────────────────────────────────────────

/// Evaluates messages against rules.
pub struct FilterEngine {
    min_length: usize,
    max_length: usize,
    global: Option<KeywordMatcher>,
    /// Compiled local patterns keyed by pattern text.
    compiled: RwLock<HashMap<String, Arc<KeywordMatcher>>>,
}

impl FilterEngine {
    pub fn new(min_length: usize, max_length: usize, global_pattern: &str) -> Self {
        let global_pattern = global_pattern.trim();
        Self {
            min_length,
            max_length,
            global: (!global_pattern.is_empty()).then(|| KeywordMatcher::new(global_pattern)),
            compiled: RwLock::new(HashMap::new()),
        }
    }

    /// Evaluate a single message.
    pub fn evaluate(
        &self,
        message: &InboundMessage,
        rule: &Rule,
        author: Option<&AuthorInfo>,
    ) -> Result<(), FilterRejection> {
        self.check_author(message, rule, author)?;

        let kind = message.content_kind();
        if !rule.filters.allows(kind) {
            return Err(FilterRejection::ContentType(kind));
        }

        if !self.passes_keywords(&message.searchable_text(), rule) {
            return Err(FilterRejection::Keyword);
        }

        if !message.has_media() {
            let chars = message.text.chars().count();
            let min = rule.min_length.unwrap_or(self.min_length);
            let max = rule.max_length.unwrap_or(self.max_length);
            if chars < min || chars > max {
                return Err(FilterRejection::Length { chars });
            }
        }

        Ok(())
    }

    /// Evaluate an album. Author checks use the first member, keywords run
    /// over all captions and filenames, and members whose content type is
    /// switched off are dropped. Returns the surviving members.
    pub fn evaluate_album(
        &self,
        messages: &[Arc<InboundMessage>],
        rule: &Rule,
        author: Option<&AuthorInfo>,
    ) -> Result<Vec<Arc<InboundMessage>>, FilterRejection> {
        let Some(first) = messages.first() else {
            return Ok(Vec::new());
        };
        self.check_author(first, rule, author)?;

        let combined = messages
            .iter()
            .map(|m| m.searchable_text())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !self.passes_keywords(&combined, rule) {
            return Err(FilterRejection::Keyword);
        }

        let kept: Vec<_> = messages
            .iter()
            .filter(|m| rule.filters.allows(m.content_kind()))
            .cloned()
            .collect();
        if kept.is_empty() {
            return Err(FilterRejection::ContentType(first.content_kind()));
        }
        Ok(kept)
    }

    /// Pre-check used by backlog catch-up before queueing.
    pub fn would_pass(&self, unit: &DispatchUnit, rule: &Rule, author: Option<&AuthorInfo>) -> bool {
        match unit {
            DispatchUnit::Single(message) => self.evaluate(message, rule, author).is_ok(),
            DispatchUnit::Album { messages, .. } => {
                self.evaluate_album(messages, rule, author).is_ok()
            }
        }
    }

    /// Evaluate a dispatch unit, returning the unit that should be forwarded.
    pub fn apply(
        &self,
        unit: DispatchUnit,
        rule: &Rule,
        author: Option<&AuthorInfo>,
    ) -> Result<DispatchUnit, FilterRejection> {
        match unit {
            DispatchUnit::Single(message) => {
                self.evaluate(&message, rule, author)?;
                Ok(DispatchUnit::Single(message))
            }
            DispatchUnit::Album { group_id, messages } => {
                let kept = self.evaluate_album(&messages, rule, author)?;
                Ok(DispatchUnit::Album {
                    group_id,
                    messages: kept,
                })
            }
        }
    }

    fn check_author(
        &self,
        message: &InboundMessage,
        rule: &Rule,
        author: Option<&AuthorInfo>,
    ) -> Result<(), FilterRejection> {
        let author_type = AuthorType::classify(message, author);
        if !rule.allows_author_type(author_type) {
            return Err(FilterRejection::AuthorType(author_type));
        }

        if author_type == AuthorType::Outgoing {
            return Ok(());
        }

        let allowed = rule.normalized_authors();
        if allowed.is_empty() {
            return Ok(());
        }

        let by_id = message
            .author_id
            .is_some_and(|id| allowed.contains(&id.to_string()));
        let by_handle = author
            .and_then(|a| a.handle.as_deref())
            .map(|h| h.trim_start_matches('@').to_lowercase())
            .is_some_and(|h| allowed.contains(&h));

        if by_id || by_handle {
            Ok(())
        } else {
            debug!(
                source_id = message.source_id,
                author_id = ?message.author_id,
                "Dropping message due to author filter"
            );
            Err(FilterRejection::AuthorNotAllowed)
        }
    }

    /// Local pattern AND (when opted in) global pattern must both match.
    fn passes_keywords(&self, text: &str, rule: &Rule) -> bool {
        let local_pattern = rule.keyword_pattern.trim();
        let global = if rule.use_global_pattern {
            self.global.as_ref()
        } else {
            None
        };

        if local_pattern.is_empty() && global.is_none() {
            return true;
        }
        if text.is_empty() {
            return false;
        }

        let local_pass = local_pattern.is_empty() || self.local_matcher(local_pattern).is_match(text);
        let global_pass = global.is_none_or(|g| g.is_match(text));
        local_pass && global_pass
    }

    fn local_matcher(&self, pattern: &str) -> Arc<KeywordMatcher> {
        if let Some(found) = self
            .compiled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pattern)
        {
            return Arc::clone(found);
        }
        let matcher = Arc::new(KeywordMatcher::new(pattern));
        self.compiled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pattern.to_string(), Arc::clone(&matcher));
        matcher
    }
}
