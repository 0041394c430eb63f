//! Default payload composition: attribution header, reply quote, caption.
//!
//! Offsets are in UTF-16 code units. Prefix and original text are joined by a
//! blank line, so original entities move right by the prefix length plus two.

use std::sync::Arc;

use crate::pipeline::rules::{Attribution, Rule};
use crate::pipeline::types::{
    AuthorDirectory, AuthorId, ContentKind, DispatchUnit, ForwardPayload, InboundMessage,
    PayloadBuilder, PayloadItem, QuotedMessage, SourceKind, TextEntity,
};

/// Longest reply snippet, in UTF-16 code units, before it is cut.
const QUOTE_SNIPPET_MAX: usize = 44;

const SEPARATOR: &str = "\n\n";

fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Text plus the entities that format it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Formatted {
    text: String,
    entities: Vec<TextEntity>,
}

impl Formatted {
    fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Append `other` after a blank line, shifting its entities.
    fn join(mut self, other: Formatted) -> Formatted {
        if other.is_empty() {
            return self;
        }
        if self.is_empty() {
            return other;
        }
        self.text.push_str(SEPARATOR);
        let shift = utf16_len(&self.text);
        self.text.push_str(&other.text);
        self.entities
            .extend(other.entities.iter().map(|e| e.shifted(shift)));
        self
    }
}

pub struct DefaultPayloadBuilder {
    authors: Option<Arc<dyn AuthorDirectory>>,
}

impl Default for DefaultPayloadBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultPayloadBuilder {
    /// Without a directory, authors are named by id.
    pub fn new() -> Self {
        Self { authors: None }
    }

    pub fn with_authors(authors: Arc<dyn AuthorDirectory>) -> Self {
        Self {
            authors: Some(authors),
        }
    }

    fn author_name(&self, author_id: Option<AuthorId>) -> String {
        let Some(id) = author_id else {
            return "Unknown".into();
        };
        self.authors
            .as_ref()
            .and_then(|dir| dir.author_info(id))
            .and_then(|info| {
                info.display_name
                    .or_else(|| info.handle.map(|h| format!("@{}", h.trim_start_matches('@'))))
            })
            .unwrap_or_else(|| id.to_string())
    }

    /// "Forwarded from ..." line.
    fn header(&self, message: &InboundMessage) -> Formatted {
        let source = message
            .source_title
            .clone()
            .unwrap_or_else(|| message.source_id.to_string());

        let (mut text, name) = match message.source_kind {
            SourceKind::Channel => (format!("Forwarded from {source}"), source),
            SourceKind::Group => {
                let author = self.author_name(message.author_id);
                (format!("Forwarded from {source} (by {author})"), source)
            }
            SourceKind::Private => {
                let author = self.author_name(message.author_id);
                (format!("Forwarded from {author}"), author)
            }
        };
        if let Some(original) = &message.forwarded_from {
            text.push_str(&format!(" (fwd_from {original})"));
        }

        let name_offset = utf16_len("Forwarded from ");
        let entities = vec![TextEntity::new("bold", name_offset, utf16_len(&name))];
        Formatted { text, entities }
    }

    /// Blockquote of the replied-to message: author line, then snippet.
    fn reply_quote(&self, message: &InboundMessage) -> Formatted {
        let Some(quoted) = message.reply_to.as_ref().and_then(|r| r.resolved.as_ref()) else {
            return Formatted::default();
        };

        let mut snippet = quote_snippet(quoted);
        if let Some(original) = &quoted.forwarded_from {
            snippet.push_str(&format!(" (from {original})"));
        }

        let author = quoted.author_name.trim();
        let text = format!("{author}\n\u{200b}{snippet}");
        let entities = vec![
            TextEntity::new("bold", 0, utf16_len(author)),
            TextEntity::new("blockquote", 0, utf16_len(&text)),
        ];
        Formatted { text, entities }
    }

    fn prefix(&self, message: &InboundMessage, rule: &Rule) -> Formatted {
        let header = if rule.attribution == Attribution::Keep {
            self.header(message)
        } else {
            Formatted::default()
        };
        let quote = if rule.quote_replies {
            self.reply_quote(message)
        } else {
            Formatted::default()
        };
        header.join(quote)
    }
}

/// Original text kept for forwarding, honoring the text and caption toggles.
fn original_text(message: &InboundMessage, rule: &Rule) -> Formatted {
    let keep = if message.has_media() {
        rule.filters.media_captions
    } else {
        rule.filters.text
    };
    if !keep || message.text.is_empty() {
        return Formatted::default();
    }
    Formatted {
        text: message.text.clone(),
        entities: message.entities.clone(),
    }
}

fn quote_snippet(quoted: &QuotedMessage) -> String {
    let snippet = match quoted.kind {
        ContentKind::Photo => "Photo".to_string(),
        ContentKind::Video => "Video".to_string(),
        ContentKind::Voice => "Voice Message".to_string(),
        ContentKind::Sticker if quoted.text.is_empty() => "Sticker".to_string(),
        ContentKind::Sticker => quoted.text.clone(),
        _ if quoted.text.trim().is_empty() => "Media".to_string(),
        _ => quoted.text.split_whitespace().collect::<Vec<_>>().join(" "),
    };

    if utf16_len(&snippet) > QUOTE_SNIPPET_MAX {
        let mut units = 0;
        let cut: String = snippet
            .chars()
            .take_while(|c| {
                units += c.len_utf16();
                units <= QUOTE_SNIPPET_MAX
            })
            .collect();
        format!("{}...", cut.trim_end())
    } else {
        snippet
    }
}

impl PayloadBuilder for DefaultPayloadBuilder {
    fn build(&self, unit: &DispatchUnit, rule: &Rule) -> ForwardPayload {
        let first = unit.first();
        let prefix = self.prefix(first, rule);

        let items = match unit {
            DispatchUnit::Single(message) => {
                let body = prefix.join(original_text(message, rule));
                if body.is_empty() && !message.has_media() {
                    Vec::new()
                } else {
                    vec![PayloadItem {
                        text: body.text,
                        entities: body.entities,
                        media: message.media.clone(),
                        source_message_id: message.id,
                    }]
                }
            }
            DispatchUnit::Album { messages, .. } => {
                // The album caption is the first member caption, carried on the first item.
                let caption = messages
                    .iter()
                    .map(|m| original_text(m, rule))
                    .find(|f| !f.is_empty())
                    .unwrap_or_default();
                let mut caption = Some(prefix.join(caption));

                messages
                    .iter()
                    .filter(|m| m.media.is_some())
                    .map(|m| {
                        let body = caption.take().unwrap_or_default();
                        PayloadItem {
                            text: body.text,
                            entities: body.entities,
                            media: m.media.clone(),
                            source_message_id: m.id,
                        }
                    })
                    .collect()
            }
        };

        ForwardPayload {
            destination: rule.destination,
            topic_id: rule.destination_topic_id.filter(|t| *t > 0),
            items,
        }
    }
}
