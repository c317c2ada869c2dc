//! Content classification and text extraction for raw messages
//!
//! Kinds are chosen by a fixed priority over the content parts present,
//! since edited-message wrappers carry more than one part. Text is pulled
//! through a fallback chain so captions and edited bodies are not lost.

use crate::events::{ContentPart, MediaPayload, ReplyContext};
use crate::records::MessageKind;

/// Kind priority applied when a message carries several content parts
pub const KIND_PRIORITY: [MessageKind; 7] = [
    MessageKind::Audio,
    MessageKind::Video,
    MessageKind::Image,
    MessageKind::Document,
    MessageKind::Sticker,
    MessageKind::Text,
    MessageKind::Protocol,
];

impl ContentPart {
    /// Kind contributed by this part, if any
    pub fn kind(&self) -> Option<MessageKind> {
        match self {
            ContentPart::Conversation { .. } | ContentPart::ExtendedText(_) => {
                Some(MessageKind::Text)
            }
            ContentPart::Image(_) => Some(MessageKind::Image),
            ContentPart::Video(_) => Some(MessageKind::Video),
            ContentPart::Audio(_) => Some(MessageKind::Audio),
            ContentPart::Document(_) => Some(MessageKind::Document),
            ContentPart::Sticker(_) => Some(MessageKind::Sticker),
            ContentPart::Protocol(_) => Some(MessageKind::Protocol),
            ContentPart::Reaction { .. }
            | ContentPart::Receipt
            | ContentPart::PollUpdate
            | ContentPart::Edited { .. } => None,
        }
    }

    /// Text carried directly by this part
    pub fn text(&self) -> Option<&str> {
        match self {
            ContentPart::Conversation { text } => non_blank(text),
            ContentPart::ExtendedText(extended) => non_blank(&extended.text),
            ContentPart::Image(media)
            | ContentPart::Video(media)
            | ContentPart::Audio(media)
            | ContentPart::Document(media)
            | ContentPart::Sticker(media) => media.caption.as_deref().and_then(non_blank),
            _ => None,
        }
    }

    pub fn media(&self) -> Option<&MediaPayload> {
        match self {
            ContentPart::Image(media)
            | ContentPart::Video(media)
            | ContentPart::Audio(media)
            | ContentPart::Document(media)
            | ContentPart::Sticker(media) => Some(media),
            _ => None,
        }
    }

    pub fn reply_context(&self) -> Option<&ReplyContext> {
        match self {
            ContentPart::ExtendedText(extended) => extended.context.as_ref(),
            other => other.media().and_then(|media| media.context.as_ref()),
        }
    }

    fn is_revoke(&self) -> bool {
        matches!(self, ContentPart::Protocol(protocol) if protocol.protocol_type.is_revoke())
    }
}

fn non_blank(text: &str) -> Option<&str> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

fn edited_inner(parts: &[ContentPart]) -> Option<&[ContentPart]> {
    parts.iter().find_map(|part| match part {
        ContentPart::Edited { content } => Some(content.as_slice()),
        _ => None,
    })
}

/// Pick the message kind using [`KIND_PRIORITY`], looking one level into an
/// edited wrapper when the outer parts carry no kind.
pub fn classify(parts: &[ContentPart]) -> Option<MessageKind> {
    let outer = KIND_PRIORITY
        .into_iter()
        .find(|kind| parts.iter().any(|part| part.kind() == Some(*kind)));
    outer.or_else(|| {
        let inner = edited_inner(parts)?;
        KIND_PRIORITY
            .into_iter()
            .find(|kind| inner.iter().any(|part| part.kind() == Some(*kind)))
    })
}

fn direct_text(parts: &[ContentPart]) -> Option<&str> {
    let conversation = parts.iter().find_map(|part| match part {
        ContentPart::Conversation { text } => non_blank(text),
        _ => None,
    });
    let extended = || {
        parts.iter().find_map(|part| match part {
            ContentPart::ExtendedText(extended) => non_blank(&extended.text),
            _ => None,
        })
    };
    let caption = || {
        parts
            .iter()
            .filter_map(ContentPart::media)
            .find_map(|media| media.caption.as_deref().and_then(non_blank))
    };
    conversation.or_else(extended).or_else(caption)
}

/// Extract message text: conversation string, then `.text`, then
/// `.caption`, then the same chain inside one edited wrapper, then any part
/// that carries text at all.
pub fn extract_text(parts: &[ContentPart]) -> Option<String> {
    direct_text(parts)
        .or_else(|| edited_inner(parts).and_then(direct_text))
        .or_else(|| {
            let inner = edited_inner(parts).unwrap_or_default();
            parts.iter().chain(inner).find_map(ContentPart::text)
        })
        .map(str::to_string)
}

/// Media descriptor for the given kind, outer parts first
pub fn media_payload(parts: &[ContentPart], kind: MessageKind) -> Option<&MediaPayload> {
    let inner = edited_inner(parts).unwrap_or_default();
    parts
        .iter()
        .chain(inner)
        .find(|part| part.kind() == Some(kind))
        .and_then(ContentPart::media)
}

/// Reply metadata, preferring the edited body's context
pub fn reply_context(parts: &[ContentPart]) -> Option<&ReplyContext> {
    let inner = edited_inner(parts).unwrap_or_default();
    inner
        .iter()
        .chain(parts)
        .find_map(ContentPart::reply_context)
}

pub fn is_revoke(parts: &[ContentPart]) -> bool {
    parts.iter().any(ContentPart::is_revoke)
}

/// True for messages with no archival value: reactions, receipts, poll
/// updates, sync-only protocol chatter, and text messages whose text is
/// blank. Every other protocol message, revokes included, is kept.
pub fn is_noise(parts: &[ContentPart]) -> bool {
    if is_revoke(parts) {
        return false;
    }
    let mut protocols = parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Protocol(protocol) => Some(protocol),
            _ => None,
        })
        .peekable();
    if protocols.peek().is_some() {
        return protocols.all(|protocol| protocol.protocol_type.is_sync_noise());
    }
    if classify(parts).is_some_and(MessageKind::is_media) {
        return false;
    }
    extract_text(parts).is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ExtendedText, ProtocolPayload, ProtocolType};

    fn conversation(text: &str) -> ContentPart {
        ContentPart::Conversation {
            text: text.to_string(),
        }
    }

    fn captioned(caption: &str) -> MediaPayload {
        MediaPayload {
            caption: Some(caption.to_string()),
            ..Default::default()
        }
    }

    fn protocol(protocol_type: ProtocolType) -> ContentPart {
        ContentPart::Protocol(ProtocolPayload {
            protocol_type,
            target_id: Some("target".to_string()),
            target_chat_id: None,
        })
    }

    #[test]
    fn test_classify_uses_priority() {
        let parts = vec![
            conversation("hi"),
            ContentPart::Image(MediaPayload::default()),
            ContentPart::Audio(MediaPayload::default()),
        ];
        assert_eq!(classify(&parts), Some(MessageKind::Audio));

        let parts = vec![
            ContentPart::Sticker(MediaPayload::default()),
            ContentPart::Document(MediaPayload::default()),
        ];
        assert_eq!(classify(&parts), Some(MessageKind::Document));

        let parts = vec![protocol(ProtocolType::Numeric(0)), conversation("x")];
        assert_eq!(classify(&parts), Some(MessageKind::Text));
    }

    #[test]
    fn test_classify_looks_into_edited_wrapper() {
        let parts = vec![ContentPart::Edited {
            content: vec![ContentPart::Video(MediaPayload::default())],
        }];
        assert_eq!(classify(&parts), Some(MessageKind::Video));
        assert_eq!(classify(&[ContentPart::Receipt]), None);
    }

    #[test]
    fn test_text_fallback_chain() {
        assert_eq!(
            extract_text(&[conversation("plain")]).as_deref(),
            Some("plain")
        );

        let extended = ContentPart::ExtendedText(ExtendedText {
            text: "extended".to_string(),
            context: None,
        });
        assert_eq!(extract_text(&[extended]).as_deref(), Some("extended"));

        let image = ContentPart::Image(captioned("a caption"));
        assert_eq!(extract_text(&[image]).as_deref(), Some("a caption"));

        let edited = ContentPart::Edited {
            content: vec![conversation("edited body")],
        };
        assert_eq!(extract_text(&[edited]).as_deref(), Some("edited body"));
    }

    #[test]
    fn test_direct_text_wins_over_caption() {
        let parts = vec![ContentPart::Image(captioned("caption")), conversation("body")];
        assert_eq!(extract_text(&parts).as_deref(), Some("body"));
    }

    #[test]
    fn test_blank_text_is_ignored() {
        assert_eq!(extract_text(&[conversation("   ")]), None);
    }

    #[test]
    fn test_noise_filter() {
        assert!(is_noise(&[ContentPart::Reaction {
            target_id: "m1".to_string(),
            emoji: "+1".to_string(),
        }]));
        assert!(is_noise(&[ContentPart::Receipt]));
        assert!(is_noise(&[ContentPart::PollUpdate]));
        assert!(is_noise(&[protocol(ProtocolType::Numeric(5))]));
        assert!(is_noise(&[protocol(ProtocolType::Named(
            "APP_STATE_SYNC_KEY_SHARE".to_string()
        ))]));

        assert!(!is_noise(&[protocol(ProtocolType::Numeric(0))]));
        assert!(!is_noise(&[protocol(ProtocolType::Named("REVOKE".to_string()))]));
        assert!(!is_noise(&[protocol(ProtocolType::Numeric(14))]));
        assert!(!is_noise(&[protocol(ProtocolType::Named(
            "GROUP_MEMBER_LABEL_CHANGE".to_string()
        ))]));
        assert!(!is_noise(&[ContentPart::Sticker(MediaPayload::default())]));
        assert!(!is_noise(&[conversation("hello")]));
    }
}
