//! Typed events flowing from session ingestion actors into the pipeline.
//!
//! Listeners emit [`RawSourceEvent`]s tagged with the source channel only;
//! the session actor resolves the owning pair and forwards [`SourceEvent`]s
//! to the engine. Events for one (pair, source message) key are always
//! processed in `created -> edited* -> deleted` order.

/// A message as observed on a source channel, before pair resolution.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Source channel reference (`@username` or numeric chat id).
    pub channel: String,
    /// Platform message id within the source channel.
    pub message_id: i64,
    /// Raw text content (empty for media-only messages).
    pub text: String,
    /// Raw image payload, if the message carries one.
    pub image: Option<Vec<u8>>,
}

/// Events emitted by a [`crate::session::SourceListener`].
#[derive(Debug, Clone)]
pub enum RawSourceEvent {
    Created(RawMessage),
    Edited(RawMessage),
    Deleted {
        channel: String,
        message_ids: Vec<i64>,
    },
}

/// A message routed to a specific pair.
#[derive(Debug, Clone)]
pub struct RoutedMessage {
    pub pair_id: String,
    pub session_id: String,
    pub message_id: i64,
    pub text: String,
    pub image: Option<Vec<u8>>,
}

/// Events consumed by the relay engine.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Created(RoutedMessage),
    Edited(RoutedMessage),
    Deleted {
        pair_id: String,
        session_id: String,
        message_id: i64,
    },
}

impl SourceEvent {
    /// Pair this event belongs to.
    pub fn pair_id(&self) -> &str {
        match self {
            SourceEvent::Created(m) | SourceEvent::Edited(m) => &m.pair_id,
            SourceEvent::Deleted { pair_id, .. } => pair_id,
        }
    }

    /// Source message id this event refers to.
    pub fn message_id(&self) -> i64 {
        match self {
            SourceEvent::Created(m) | SourceEvent::Edited(m) => m.message_id,
            SourceEvent::Deleted { message_id, .. } => *message_id,
        }
    }
}

/// Bounded preview of message content for logs and trap events. Full
/// content never reaches the audit trail.
pub fn preview(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push('…');
    }
    out.replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let msg = RoutedMessage {
            pair_id: "p1".into(),
            session_id: "s1".into(),
            message_id: 42,
            text: "hello".into(),
            image: None,
        };
        let ev = SourceEvent::Created(msg);
        assert_eq!(ev.pair_id(), "p1");
        assert_eq!(ev.message_id(), 42);

        let del = SourceEvent::Deleted {
            pair_id: "p2".into(),
            session_id: "s1".into(),
            message_id: 7,
        };
        assert_eq!(del.pair_id(), "p2");
        assert_eq!(del.message_id(), 7);
    }

    #[test]
    fn test_preview_bounds_and_flattens() {
        assert_eq!(preview("short", 32), "short");
        let long = "a".repeat(40);
        let p = preview(&long, 32);
        assert_eq!(p.chars().count(), 33); // 32 chars + ellipsis
        assert_eq!(preview("two\nlines", 32), "two lines");
    }
}
