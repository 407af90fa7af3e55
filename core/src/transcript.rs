use chrono::{DateTime, Utc};

/// One conversation message as fed into transcript rendering.
#[derive(Debug, Clone)]
pub struct TranscriptMessage {
    pub user_sent: bool,
    pub body: String,
    pub received_at: DateTime<Utc>,
    /// Tiebreaker when two messages share a timestamp.
    pub id: i64,
}

/// Fixed sender label used in transcripts and message listings.
pub fn sender_label(user_sent: bool) -> &'static str {
    if user_sent { "User" } else { "Agent" }
}

/// Render messages as `"{Sender}: {Body}"` lines joined with `\n`,
/// ordered by `(received_at, id)` ascending. No messages renders to
/// the empty string — a conversation with no history is still a valid
/// (if unhelpful) input for assessment.
pub fn render_transcript(mut messages: Vec<TranscriptMessage>) -> String {
    messages.sort_by(|a, b| (a.received_at, a.id).cmp(&(b.received_at, b.id)));
    messages
        .iter()
        .map(|m| format!("{}: {}", sender_label(m.user_sent), m.body))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn msg(id: i64, user_sent: bool, body: &str, at: DateTime<Utc>) -> TranscriptMessage {
        TranscriptMessage {
            user_sent,
            body: body.to_string(),
            received_at: at,
            id,
        }
    }

    #[test]
    fn empty_history_renders_to_empty_string() {
        assert_eq!(render_transcript(Vec::new()), "");
    }

    #[test]
    fn labels_user_and_agent_lines() {
        let t0 = Utc::now();
        let rendered = render_transcript(vec![
            msg(1, true, "Hello, how are you?", t0),
            msg(2, false, "I'm good!", t0 + Duration::milliseconds(50)),
        ]);
        assert_eq!(rendered, "User: Hello, how are you?\nAgent: I'm good!");
    }

    #[test]
    fn orders_by_timestamp_regardless_of_input_order() {
        let t1 = Utc::now();
        let t2 = t1 + Duration::seconds(1);
        let t3 = t1 + Duration::seconds(2);
        let rendered = render_transcript(vec![
            msg(3, true, "third", t3),
            msg(1, true, "first", t1),
            msg(2, false, "second", t2),
        ]);
        assert_eq!(rendered, "User: first\nAgent: second\nUser: third");
    }

    #[test]
    fn equal_timestamps_fall_back_to_id_order() {
        let t = Utc::now();
        let rendered = render_transcript(vec![
            msg(8, false, "later insert", t),
            msg(7, true, "earlier insert", t),
        ]);
        assert_eq!(rendered, "User: earlier insert\nAgent: later insert");
    }
}
