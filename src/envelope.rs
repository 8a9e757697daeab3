// Copyright 2020 Joyent, Inc.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use num_derive::{FromPrimitive, ToPrimitive};
use serde::Serialize;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConversationError, Result};

static CONVERSATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque token naming one conversation. Generated by the opening side and
/// never reused within a process.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn generate() -> ConversationId {
        let count = CONVERSATION_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
        ConversationId(format!("{:x}-{:016x}", count, rand::random::<u64>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        ConversationId(s.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        ConversationId(s)
    }
}

#[derive(
    Serialize, Deserialize, FromPrimitive, ToPrimitive, Clone, Copy, Debug, PartialEq, Eq,
)]
pub enum EnvelopeKind {
    Data = 1,
    Progress = 2,
    Error = 3,
    End = 4,
}

impl EnvelopeKind {
    /// ERROR and END finish a conversation.
    pub fn is_terminal(self) -> bool {
        matches!(self, EnvelopeKind::Error | EnvelopeKind::End)
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnvelopeKind::Data => "data",
            EnvelopeKind::Progress => "progress",
            EnvelopeKind::Error => "error",
            EnvelopeKind::End => "end",
        };
        f.write_str(name)
    }
}

/// One unit of conversation traffic.
///
/// Equality and ordering only look at `(conversation_id, sequence)`: two
/// envelopes with the same number in the same conversation are the same
/// message as far as duplicate and gap detection is concerned.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MessageEnvelope {
    conversation_id: ConversationId,
    sequence: u64,
    kind: EnvelopeKind,
    #[serde(default)]
    payload: Value,
}

impl MessageEnvelope {
    pub fn new(
        conversation_id: ConversationId,
        sequence: u64,
        kind: EnvelopeKind,
        payload: Value,
    ) -> MessageEnvelope {
        MessageEnvelope {
            conversation_id,
            sequence,
            kind,
            payload,
        }
    }

    pub fn data(conversation_id: ConversationId, sequence: u64, payload: Value) -> Self {
        Self::new(conversation_id, sequence, EnvelopeKind::Data, payload)
    }

    pub fn progress(conversation_id: ConversationId, sequence: u64, payload: Value) -> Self {
        Self::new(conversation_id, sequence, EnvelopeKind::Progress, payload)
    }

    pub fn error(conversation_id: ConversationId, sequence: u64, description: &str) -> Self {
        Self::new(
            conversation_id,
            sequence,
            EnvelopeKind::Error,
            Value::String(description.to_string()),
        )
    }

    pub fn end(conversation_id: ConversationId, sequence: u64) -> Self {
        Self::new(conversation_id, sequence, EnvelopeKind::End, Value::Null)
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn into_payload(self) -> Value {
        self.payload
    }

    /// The description carried by an ERROR envelope.
    pub fn error_description(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl PartialEq for MessageEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.conversation_id == other.conversation_id && self.sequence == other.sequence
    }
}

impl Eq for MessageEnvelope {}

impl Hash for MessageEnvelope {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.conversation_id.hash(state);
        self.sequence.hash(state);
    }
}

impl PartialOrd for MessageEnvelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MessageEnvelope {
    fn cmp(&self, other: &Self) -> Ordering {
        self.conversation_id
            .cmp(&other.conversation_id)
            .then(self.sequence.cmp(&other.sequence))
    }
}

/// Hands out the sequence numbers of one direction of one conversation.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: u64,
}

impl SequenceCounter {
    pub fn new() -> SequenceCounter {
        SequenceCounter { next: 0 }
    }

    pub fn next(&mut self) -> u64 {
        let n = self.next;
        self.next += 1;
        n
    }

    pub fn peek(&self) -> u64 {
        self.next
    }

    /// Builds the next envelope of this direction.
    pub fn stamp<T: Serialize>(
        &mut self,
        conversation_id: &ConversationId,
        kind: EnvelopeKind,
        payload: &T,
    ) -> Result<MessageEnvelope> {
        let payload = serde_json::to_value(payload)?;
        Ok(MessageEnvelope::new(
            conversation_id.clone(),
            self.next(),
            kind,
            payload,
        ))
    }
}

/// Receiver side of the sequencing invariant: within one direction numbers
/// go up by exactly one. A gap or a repeat is a protocol fault.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    expected: u64,
}

impl SequenceTracker {
    pub fn new() -> SequenceTracker {
        SequenceTracker { expected: 0 }
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn accept(&mut self, envelope: &MessageEnvelope) -> Result<()> {
        if envelope.sequence() != self.expected {
            return Err(ConversationError::ProtocolSequence {
                conversation_id: envelope.conversation_id().clone(),
                expected: self.expected,
                actual: envelope.sequence(),
            });
        }
        self.expected += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use quickcheck::quickcheck;
    use serde_json::json;

    fn envelope(seq: u64) -> MessageEnvelope {
        MessageEnvelope::data(ConversationId::from("c"), seq, json!("x"))
    }

    #[test]
    fn identity_is_id_and_sequence() {
        let a = MessageEnvelope::data(ConversationId::from("c"), 3, json!("one"));
        let b = MessageEnvelope::progress(ConversationId::from("c"), 3, json!("two"));
        let c = MessageEnvelope::data(ConversationId::from("d"), 3, json!("one"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a < c);
        assert!(envelope(1) < envelope(2));
    }

    #[test]
    fn generated_ids_are_unique() {
        let ids: std::collections::HashSet<_> =
            (0..1000).map(|_| ConversationId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn tracker_rejects_gap_and_repeat() {
        let mut tracker = SequenceTracker::new();
        tracker.accept(&envelope(0)).unwrap();
        tracker.accept(&envelope(1)).unwrap();

        match tracker.accept(&envelope(1)) {
            Err(ConversationError::ProtocolSequence { expected, actual, .. }) => {
                assert_eq!((expected, actual), (2, 1));
            }
            other => panic!("repeat accepted: {:?}", other),
        }
        match tracker.accept(&envelope(3)) {
            Err(ConversationError::ProtocolSequence { expected, actual, .. }) => {
                assert_eq!((expected, actual), (2, 3));
            }
            other => panic!("gap accepted: {:?}", other),
        }
        tracker.accept(&envelope(2)).unwrap();
        assert_eq!(tracker.expected(), 3);
    }

    #[test]
    fn error_description() {
        let e = MessageEnvelope::error(ConversationId::from("c"), 0, "boom");
        assert_eq!(e.error_description(), "boom");
        assert!(e.kind().is_terminal());
        assert!(!EnvelopeKind::Progress.is_terminal());
    }

    quickcheck! {
        fn counter_output_is_always_accepted(n: u8) -> bool {
            let id = ConversationId::from("q");
            let mut counter = SequenceCounter::new();
            let mut tracker = SequenceTracker::new();
            (0..n).all(|_| {
                let env = counter.stamp(&id, EnvelopeKind::Data, &Value::Null).unwrap();
                tracker.accept(&env).is_ok()
            })
        }

        fn any_other_number_is_a_fault(prefix: u8, offset: u64) -> bool {
            let mut tracker = SequenceTracker::new();
            for seq in 0..u64::from(prefix) {
                tracker.accept(&envelope(seq)).unwrap();
            }
            let expected = u64::from(prefix);
            let wrong = if offset == 0 { expected + 1 } else { expected.wrapping_add(offset) };
            let wrong = if wrong == expected { wrong + 1 } else { wrong };
            tracker.accept(&envelope(wrong)).is_err() && tracker.expected() == expected
        }
    }
}
