//! Acknowledgement correlation.
//!
//! An event carrying an ack id expects a reply: an ack packet with the
//! same namespace and id travelling the other way. The tracker pairs the
//! two. Replies that never arrive are reported when the connection ends,
//! or earlier if the table is full and the callback is the oldest one
//! waiting; they are not errors.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::protocol::frame::Packet;
use crate::protocol::Direction;

/// Callbacks tracked per connection unless configured otherwise.
pub const DEFAULT_PENDING_LIMIT: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    origin: Direction,
    namespace: String,
    id: u64,
}

#[derive(Debug)]
struct PendingAck {
    event: Option<String>,
    sent_at: Instant,
    seq: u64,
}

/// What a packet meant for callback bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// An event now waits for a reply.
    Requested {
        origin: Direction,
        namespace: String,
        id: u64,
        event: Option<String>,
    },
    /// A reply matched a waiting event.
    Acknowledged {
        origin: Direction,
        namespace: String,
        id: u64,
        event: Option<String>,
        elapsed: Duration,
    },
    /// A reply with no waiting event.
    Unmatched {
        from: Direction,
        namespace: String,
        id: u64,
    },
    /// The reply never arrived: the connection ended, or the callback was
    /// pushed out of a full table.
    Unacknowledged {
        origin: Direction,
        namespace: String,
        id: u64,
        event: Option<String>,
    },
}

impl AckOutcome {
    fn unacknowledged(key: PendingKey, pending: PendingAck) -> Self {
        AckOutcome::Unacknowledged {
            origin: key.origin,
            namespace: key.namespace,
            id: key.id,
            event: pending.event,
        }
    }
}

/// Per-connection table of callbacks waiting for a reply.
///
/// Holds at most `limit` entries. Registering one more evicts the oldest,
/// which is reported as [`AckOutcome::Unacknowledged`].
#[derive(Debug)]
pub struct AckTracker {
    pending: HashMap<PendingKey, PendingAck>,
    // insertion order, for eviction and for `finish`
    order: BTreeMap<u64, PendingKey>,
    next_seq: u64,
    limit: usize,
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::with_limit(DEFAULT_PENDING_LIMIT)
    }
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            pending: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            limit: limit.max(1),
        }
    }

    /// Account for a packet travelling in `direction`.
    ///
    /// Evictions caused by a new callback come first, then the outcome of
    /// the packet itself. Packets without an ack id yield nothing.
    pub fn observe(&mut self, direction: Direction, packet: &Packet) -> Vec<AckOutcome> {
        let Some(id) = packet.ack_id else {
            return Vec::new();
        };

        if packet.kind.is_event() {
            return self.request(direction, packet, id);
        }

        if packet.kind.is_ack() {
            let key = PendingKey {
                origin: direction.reverse(),
                namespace: packet.namespace.clone(),
                id,
            };
            let outcome = match self.pending.remove(&key) {
                Some(pending) => {
                    self.order.remove(&pending.seq);
                    AckOutcome::Acknowledged {
                        origin: key.origin,
                        namespace: key.namespace,
                        id,
                        event: pending.event,
                        elapsed: pending.sent_at.elapsed(),
                    }
                }
                None => AckOutcome::Unmatched {
                    from: direction,
                    namespace: key.namespace,
                    id,
                },
            };
            return vec![outcome];
        }

        Vec::new()
    }

    fn request(&mut self, direction: Direction, packet: &Packet, id: u64) -> Vec<AckOutcome> {
        let key = PendingKey {
            origin: direction,
            namespace: packet.namespace.clone(),
            id,
        };
        let event = packet.event_name().map(str::to_string);
        let seq = self.next_seq;
        self.next_seq += 1;

        let replaced = self.pending.insert(
            key.clone(),
            PendingAck {
                event: event.clone(),
                sent_at: Instant::now(),
                seq,
            },
        );
        if let Some(old) = replaced {
            self.order.remove(&old.seq);
        }
        self.order.insert(seq, key);

        let mut outcomes = Vec::new();
        while self.pending.len() > self.limit {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            if let Some(dropped) = self.pending.remove(&oldest) {
                outcomes.push(AckOutcome::unacknowledged(oldest, dropped));
            }
        }

        outcomes.push(AckOutcome::Requested {
            origin: direction,
            namespace: packet.namespace.clone(),
            id,
            event,
        });
        outcomes
    }

    /// Callbacks still waiting.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Close the books: every callback still waiting, oldest first.
    pub fn finish(mut self) -> Vec<AckOutcome> {
        let order = std::mem::take(&mut self.order);
        order
            .into_values()
            .filter_map(|key| {
                let pending = self.pending.remove(&key)?;
                Some(AckOutcome::unacknowledged(key, pending))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{Packet, PacketKind};
    use serde_json::json;

    #[test]
    fn pairs_event_with_reverse_ack() {
        let mut tracker = AckTracker::new();
        let event = Packet::event("emit_with_callback", vec![]).with_ack_id(1);
        assert!(matches!(
            tracker.observe(Direction::ClientToUpstream, &event).as_slice(),
            [AckOutcome::Requested { id: 1, .. }]
        ));
        assert_eq!(tracker.pending(), 1);

        let reply = Packet::ack(1, vec![json!({"xxx": "yyy"})]);
        match tracker.observe(Direction::UpstreamToClient, &reply).as_slice() {
            [AckOutcome::Acknowledged { origin, id, event, .. }] => {
                assert_eq!(*origin, Direction::ClientToUpstream);
                assert_eq!(*id, 1);
                assert_eq!(event.as_deref(), Some("emit_with_callback"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn ack_in_same_direction_does_not_match() {
        let mut tracker = AckTracker::new();
        tracker.observe(
            Direction::ClientToUpstream,
            &Packet::event("ack", vec![]).with_ack_id(5),
        );
        let outcome = tracker.observe(Direction::ClientToUpstream, &Packet::ack(5, vec![]));
        assert!(matches!(outcome.as_slice(), [AckOutcome::Unmatched { id: 5, .. }]));
        assert_eq!(tracker.pending(), 1);
    }

    #[test]
    fn namespaces_keep_ids_apart() {
        let mut tracker = AckTracker::new();
        tracker.observe(
            Direction::UpstreamToClient,
            &Packet::event("ack_response", vec![]).with_ack_id(0).with_namespace("/chat"),
        );
        let root_reply = Packet::ack(0, vec![]);
        assert!(matches!(
            tracker.observe(Direction::ClientToUpstream, &root_reply).as_slice(),
            [AckOutcome::Unmatched { .. }]
        ));
        let chat_reply = Packet::ack(0, vec![]).with_namespace("/chat");
        assert!(matches!(
            tracker.observe(Direction::ClientToUpstream, &chat_reply).as_slice(),
            [AckOutcome::Acknowledged { .. }]
        ));
    }

    #[test]
    fn packets_without_ids_are_ignored() {
        let mut tracker = AckTracker::new();
        assert!(tracker
            .observe(Direction::ClientToUpstream, &Packet::event("emit", vec![]))
            .is_empty());
        assert!(tracker
            .observe(Direction::ClientToUpstream, &Packet::new(PacketKind::Connect))
            .is_empty());
    }

    #[test]
    fn finish_lists_unanswered_callbacks() {
        let mut tracker = AckTracker::new();
        tracker.observe(
            Direction::ClientToUpstream,
            &Packet::event("bbb", vec![]).with_ack_id(2),
        );
        let left = tracker.finish();
        assert_eq!(
            left,
            vec![AckOutcome::Unacknowledged {
                origin: Direction::ClientToUpstream,
                namespace: "/".into(),
                id: 2,
                event: Some("bbb".into()),
            }]
        );
    }

    #[test]
    fn full_table_evicts_oldest_callback() {
        let mut tracker = AckTracker::with_limit(2);
        for id in 0..2 {
            tracker.observe(
                Direction::ClientToUpstream,
                &Packet::event("x", vec![]).with_ack_id(id),
            );
        }

        let outcomes = tracker.observe(
            Direction::ClientToUpstream,
            &Packet::event("x", vec![]).with_ack_id(2),
        );
        assert_eq!(outcomes.len(), 2);
        assert_eq!(
            outcomes[0],
            AckOutcome::Unacknowledged {
                origin: Direction::ClientToUpstream,
                namespace: "/".into(),
                id: 0,
                event: Some("x".into()),
            }
        );
        assert!(matches!(outcomes[1], AckOutcome::Requested { id: 2, .. }));
        assert_eq!(tracker.pending(), 2);

        // The evicted callback is gone; a late reply no longer matches.
        let late = tracker.observe(Direction::UpstreamToClient, &Packet::ack(0, vec![]));
        assert!(matches!(late.as_slice(), [AckOutcome::Unmatched { id: 0, .. }]));

        let left: Vec<u64> = tracker
            .finish()
            .into_iter()
            .map(|outcome| match outcome {
                AckOutcome::Unacknowledged { id, .. } => id,
                other => panic!("unexpected outcome: {:?}", other),
            })
            .collect();
        assert_eq!(left, vec![1, 2]);
    }

    #[test]
    fn unanswered_flood_stays_bounded() {
        let mut tracker = AckTracker::with_limit(16);
        let mut evicted = 0;
        for id in 0..10_000 {
            evicted += tracker
                .observe(
                    Direction::ClientToUpstream,
                    &Packet::event("x", vec![]).with_ack_id(id),
                )
                .iter()
                .filter(|o| matches!(o, AckOutcome::Unacknowledged { .. }))
                .count();
        }
        assert_eq!(tracker.pending(), 16);
        assert_eq!(evicted, 10_000 - 16);
    }

    #[test]
    fn reused_id_replaces_the_earlier_callback() {
        let mut tracker = AckTracker::with_limit(4);
        tracker.observe(
            Direction::ClientToUpstream,
            &Packet::event("first", vec![]).with_ack_id(3),
        );
        tracker.observe(
            Direction::ClientToUpstream,
            &Packet::event("second", vec![]).with_ack_id(3),
        );
        assert_eq!(tracker.pending(), 1);
        match tracker.finish().as_slice() {
            [AckOutcome::Unacknowledged { event, .. }] => {
                assert_eq!(event.as_deref(), Some("second"))
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
