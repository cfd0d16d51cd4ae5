//! Outbound message scheduling
//!
//! Every outbound envelope is either critical (sent at once, or queued
//! verbatim while the link is not viable) or batchable (coalesced into a
//! single `batch` envelope). Nothing is ever handed out while `can_send` is
//! false, and nothing is reordered within its own queue.
//!
//! Batch size is counted in entity slots: repeated updates to the same entity
//! within one window share a slot, so a burst of drag moves for one sprite
//! still leaves as a single envelope. Distinct entities each take a slot.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tavern_protocol::{Envelope, MessageType};
use tokio::time::Instant;
use tracing::{debug, error, trace};

/// Batching configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Debounce window, started by the first message of a batch
    pub batch_window: Duration,
    /// Distinct entities per batch before it is sealed early
    pub max_batch: usize,
    /// Hard bound on sub-messages per batch
    pub max_messages: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(30),
            max_batch: 15,
            max_messages: 100,
        }
    }
}

#[derive(Debug)]
pub struct OutboundScheduler {
    config: SchedulerConfig,
    critical: VecDeque<Envelope>,
    accumulator: Vec<Envelope>,
    slots: HashSet<String>,
    anonymous: usize,
    sealed: VecDeque<Envelope>,
    flush_at: Option<Instant>,
}

impl OutboundScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            critical: VecDeque::new(),
            accumulator: Vec::new(),
            slots: HashSet::new(),
            anonymous: 0,
            sealed: VecDeque::new(),
            flush_at: None,
        }
    }

    /// Schedule an envelope; returns whatever is ready to go out now
    pub fn submit(&mut self, envelope: Envelope, now: Instant, can_send: bool) -> Vec<Envelope> {
        if envelope.is_critical() {
            trace!("Queueing critical {}", envelope.kind());
            self.critical.push_back(envelope);
            return self.take_ready(can_send);
        }

        self.accumulate(envelope, now);
        if self.slot_count() >= self.config.max_batch
            || self.accumulator.len() >= self.config.max_messages
        {
            self.seal();
        }
        self.take_ready(can_send)
    }

    /// Fire the debounce timer if due
    pub fn poll(&mut self, now: Instant, can_send: bool) -> Vec<Envelope> {
        if matches!(self.flush_at, Some(at) if now >= at) {
            self.seal();
        }
        self.take_ready(can_send)
    }

    /// The link became viable: everything pending, critical queue first
    pub fn on_connected(&mut self) -> Vec<Envelope> {
        let mut out: Vec<Envelope> = self.critical.drain(..).collect();
        out.extend(self.sealed.drain(..));
        self.seal();
        out.extend(self.sealed.drain(..));
        if !out.is_empty() {
            debug!("Flushing {} pending envelopes", out.len());
        }
        out
    }

    /// Put back envelopes the link refused, ahead of anything queued since
    pub fn requeue_front(&mut self, envelopes: Vec<Envelope>) {
        for envelope in envelopes.into_iter().rev() {
            match envelope.kind() {
                MessageType::Ping | MessageType::Pong | MessageType::Hello => {
                    trace!("Dropping stale {}", envelope.kind());
                }
                _ if envelope.is_critical() => self.critical.push_front(envelope),
                _ => self.sealed.push_front(envelope),
            }
        }
    }

    /// Drop everything pending and cancel the debounce timer
    pub fn clear(&mut self) {
        self.critical.clear();
        self.accumulator.clear();
        self.slots.clear();
        self.anonymous = 0;
        self.sealed.clear();
        self.flush_at = None;
    }

    /// Withdraw queued requests carrying `correlation_id` before they reach the wire
    pub fn retract(&mut self, correlation_id: &str) -> usize {
        let before = self.critical.len();
        self.critical
            .retain(|envelope| envelope.str_field("correlation_id") != Some(correlation_id));
        let removed = before - self.critical.len();
        if removed > 0 {
            debug!("Withdrew {} queued envelope(s) for {}", removed, correlation_id);
        }
        removed
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.flush_at
    }

    pub fn pending_critical(&self) -> usize {
        self.critical.len()
    }

    pub fn pending_batches(&self) -> usize {
        self.sealed.len()
    }

    pub fn accumulated(&self) -> usize {
        self.accumulator.len()
    }

    pub fn is_idle(&self) -> bool {
        self.critical.is_empty() && self.sealed.is_empty() && self.accumulator.is_empty()
    }

    fn accumulate(&mut self, envelope: Envelope, now: Instant) {
        if self.flush_at.is_none() {
            self.flush_at = Some(now + self.config.batch_window);
        }
        let kind = envelope.kind();
        match envelope.str_field(kind.entity_field()) {
            Some(id) => {
                self.slots.insert(format!("{}:{}", kind, id));
            }
            None => self.anonymous += 1,
        }
        self.accumulator.push(envelope);
    }

    fn slot_count(&self) -> usize {
        self.slots.len() + self.anonymous
    }

    fn seal(&mut self) {
        self.flush_at = None;
        self.slots.clear();
        self.anonymous = 0;
        if self.accumulator.is_empty() {
            return;
        }
        let messages = std::mem::take(&mut self.accumulator);
        let count = messages.len();
        match Envelope::batch(messages) {
            Ok(batch) => {
                trace!("Sealed batch of {}", count);
                self.sealed.push_back(batch);
            }
            Err(e) => error!("Failed to build batch of {}: {}", count, e),
        }
    }

    fn take_ready(&mut self, can_send: bool) -> Vec<Envelope> {
        if !can_send {
            return Vec::new();
        }
        let mut out: Vec<Envelope> = self.critical.drain(..).collect();
        out.extend(self.sealed.drain(..));
        out
    }
}

impl Default for OutboundScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn sprite_move(id: &str, x: i64) -> Envelope {
        Envelope::from_json(MessageType::SpriteMove, json!({ "sprite_id": id, "x": x }))
    }

    fn create(id: &str) -> Envelope {
        Envelope::from_json(MessageType::SpriteCreate, json!({ "correlation_id": id }))
    }

    #[test]
    fn test_critical_sent_immediately_when_connected() {
        let mut scheduler = OutboundScheduler::default();
        let now = Instant::now();

        let out = scheduler.submit(create("a"), now, true);
        assert_eq!(out, vec![create("a")]);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn test_critical_queued_in_order_while_offline() {
        let mut scheduler = OutboundScheduler::default();
        let now = Instant::now();

        for id in ["a", "b", "c"] {
            assert!(scheduler.submit(create(id), now, false).is_empty());
        }
        assert_eq!(scheduler.pending_critical(), 3);
        assert_eq!(scheduler.on_connected(), vec![create("a"), create("b"), create("c")]);
    }

    #[test]
    fn test_retract_withdraws_only_the_matching_request() {
        let mut scheduler = OutboundScheduler::default();
        let now = Instant::now();

        for id in ["a", "b", "c"] {
            scheduler.submit(create(id), now, false);
        }
        assert_eq!(scheduler.retract("b"), 1);
        assert_eq!(scheduler.retract("b"), 0);
        assert_eq!(scheduler.on_connected(), vec![create("a"), create("c")]);
    }

    #[test]
    fn test_twenty_moves_for_one_sprite_make_one_batch() {
        let mut scheduler = OutboundScheduler::default();
        let t0 = Instant::now();
        let moves: Vec<Envelope> = (0..20).map(|x| sprite_move("s1", x)).collect();

        for (i, envelope) in moves.iter().enumerate() {
            let at = t0 + Duration::from_micros(500 * i as u64);
            assert!(scheduler.submit(envelope.clone(), at, true).is_empty());
        }
        assert!(scheduler.poll(t0 + Duration::from_millis(29), true).is_empty());

        let out = scheduler.poll(t0 + Duration::from_millis(30), true);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind(), &MessageType::Batch);
        assert_eq!(out[0].clone().flatten(), moves);
        assert_eq!(scheduler.next_deadline(), None);
    }

    #[test]
    fn test_debounce_not_reset_by_later_messages() {
        let mut scheduler = OutboundScheduler::default();
        let t0 = Instant::now();

        scheduler.submit(sprite_move("a", 1), t0, true);
        scheduler.submit(sprite_move("b", 1), t0 + Duration::from_millis(25), true);
        assert_eq!(scheduler.next_deadline(), Some(t0 + Duration::from_millis(30)));
    }

    #[test]
    fn test_full_batch_seals_without_waiting() {
        let mut scheduler = OutboundScheduler::default();
        let now = Instant::now();

        let mut sent = Vec::new();
        for i in 0..15 {
            sent.extend(scheduler.submit(sprite_move(&format!("s{i}"), 0), now, true));
        }
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].batch_len(), Some(15));
        assert_eq!(scheduler.next_deadline(), None);
    }

    #[test]
    fn test_batches_preserved_across_disconnect() {
        let mut scheduler = OutboundScheduler::default();
        let t0 = Instant::now();

        scheduler.submit(sprite_move("a", 1), t0, false);
        assert!(scheduler.poll(t0 + Duration::from_millis(30), false).is_empty());
        assert_eq!(scheduler.pending_batches(), 1);

        scheduler.submit(create("c"), t0 + Duration::from_millis(40), false);
        scheduler.submit(sprite_move("a", 2), t0 + Duration::from_millis(41), false);

        let out = scheduler.on_connected();
        let kinds: Vec<&MessageType> = out.iter().map(Envelope::kind).collect();
        assert_eq!(
            kinds,
            vec![&MessageType::SpriteCreate, &MessageType::Batch, &MessageType::Batch]
        );
        assert_eq!(out[1].clone().flatten(), vec![sprite_move("a", 1)]);
        assert_eq!(out[2].clone().flatten(), vec![sprite_move("a", 2)]);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn test_requeue_front_restores_order() {
        let mut scheduler = OutboundScheduler::default();
        let now = Instant::now();

        scheduler.submit(create("late"), now, false);
        scheduler.requeue_front(vec![create("a"), Envelope::ping(1, 0), create("b")]);
        assert_eq!(
            scheduler.on_connected(),
            vec![create("a"), create("b"), create("late")]
        );
    }

    #[test]
    fn test_clear_cancels_timer() {
        let mut scheduler = OutboundScheduler::default();
        let now = Instant::now();
        scheduler.submit(sprite_move("a", 1), now, false);
        scheduler.submit(create("c"), now, false);

        scheduler.clear();
        assert!(scheduler.is_idle());
        assert_eq!(scheduler.next_deadline(), None);
    }

    proptest! {
        #[test]
        fn prop_distinct_sends_make_ceil_batches(n in 1usize..60, max in 1usize..20) {
            let mut scheduler = OutboundScheduler::new(SchedulerConfig {
                max_batch: max,
                ..Default::default()
            });
            let t0 = Instant::now();
            let sends: Vec<Envelope> = (0..n).map(|i| sprite_move(&format!("s{i}"), i as i64)).collect();

            let mut out = Vec::new();
            for envelope in &sends {
                out.extend(scheduler.submit(envelope.clone(), t0, true));
            }
            out.extend(scheduler.poll(t0 + Duration::from_millis(30), true));

            prop_assert_eq!(out.len(), n.div_ceil(max));
            let flattened: Vec<Envelope> = out.into_iter().flat_map(Envelope::flatten).collect();
            prop_assert_eq!(flattened, sends);
        }
    }
}
