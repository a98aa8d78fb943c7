//! Dynamic query-hit routing: per-query accounting and admission under load.
//!
//! Every query hit we are about to relay is checked against how many hits for the
//! same query were already received, queued and sent, and against the state of the
//! destination's outbound queue. Popular queries get throttled so that a single
//! search cannot saturate a link.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use tracing::trace;

use crate::config::HitsConfig;
use crate::protocol::Guid;
use crate::queue::{FlowState, OutboundQueue, QueueError};

/// Per-query statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HitRecord {
    pub msg_recv: u32,
    pub hits_recv: u32,
    pub hits_sent: u32,
    /// Admitted but not yet written to the wire.
    pub hits_queued: u32,
}

/// Completion token attached to a relayed hit in the outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitTicket {
    pub guid: Guid,
    pub hits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    FlowControl,
    QueuePressure,
    Throttle,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DropReason::FlowControl => "flow control",
            DropReason::QueuePressure => "queue pressure",
            DropReason::Throttle => "throttle",
        })
    }
}

/// What happened to a relay attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    Queued,
    Dropped(DropReason),
    /// Admitted, but the destination queue had no room. The destination must be removed.
    Rejected(QueueError),
}

/// Two-generation table of [`HitRecord`]s keyed by query GUID.
#[derive(Debug)]
pub struct HitRouter {
    current: HashMap<Guid, HitRecord>,
    aging: HashMap<Guid, HitRecord>,
    last_rotation: Instant,
    cfg: HitsConfig,
}

impl HitRouter {
    pub fn new(cfg: HitsConfig, now: Instant) -> Self {
        Self {
            current: HashMap::new(),
            aging: HashMap::new(),
            last_rotation: now,
            cfg,
        }
    }

    /// Find a record, moving it back into the current generation if it was aging.
    fn locate(&mut self, guid: &Guid) -> Option<&mut HitRecord> {
        if let Some(rec) = self.aging.remove(guid) {
            self.current.insert(*guid, rec);
        }
        self.current.get_mut(guid)
    }

    /// Account for a query hit message carrying `count` results. Must precede [`route`](Self::route).
    pub fn got_results(&mut self, guid: Guid, count: u32) {
        if self.locate(&guid).is_none() {
            self.current.insert(guid, HitRecord::default());
        }
        if let Some(rec) = self.current.get_mut(&guid) {
            rec.msg_recv = rec.msg_recv.saturating_add(1);
            rec.hits_recv = rec.hits_recv.saturating_add(count);
        }
    }

    /// Admission decision for relaying a hit for `guid` into `queue`. Every rule
    /// drops; when several match, queue pressure is reported over flow control.
    pub fn decide<T>(&mut self, guid: &Guid, queue: &OutboundQueue<T>) -> Result<(), DropReason> {
        let cfg = self.cfg.clone();
        let rec = self.locate(guid).copied().unwrap_or_default();
        let size = queue.size();

        if rec.hits_sent >= cfg.min_hits && size > queue.hiwat() {
            return Err(DropReason::QueuePressure);
        }
        if rec.hits_sent >= cfg.popular_hits && size > queue.lowat() {
            return Err(DropReason::QueuePressure);
        }
        match queue.flow_state() {
            FlowState::SeverelyControlled if rec.hits_sent > 0 || rec.hits_queued > 0 => {
                return Err(DropReason::FlowControl)
            }
            FlowState::FlowControlled if rec.hits_queued > 0 => {
                return Err(DropReason::FlowControl)
            }
            _ => {}
        }
        if rec.hits_sent >= cfg.min_hits
            && rec.hits_recv >= cfg.popular_hits
            && rec.hits_queued >= cfg.popular_hits - cfg.min_hits
        {
            return Err(DropReason::Throttle);
        }
        if rec.hits_sent >= cfg.popular_hits && rec.hits_queued >= cfg.min_hits {
            return Err(DropReason::Throttle);
        }
        if rec.hits_sent >= cfg.max_hits && rec.hits_queued > 0 {
            return Err(DropReason::Throttle);
        }
        Ok(())
    }

    /// Relay an encoded query hit carrying `count` results to `queue` if admitted.
    pub fn route(
        &mut self,
        guid: Guid,
        count: u32,
        bytes: &[u8],
        queue: &mut OutboundQueue<HitTicket>,
    ) -> RouteOutcome {
        if let Err(reason) = self.decide(&guid, queue) {
            trace!(guid = %guid, count, reason = %reason, "dropping query hit");
            return RouteOutcome::Dropped(reason);
        }
        let ticket = HitTicket { guid, hits: count };
        match queue.push_packet(bytes, Some(ticket)) {
            Ok(()) => {
                if let Some(rec) = self.locate(&guid) {
                    rec.hits_queued = rec.hits_queued.saturating_add(count);
                }
                trace!(guid = %guid, count, "queued query hit");
                RouteOutcome::Queued
            }
            Err((e, _)) => RouteOutcome::Rejected(e),
        }
    }

    /// Resolve a ticket once the queue wrote (`sent`) or discarded its packet.
    /// Records that already aged out are ignored.
    pub fn complete(&mut self, ticket: HitTicket, sent: bool) {
        let Some(rec) = self.locate(&ticket.guid) else {
            return;
        };
        rec.hits_queued = rec.hits_queued.saturating_sub(ticket.hits);
        if sent {
            rec.hits_sent = rec.hits_sent.saturating_add(ticket.hits);
        }
    }

    /// Rotate generations once per half-life: the aging table is dropped and the
    /// current one starts aging.
    pub fn rotate(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_rotation) < self.cfg.half_life() {
            return;
        }
        self.aging.clear();
        std::mem::swap(&mut self.current, &mut self.aging);
        self.last_rotation = now;
        trace!(aging = self.aging.len(), "rotated hit tables");
    }

    /// Current statistics for a query, without refreshing its generation.
    pub fn record(&self, guid: &Guid) -> Option<HitRecord> {
        self.current.get(guid).or_else(|| self.aging.get(guid)).copied()
    }

    pub fn tracked(&self) -> usize {
        self.current.len() + self.aging.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;
    use proptest::prelude::*;
    use std::time::Duration;

    fn router() -> (HitRouter, Instant) {
        let now = Instant::now();
        (HitRouter::new(HitsConfig::default(), now), now)
    }

    fn seed(r: &mut HitRouter, guid: Guid, rec: HitRecord) {
        r.current.insert(guid, rec);
    }

    #[test]
    fn queue_pressure_above_high_watermark() {
        let (mut r, _) = router();
        let guid = Guid::random();
        let mut q = OutboundQueue::new(1000, 300, 500);
        seed(
            &mut r,
            guid,
            HitRecord {
                msg_recv: 100,
                hits_recv: 300,
                hits_sent: 260,
                hits_queued: 0,
            },
        );
        // 90% of the high watermark.
        q.enqueue(&[0; 450]).unwrap();
        assert_eq!(r.route(guid, 1, b"hit", &mut q), RouteOutcome::Queued);
        let ticket = HitTicket { guid, hits: 1 };
        r.complete(ticket, true);
        assert_eq!(r.record(&guid).unwrap().hits_sent, 261);

        q.enqueue(&[0; 100]).unwrap();
        assert_eq!(
            r.route(guid, 1, b"hit", &mut q),
            RouteOutcome::Dropped(DropReason::QueuePressure)
        );
    }

    #[test]
    fn flow_control_rules() {
        let (mut r, _) = router();
        let guid = Guid::random();
        let mut q: OutboundQueue<HitTicket> = OutboundQueue::new(1000, 100, 200);
        r.got_results(guid, 5);
        q.enqueue(&[0; 150]).unwrap();
        // Flow-controlled but nothing queued for this query yet.
        assert_eq!(r.decide(&guid, &q), Ok(()));
        assert_eq!(r.route(guid, 5, b"x", &mut q), RouteOutcome::Queued);
        assert_eq!(r.decide(&guid, &q), Err(DropReason::FlowControl));

        // Severe: anything already sent is enough to drop.
        let other = Guid::random();
        r.got_results(other, 1);
        seed(
            &mut r,
            other,
            HitRecord {
                msg_recv: 1,
                hits_recv: 1,
                hits_sent: 1,
                hits_queued: 0,
            },
        );
        q.enqueue(&[0; 100]).unwrap();
        assert_eq!(q.flow_state(), FlowState::SeverelyControlled);
        assert_eq!(r.decide(&other, &q), Err(DropReason::FlowControl));
        let fresh = Guid::random();
        assert_eq!(r.decide(&fresh, &q), Ok(()));
    }

    #[test]
    fn saturated_queue_never_drained_drops_followups() {
        let (mut r, _) = router();
        let guid = Guid::random();
        let mut q: OutboundQueue<HitTicket> = OutboundQueue::new(1000, 100, 200);
        seed(
            &mut r,
            guid,
            HitRecord {
                msg_recv: 1,
                hits_recv: 1,
                hits_sent: 1,
                hits_queued: 0,
            },
        );
        q.enqueue(&[0; 300]).unwrap();
        assert_eq!(r.decide(&guid, &q), Err(DropReason::FlowControl));
        assert_eq!(
            r.route(guid, 1, b"hit", &mut q),
            RouteOutcome::Dropped(DropReason::FlowControl)
        );
        assert_eq!(q.size(), 300);

        // A query with nothing sent or queued yet still gets its first hit through.
        let fresh = Guid::random();
        r.got_results(fresh, 1);
        assert_eq!(r.route(fresh, 1, b"hit", &mut q), RouteOutcome::Queued);
    }

    #[test]
    fn throttle_rules() {
        let (mut r, _) = router();
        let q: OutboundQueue<HitTicket> = OutboundQueue::new(1000, 100, 200);
        let cases = [
            ((250, 500, 250), Err(DropReason::Throttle)),
            ((250, 499, 250), Ok(())),
            ((500, 500, 250), Err(DropReason::Throttle)),
            ((500, 600, 249), Ok(())),
            ((1000, 1000, 1), Err(DropReason::Throttle)),
            ((1000, 1000, 0), Ok(())),
        ];
        for ((sent, recv, queued), expected) in cases {
            let guid = Guid::random();
            seed(
                &mut r,
                guid,
                HitRecord {
                    msg_recv: 1,
                    hits_recv: recv,
                    hits_sent: sent,
                    hits_queued: queued,
                },
            );
            assert_eq!(r.decide(&guid, &q), expected, "sent={sent} recv={recv} queued={queued}");
        }
    }

    #[test]
    fn popular_query_under_low_watermark_pressure() {
        let (mut r, _) = router();
        let guid = Guid::random();
        let mut q: OutboundQueue<HitTicket> = OutboundQueue::new(1000, 100, 200);
        seed(
            &mut r,
            guid,
            HitRecord {
                msg_recv: 1,
                hits_recv: 600,
                hits_sent: 500,
                hits_queued: 0,
            },
        );
        assert_eq!(r.decide(&guid, &q), Ok(()));
        q.enqueue(&[0; 101]).unwrap();
        assert_eq!(r.decide(&guid, &q), Err(DropReason::QueuePressure));
    }

    #[test]
    fn discarded_ticket_only_releases_queue_credit() {
        let (mut r, _) = router();
        let guid = Guid::random();
        let mut q = OutboundQueue::new(1000, 400, 800);
        r.got_results(guid, 3);
        assert_eq!(r.route(guid, 3, b"abc", &mut q), RouteOutcome::Queued);
        assert_eq!(r.record(&guid).unwrap().hits_queued, 3);
        for ticket in q.discard_all() {
            r.complete(ticket, false);
        }
        let rec = r.record(&guid).unwrap();
        assert_eq!(rec.hits_queued, 0);
        assert_eq!(rec.hits_sent, 0);
    }

    #[test]
    fn rejected_when_queue_full() {
        let (mut r, _) = router();
        let guid = Guid::random();
        let mut q = OutboundQueue::new(4, 1, 2);
        r.got_results(guid, 1);
        assert!(matches!(
            r.route(guid, 1, b"too big", &mut q),
            RouteOutcome::Rejected(_)
        ));
        assert_eq!(r.record(&guid).unwrap().hits_queued, 0);
    }

    #[test]
    fn rotation_forgets_after_two_half_lives() {
        let (mut r, start) = router();
        let guid = Guid::random();
        r.got_results(guid, 1);
        r.rotate(start + Duration::from_secs(10));
        assert_eq!(r.tracked(), 1);
        r.rotate(start + Duration::from_secs(300));
        assert!(r.record(&guid).is_some());
        r.rotate(start + Duration::from_secs(600));
        assert!(r.record(&guid).is_none());
        assert_eq!(r.tracked(), 0);
    }

    #[test]
    fn lookup_revives_aging_record() {
        let (mut r, start) = router();
        let guid = Guid::random();
        r.got_results(guid, 1);
        r.rotate(start + Duration::from_secs(300));
        r.got_results(guid, 2);
        r.rotate(start + Duration::from_secs(600));
        let rec = r.record(&guid).unwrap();
        assert_eq!(rec.msg_recv, 2);
        assert_eq!(rec.hits_recv, 3);
    }

    proptest! {
        #[test]
        fn queued_never_exceeds_received(
            steps in proptest::collection::vec((1u32..20, 0usize..200, any::<bool>()), 1..60),
        ) {
            let (mut r, _) = router();
            let guid = Guid::random();
            let mem = MemoryStream::new();
            let mut q = OutboundQueue::new(4000, 1000, 2000);
            for (count, budget, discard) in steps {
                r.got_results(guid, count);
                let _ = r.route(guid, count, &vec![0u8; 50], &mut q);
                if discard {
                    for t in q.discard_all() {
                        r.complete(t, false);
                    }
                } else {
                    mem.set_write_budget(Some(budget));
                    for t in q.drain(&mut mem.clone()).sent {
                        r.complete(t, true);
                    }
                }
                let rec = r.record(&guid).unwrap();
                prop_assert!(rec.hits_queued <= rec.hits_recv);
            }
        }
    }
}
