use {octs::EncodeLen, std::collections::VecDeque, web_time::Instant};

use crate::{event::Event, header::Header};

use super::{PendingEvent, QueuedEvent, Session, SessionEffect};

/// One outgoing package assembled by [`Session::flush`].
#[derive(Debug, Clone, PartialEq)]
pub struct Flush {
    /// Header to stamp onto the datagram.
    pub header: Header,
    /// Events to attach to the body.
    pub events: Vec<Event>,
}

impl Session {
    /// Assembles the next outgoing package at time `now`.
    ///
    /// Every call consumes a fresh sequence number, even if no events are
    /// attached - a package with an empty body still carries fresh
    /// acknowledgements and keeps the connection alive.
    ///
    /// Queued events are packed greedily into `events_budget` encoded bytes;
    /// events which do not fit stay queued for the next package. Reliable
    /// events are remembered under the new sequence until acknowledged or
    /// timed out.
    pub fn flush(&mut self, now: Instant, events_budget: usize) -> Flush {
        self.local_seq = self.local_seq.next();
        let seq = self.local_seq;

        let mut events = Vec::new();
        let mut used = 0_usize;
        let mut deferred = VecDeque::new();
        while let Some(queued) = self.send_queue.pop_front() {
            let len = queued.event.encode_len();
            if used + len > events_budget {
                deferred.push_back(queued);
                continue;
            }
            used += len;
            if queued.reliable {
                let deadline = now + self.effective_event_timeout();
                self.pending.entry(seq).or_default().push(PendingEvent {
                    key: queued.key,
                    event: queued.event.clone(),
                    retries: queued.retries,
                    deadline,
                });
            }
            events.push(queued.event);
        }
        self.send_queue = deferred;

        self.sent_at.insert(seq, now);
        Flush {
            header: self.header(seq),
            events,
        }
    }

    /// Sweeps in-flight reliable events whose acknowledgement deadline has
    /// passed.
    ///
    /// A timed-out event with retries left is re-queued and will travel
    /// under a new sequence on the next [`Session::flush`]; one with no
    /// retries left produces [`SessionEffect::EventLost`].
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        let mut requeue = Vec::new();
        self.pending.retain(|_, events| {
            events.retain_mut(|pending| {
                if now < pending.deadline {
                    return true;
                }
                if pending.retries > 0 {
                    requeue.push((pending.key, pending.event.clone(), pending.retries - 1));
                } else {
                    effects.push(SessionEffect::EventLost { key: pending.key });
                }
                false
            });
            !events.is_empty()
        });
        for (key, event, retries) in requeue {
            self.send_queue.push_back(QueuedEvent {
                key,
                event,
                retries,
                reliable: true,
            });
        }

        // forget send times for packages we will clearly never see acked
        let horizon = self.config.event_timeout * 2;
        self.sent_at
            .retain(|_, sent| now.saturating_duration_since(*sent) < horizon);

        effects
    }
}
