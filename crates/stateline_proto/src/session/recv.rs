use {tracing::trace, web_time::Instant};

use crate::header::Header;

use super::{Session, SessionEffect};

/// What [`Session::recv`] made of an incoming package.
#[derive(Debug, PartialEq, Eq)]
pub enum RecvOutcome {
    /// The package is new; its body should be processed.
    Fresh {
        /// Effects produced by resolving the package's acknowledgements.
        effects: Vec<SessionEffect>,
    },
    /// We have seen this sequence before; the body must be dropped, or its
    /// events would be handled twice.
    Duplicate,
}

impl Session {
    /// Feeds the header of a received package into the session's
    /// bookkeeping.
    ///
    /// On a fresh package this:
    /// 1. marks the sequence as received, to be echoed back in our outgoing
    ///    headers;
    /// 2. resolves which of *our* packages the peer has now acknowledged,
    ///    popping any reliable events they carried;
    /// 3. feeds round-trip samples into the latency estimate and
    ///    re-evaluates link quality.
    ///
    /// The caller must check for [`RecvOutcome::Duplicate`] before
    /// dispatching any events in the package body.
    pub fn recv(&mut self, now: Instant, header: &Header) -> RecvOutcome {
        if self.acks.is_acked(header.seq) {
            trace!("Dropping duplicate package {:?}", header.seq);
            return RecvOutcome::Duplicate;
        }
        self.acks.ack(header.seq);
        if self.first_recv_at.is_none() {
            self.first_recv_at = Some(now);
        }
        self.last_recv_at = Some(now);

        let mut effects = Vec::new();
        for seq in header.acks.seqs() {
            let sample = self
                .sent_at
                .remove(&seq)
                .map(|sent| now.saturating_duration_since(sent));
            if let Some(sample) = sample {
                self.record_rtt_sample(sample);
            }
            if let Some(pending) = self.pending.remove(&seq) {
                let rtt = sample.unwrap_or(self.latency);
                for event in pending {
                    effects.push(SessionEffect::EventAcked {
                        key: event.key,
                        rtt,
                    });
                }
            }
        }

        self.update_quality(now);
        RecvOutcome::Fresh { effects }
    }
}

#[cfg(test)]
mod tests {
    use {
        assert_matches::assert_matches,
        web_time::Duration,
        super::*,
        crate::{
            ack::Acknowledge,
            event::Event,
            seq::Seq,
            session::SessionConfig,
        },
    };

    fn peer_header(seq: Seq, acked: &[Seq]) -> Header {
        let mut acks = Acknowledge::new();
        for seq in acked {
            acks.ack(*seq);
        }
        Header { seq, acks }
    }

    #[test]
    fn duplicate_packages_are_dropped() {
        let now = Instant::now();
        let mut session = Session::new(now, SessionConfig::default());

        let header = peer_header(Seq(1), &[]);
        assert_matches!(session.recv(now, &header), RecvOutcome::Fresh { .. });
        assert_matches!(session.recv(now, &header), RecvOutcome::Duplicate);

        // an in-window replay of an older sequence is also a duplicate
        let newer = peer_header(Seq(3), &[]);
        assert_matches!(session.recv(now, &newer), RecvOutcome::Fresh { .. });
        assert_matches!(session.recv(now, &header), RecvOutcome::Duplicate);

        // but a not-yet-seen older sequence is fresh
        let gap = peer_header(Seq(2), &[]);
        assert_matches!(session.recv(now, &gap), RecvOutcome::Fresh { .. });
        assert_eq!(Seq(3), session.remote_seq());
    }

    #[test]
    fn acks_resolve_reliable_events() {
        let now = Instant::now();
        let mut session = Session::new(now, SessionConfig::default());

        let key = session
            .dispatch(Event::new("ATTACK"), 3, true)
            .unwrap();
        let flush = session.flush(now, 1024);
        assert_eq!(1, flush.events.len());

        let rtt = Duration::from_millis(40);
        let outcome = session.recv(now + rtt, &peer_header(Seq(1), &[flush.header.seq]));
        assert_matches!(
            outcome,
            RecvOutcome::Fresh { effects }
                if effects == vec![SessionEffect::EventAcked { key, rtt }]
        );
        assert_eq!(rtt, session.latency());

        // a redundant ack of the same package does nothing more
        let outcome = session.recv(
            now + rtt * 2,
            &peer_header(Seq(2), &[flush.header.seq]),
        );
        assert_matches!(outcome, RecvOutcome::Fresh { effects } if effects.is_empty());
    }

    #[test]
    fn unreliable_events_produce_no_effects() {
        let now = Instant::now();
        let mut session = Session::new(now, SessionConfig::default());

        session.dispatch(Event::new("PING"), 0, false).unwrap();
        let flush = session.flush(now, 1024);

        let outcome = session.recv(now, &peer_header(Seq(1), &[flush.header.seq]));
        assert_matches!(outcome, RecvOutcome::Fresh { effects } if effects.is_empty());
    }
}
