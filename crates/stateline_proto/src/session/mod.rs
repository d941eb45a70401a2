//! See [`Session`].

mod recv;
mod send;

pub use {recv::*, send::*};

use {
    ahash::AHashMap,
    octs::{EncodeLen, FixedEncodeLen},
    std::collections::VecDeque,
    tracing::debug,
    web_time::{Duration, Instant},
};

use crate::{
    ack::Acknowledge,
    event::Event,
    header::Header,
    package::{MAX_DATAGRAM_LEN, SizeOverflow},
    seq::Seq,
};

/// Configuration for a [`Session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Largest datagram this session will produce, in bytes.
    pub max_datagram_len: usize,
    /// How long to wait for a dispatched event's carrying package to be
    /// acknowledged before retrying or giving up on it.
    ///
    /// The effective timeout is at least three times the current latency
    /// estimate, so a slow but healthy link does not burn retries.
    pub event_timeout: Duration,
    /// Latency above which the link is considered to be struggling.
    pub latency_threshold: Duration,
    /// How long latency must stay above [`SessionConfig::latency_threshold`]
    /// before the link is demoted to [`LinkQuality::Bad`].
    pub bad_hold: Duration,
    /// How long latency must stay below the threshold before a
    /// [`LinkQuality::Bad`] link is promoted back to [`LinkQuality::Good`].
    pub good_hold: Duration,
    /// Receive silence after which the peer is no longer considered
    /// [`ConnectionStatus::Connected`].
    pub idle_after: Duration,
    /// Receive silence after which the peer is considered gone and the
    /// connection must be closed.
    pub dead_after: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_datagram_len: MAX_DATAGRAM_LEN,
            event_timeout: Duration::from_secs(1),
            latency_threshold: Duration::from_millis(250),
            bad_hold: Duration::from_secs(1),
            good_hold: Duration::from_secs(10),
            idle_after: Duration::from_secs(5),
            dead_after: Duration::from_secs(15),
        }
    }
}

/// Coarse link-health classification which selects the sender tick rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkQuality {
    /// Latency is acceptable; send at the full tick rate.
    #[default]
    Good,
    /// Latency has been over the threshold for a while; back off hard.
    Bad,
}

/// How recently we have heard from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Nothing has ever arrived from the peer, or the peer has been silent
    /// for so long the connection is considered dead.
    Disconnected,
    /// The first package has arrived but a full round trip has not elapsed
    /// yet, or traffic has stalled for a while.
    Connecting,
    /// Traffic from the peer is flowing.
    Connected,
}

/// Stable identifier for a dispatched event.
///
/// Events have no identity on the wire - a retransmitted event travels under
/// a brand new package sequence - so the session hands out these keys to let
/// the caller associate acknowledgement and timeout outcomes with the
/// original [`Session::dispatch`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventKey(u64);

/// Something that happened inside a [`Session`] which its driver must act
/// on, usually by firing a user callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    /// A package carrying this event was acknowledged by the peer.
    EventAcked {
        /// Key of the dispatched event.
        key: EventKey,
        /// Round-trip time sample observed for the acknowledging package, or
        /// the current latency estimate if no sample was available.
        rtt: Duration,
    },
    /// This event's retry budget ran out without an acknowledgement.
    EventLost {
        /// Key of the dispatched event.
        key: EventKey,
    },
}

/// Sender tick interval while the link is [`LinkQuality::Good`] (40 Hz).
pub const GOOD_SEND_INTERVAL: Duration = Duration::from_millis(25);

/// Sender tick interval while the link is [`LinkQuality::Bad`] (5 Hz).
pub const BAD_SEND_INTERVAL: Duration = Duration::from_millis(200);

// dampened holds never grow beyond this multiple of their configured value
const MAX_HOLD_SCALE: u32 = 64;

// room reserved for the body framing around events when validating an event's
// size at dispatch time; covers the largest fixed body overhead
const BODY_OVERHEAD: usize = 16;

#[derive(Debug)]
struct QueuedEvent {
    key: EventKey,
    event: Event,
    retries: u8,
    reliable: bool,
}

#[derive(Debug)]
struct PendingEvent {
    key: EventKey,
    event: Event,
    retries: u8,
    deadline: Instant,
}

/// Per-peer transport state machine.
///
/// One session tracks one direction pair of a connection: which packages we
/// have sent and received, what the peer has acknowledged, how healthy the
/// link is, and which reliable events are still waiting for an
/// acknowledgement.
///
/// The session performs no IO and never looks at a clock: its driver feeds
/// it decoded [`Header`]s via [`Session::recv`], asks it for outgoing
/// packages via [`Session::flush`], and passes `now` into every call. This
/// keeps retry, latency and congestion behavior fully deterministic under
/// test.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    started_at: Instant,
    /// Sequence of the last package we sent.
    local_seq: Seq,
    /// What we have received from the peer; echoed in every outgoing header.
    acks: Acknowledge,
    /// Events waiting to be attached to an outgoing package.
    send_queue: VecDeque<QueuedEvent>,
    /// Reliable events in flight, keyed by the package sequence carrying
    /// them. Entries leave via [`Session::recv`] (acked) or
    /// [`Session::poll_timeouts`] (retried or lost).
    pending: AHashMap<Seq, Vec<PendingEvent>>,
    /// When each of our recent packages was sent, for RTT sampling.
    sent_at: AHashMap<Seq, Instant>,
    latency: Duration,
    quality: LinkQuality,
    over_since: Option<Instant>,
    under_since: Option<Instant>,
    /// Current (possibly dampened) demotion hold.
    bad_hold: Duration,
    /// Current (possibly dampened) promotion hold.
    good_hold: Duration,
    last_promotion_at: Option<Instant>,
    first_recv_at: Option<Instant>,
    last_recv_at: Option<Instant>,
    next_event_key: u64,
}

impl Session {
    /// Creates a session which starts counting liveness from `now`.
    #[must_use]
    pub fn new(now: Instant, config: SessionConfig) -> Self {
        let bad_hold = config.bad_hold;
        let good_hold = config.good_hold;
        Self {
            config,
            started_at: now,
            local_seq: Seq::NEVER,
            acks: Acknowledge::new(),
            send_queue: VecDeque::new(),
            pending: AHashMap::new(),
            sent_at: AHashMap::new(),
            latency: Duration::ZERO,
            quality: LinkQuality::Good,
            over_since: None,
            under_since: None,
            bad_hold,
            good_hold,
            last_promotion_at: None,
            first_recv_at: None,
            last_recv_at: None,
            next_event_key: 0,
        }
    }

    /// Gets the exponentially-weighted moving average of observed round-trip
    /// times.
    #[must_use]
    pub const fn latency(&self) -> Duration {
        self.latency
    }

    /// Gets the current link quality.
    #[must_use]
    pub const fn quality(&self) -> LinkQuality {
        self.quality
    }

    /// Gets the sequence of the last package sent.
    #[must_use]
    pub const fn local_seq(&self) -> Seq {
        self.local_seq
    }

    /// Gets the sequence of the newest package received.
    #[must_use]
    pub const fn remote_seq(&self) -> Seq {
        self.acks.last_recv
    }

    /// Gets the header this session would currently stamp onto an outgoing
    /// package with sequence `seq`.
    #[must_use]
    pub const fn header(&self, seq: Seq) -> Header {
        Header {
            seq,
            acks: self.acks,
        }
    }

    /// Gets the sender tick interval for the current link quality.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        match self.quality {
            LinkQuality::Good => GOOD_SEND_INTERVAL,
            LinkQuality::Bad => BAD_SEND_INTERVAL,
        }
    }

    /// Gets how alive the peer looks from here at time `now`.
    ///
    /// The status starts as [`ConnectionStatus::Disconnected`] and moves to
    /// [`ConnectionStatus::Connecting`] on the first successfully decoded
    /// package; it only counts as [`ConnectionStatus::Connected`] once a
    /// full round trip (per the current latency estimate) has elapsed since
    /// that first package. Receive silence degrades it back to
    /// [`ConnectionStatus::Connecting`] and eventually
    /// [`ConnectionStatus::Disconnected`].
    #[must_use]
    pub fn status(&self, now: Instant) -> ConnectionStatus {
        let (Some(first_recv_at), Some(last_recv_at)) = (self.first_recv_at, self.last_recv_at)
        else {
            // never heard from the peer at all
            return ConnectionStatus::Disconnected;
        };
        let silence = now.saturating_duration_since(last_recv_at);
        if silence >= self.config.dead_after {
            ConnectionStatus::Disconnected
        } else if silence >= self.config.idle_after {
            ConnectionStatus::Connecting
        } else if now.saturating_duration_since(first_recv_at) < self.latency {
            // the first package opens the connection, but it is only
            // established one round trip later
            ConnectionStatus::Connecting
        } else {
            ConnectionStatus::Connected
        }
    }

    /// Gets whether this connection must be closed because the peer has been
    /// silent for [`SessionConfig::dead_after`].
    ///
    /// Unlike [`Session::status`], a peer that has never sent anything at
    /// all counts its silence from the session's construction, so a
    /// connection that never comes up still gets torn down.
    #[must_use]
    pub fn is_dead(&self, now: Instant) -> bool {
        let last_sign_of_life = self.last_recv_at.unwrap_or(self.started_at);
        now.saturating_duration_since(last_sign_of_life) >= self.config.dead_after
    }

    /// Queues an event to be attached to the next outgoing package.
    ///
    /// `reliable` events are tracked until acknowledged: their driver will
    /// see [`SessionEffect::EventAcked`] or, after `retries` retransmissions
    /// all go unacknowledged, [`SessionEffect::EventLost`]. Unreliable events
    /// (`retries == 0`, nothing tracked) are fire-and-forget.
    ///
    /// # Errors
    ///
    /// Errors if the event could never fit into a datagram even on its own;
    /// the event is not queued and the session is unchanged.
    pub fn dispatch(
        &mut self,
        event: Event,
        retries: u8,
        reliable: bool,
    ) -> Result<EventKey, SizeOverflow> {
        let len = Header::ENCODE_LEN + BODY_OVERHEAD + event.encode_len();
        if len > self.config.max_datagram_len {
            return Err(SizeOverflow {
                len,
                max: self.config.max_datagram_len,
            });
        }

        let key = EventKey(self.next_event_key);
        self.next_event_key += 1;
        self.send_queue.push_back(QueuedEvent {
            key,
            event,
            retries,
            reliable,
        });
        Ok(key)
    }

    /// Re-evaluates link quality at time `now`, returning the new quality if
    /// it flipped.
    ///
    /// Latency must sit on the wrong side of the threshold for a full hold
    /// before the quality flips, and a demotion which follows shortly after
    /// a promotion doubles both holds (up to a cap), so an oscillating link
    /// settles into [`LinkQuality::Bad`] instead of thrashing. A full quiet
    /// hold without a flip relaxes the holds back toward their configured
    /// values.
    pub fn update_quality(&mut self, now: Instant) -> Option<LinkQuality> {
        if self.latency > self.config.latency_threshold {
            self.under_since = None;
            let since = *self.over_since.get_or_insert(now);
            if self.quality == LinkQuality::Good
                && now.saturating_duration_since(since) >= self.bad_hold
            {
                self.quality = LinkQuality::Bad;
                if self
                    .last_promotion_at
                    .is_some_and(|at| now.saturating_duration_since(at) < self.good_hold)
                {
                    self.bad_hold =
                        (self.bad_hold * 2).min(self.config.bad_hold * MAX_HOLD_SCALE);
                    self.good_hold =
                        (self.good_hold * 2).min(self.config.good_hold * MAX_HOLD_SCALE);
                    debug!(
                        "Link is flip-flopping, holds dampened to {:?}/{:?}",
                        self.bad_hold, self.good_hold
                    );
                }
                self.over_since = None;
                return Some(LinkQuality::Bad);
            }
        } else {
            self.over_since = None;
            let since = *self.under_since.get_or_insert(now);
            if now.saturating_duration_since(since) >= self.good_hold {
                self.under_since = Some(now);
                if self.quality == LinkQuality::Bad {
                    self.quality = LinkQuality::Good;
                    self.last_promotion_at = Some(now);
                    return Some(LinkQuality::Good);
                }
                // a full quiet hold; unwind any dampening
                self.bad_hold = (self.bad_hold / 2).max(self.config.bad_hold);
                self.good_hold = (self.good_hold / 2).max(self.config.good_hold);
            }
        }
        None
    }

    /// Gives up on every queued and in-flight reliable event, e.g. because
    /// the connection is closing.
    pub fn drain_pending(&mut self) -> Vec<SessionEffect> {
        let mut effects = self
            .pending
            .drain()
            .flat_map(|(_, events)| events)
            .map(|pending| SessionEffect::EventLost { key: pending.key })
            .collect::<Vec<_>>();
        effects.extend(
            self.send_queue
                .drain(..)
                .filter(|queued| queued.reliable)
                .map(|queued| SessionEffect::EventLost { key: queued.key }),
        );
        effects
    }

    fn effective_event_timeout(&self) -> Duration {
        self.config.event_timeout.max(self.latency * 3)
    }

    fn record_rtt_sample(&mut self, sample: Duration) {
        // the first sample seeds the estimate
        self.latency = if self.latency.is_zero() {
            sample
        } else {
            self.latency.mul_f64(0.9) + sample.mul_f64(0.1)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig::default()
    }

    /// Runs one send/ack round trip with the given RTT, returning the time
    /// after the ack.
    fn ack_round(session: &mut Session, peer_seq: &mut Seq, now: Instant, rtt: Duration) -> Instant {
        let flush = session.flush(now, 1024);
        *peer_seq = peer_seq.next();
        let mut acks = Acknowledge::new();
        acks.ack(flush.header.seq);
        let header = Header {
            seq: *peer_seq,
            acks,
        };
        let now = now + rtt;
        session.recv(now, &header);
        now
    }

    #[test]
    fn latency_is_smoothed() {
        let start = Instant::now();
        let mut session = Session::new(start, config());
        let mut peer_seq = Seq::NEVER;

        let now = ack_round(&mut session, &mut peer_seq, start, Duration::from_millis(100));
        assert_eq!(Duration::from_millis(100), session.latency());

        ack_round(&mut session, &mut peer_seq, now, Duration::from_millis(200));
        // 0.9 * 100ms + 0.1 * 200ms, modulo float rounding
        let smoothed = session.latency();
        assert!(
            smoothed > Duration::from_millis(109) && smoothed < Duration::from_millis(111),
            "{smoothed:?}"
        );
    }

    #[test]
    fn demotes_after_sustained_high_latency() {
        let start = Instant::now();
        let mut session = Session::new(start, config());
        let mut peer_seq = Seq::NEVER;

        assert_eq!(LinkQuality::Good, session.quality());
        assert_eq!(GOOD_SEND_INTERVAL, session.tick_interval());

        // high latency alone does not demote...
        let mut now = start;
        now = ack_round(&mut session, &mut peer_seq, now, Duration::from_millis(500));
        assert_eq!(None, session.update_quality(now));
        assert_eq!(LinkQuality::Good, session.quality());

        // ...until it has held for `bad_hold`
        now = ack_round(&mut session, &mut peer_seq, now, Duration::from_millis(500));
        now += Duration::from_millis(1100);
        assert_eq!(Some(LinkQuality::Bad), session.update_quality(now));
        assert_eq!(BAD_SEND_INTERVAL, session.tick_interval());
    }

    #[test]
    fn promotes_after_sustained_low_latency() {
        let start = Instant::now();
        let mut session = Session::new(start, config());
        let mut peer_seq = Seq::NEVER;

        // drive into Bad
        let mut now = start;
        for _ in 0..2 {
            now = ack_round(&mut session, &mut peer_seq, now, Duration::from_millis(500));
        }
        now += Duration::from_millis(1100);
        assert_eq!(Some(LinkQuality::Bad), session.update_quality(now));

        // bring the latency estimate back down
        for _ in 0..30 {
            now = ack_round(&mut session, &mut peer_seq, now, Duration::from_millis(10));
        }
        assert!(session.latency() < Duration::from_millis(250));

        // not promoted until the estimate has been good for `good_hold`
        assert_eq!(None, session.update_quality(now));
        now += Duration::from_secs(11);
        assert_eq!(Some(LinkQuality::Good), session.update_quality(now));
        assert_eq!(GOOD_SEND_INTERVAL, session.tick_interval());
    }

    #[test]
    fn oscillation_dampens_holds() {
        let start = Instant::now();
        let mut session = Session::new(start, config());
        let mut peer_seq = Seq::NEVER;
        let mut now = start;

        // Bad...
        for _ in 0..2 {
            now = ack_round(&mut session, &mut peer_seq, now, Duration::from_millis(500));
        }
        now += Duration::from_millis(1100);
        assert_eq!(Some(LinkQuality::Bad), session.update_quality(now));

        // ...Good again...
        for _ in 0..30 {
            now = ack_round(&mut session, &mut peer_seq, now, Duration::from_millis(10));
        }
        now += Duration::from_secs(11);
        assert_eq!(Some(LinkQuality::Good), session.update_quality(now));

        // ...and immediately Bad again: the demotion lands during the ack
        // rounds, and having flipped so soon after a promotion, doubles the
        // holds
        for _ in 0..30 {
            now = ack_round(&mut session, &mut peer_seq, now, Duration::from_millis(600));
        }
        session.update_quality(now + Duration::from_millis(2100));
        assert_eq!(LinkQuality::Bad, session.quality());
        assert_eq!(config().bad_hold * 2, session.bad_hold);
        assert_eq!(config().good_hold * 2, session.good_hold);
    }

    #[test]
    fn status_follows_receive_silence() {
        let start = Instant::now();
        let mut session = Session::new(start, config());
        let mut peer_seq = Seq::NEVER;

        // nothing has ever arrived
        assert_eq!(ConnectionStatus::Disconnected, session.status(start));

        // the first package opens the connection, but it only counts as
        // established one full round trip later
        let rtt = Duration::from_millis(50);
        let now = ack_round(&mut session, &mut peer_seq, start, rtt);
        assert_eq!(ConnectionStatus::Connecting, session.status(now));
        assert_eq!(ConnectionStatus::Connected, session.status(now + rtt));

        assert_eq!(
            ConnectionStatus::Connecting,
            session.status(now + Duration::from_secs(6))
        );
        assert_eq!(
            ConnectionStatus::Disconnected,
            session.status(now + Duration::from_secs(16))
        );
    }

    #[test]
    fn never_heard_from_peer_eventually_dies() {
        let start = Instant::now();
        let session = Session::new(start, config());

        // disconnected from the start, but not yet worth tearing down
        assert_eq!(ConnectionStatus::Disconnected, session.status(start));
        assert!(!session.is_dead(start));
        assert!(!session.is_dead(start + Duration::from_secs(14)));

        assert!(session.is_dead(start + Duration::from_secs(16)));
    }

    #[test]
    fn oversize_event_is_rejected_at_dispatch() {
        let start = Instant::now();
        let mut session = Session::new(start, config());
        let event = Event::new("big").with_arg("x".repeat(3000));
        assert!(session.dispatch(event, 0, false).is_err());
        assert!(session.flush(start, 1024).events.is_empty());
    }
}
