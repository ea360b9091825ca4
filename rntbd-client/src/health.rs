//! Connection health heuristics.
//!
//! TCP does not reliably report a peer that silently stopped answering, so
//! health is judged from send/receive timestamps first and a socket probe
//! last. The checker here is pure: callers pass a timestamp snapshot and the
//! current instant and act on the verdict.

use crate::config::TransitTimeoutConfig;
use crate::error::ClientError;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Data received this recently means healthy without further checks.
pub const RECENT_RECEIVE_WINDOW: Duration = Duration::from_secs(1);

/// A send must be stuck at least this long before it counts as hung.
pub const SEND_HANG_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Replies must be missing at least this long before they count as lost.
pub const RECEIVE_HANG_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Sends since the last receive that make the grace period apply from the first one.
pub const MIN_SENDS_SINCE_LAST_RECEIVE: u64 = 3;

/// Send and receive timestamps of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimestamps {
    pub last_send_attempt: Instant,
    pub last_send: Instant,
    pub last_receive: Instant,
    pub first_send_since_last_receive: Option<Instant>,
    pub sends_since_last_receive: u64,
}

impl ConnectionTimestamps {
    pub fn new(now: Instant) -> Self {
        Self {
            last_send_attempt: now,
            last_send: now,
            last_receive: now,
            first_send_since_last_receive: None,
            sends_since_last_receive: 0,
        }
    }

    pub fn record_send_attempt(&mut self, now: Instant) {
        self.last_send_attempt = now;
    }

    pub fn record_send(&mut self, now: Instant) {
        self.last_send = now;
        if self.first_send_since_last_receive.is_none() {
            self.first_send_since_last_receive = Some(now);
        }
        self.sends_since_last_receive += 1;
    }

    pub fn record_receive(&mut self, now: Instant) {
        self.last_receive = now;
        self.first_send_since_last_receive = None;
        self.sends_since_last_receive = 0;
    }

    /// Marks the connection as freshly established.
    pub fn record_connected(&mut self, now: Instant) {
        self.last_send = now;
        self.last_receive = now;
    }
}

/// Timeouts observed by callers since the last successful request.
#[derive(Debug, Default)]
pub struct TransitTimeouts {
    timeouts: AtomicU32,
    write_timeouts: AtomicU32,
}

impl TransitTimeouts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a request that completed (`completed`) or timed out.
    pub fn update(&self, completed: bool, read_only: bool) {
        if completed {
            self.timeouts.store(0, Ordering::Relaxed);
            self.write_timeouts.store(0, Ordering::Relaxed);
            return;
        }
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        if !read_only {
            self.write_timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns `(timeouts, write_timeouts)`.
    pub fn snapshot(&self) -> (u32, u32) {
        (
            self.timeouts.load(Ordering::Relaxed),
            self.write_timeouts.load(Ordering::Relaxed),
        )
    }
}

/// Why a connection was judged unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnhealthyReason {
    SendHang,
    ReceiveHang,
    TransitTimeouts,
    Idle,
    ProbeFailed,
}

/// Outcome of the timestamp checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    Unhealthy(UnhealthyReason),
    /// Timestamps are inconclusive; probe the socket.
    NeedsProbe,
}

/// Applies the timestamp heuristics of one connection.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    send_hang_limit: Duration,
    receive_hang_limit: Duration,
    idle_timeout: Option<Duration>,
    transit: TransitTimeoutConfig,
}

impl HealthChecker {
    pub fn new(
        send_hang_limit: Duration,
        receive_hang_limit: Duration,
        idle_timeout: Option<Duration>,
        transit: TransitTimeoutConfig,
    ) -> Result<Self, ClientError> {
        if receive_hang_limit <= RECEIVE_HANG_GRACE_PERIOD {
            return Err(ClientError::Config(format!(
                "receive hang limit must exceed {:?}, got {:?}",
                RECEIVE_HANG_GRACE_PERIOD, receive_hang_limit
            )));
        }
        if send_hang_limit <= SEND_HANG_GRACE_PERIOD {
            return Err(ClientError::Config(format!(
                "send hang limit must exceed {:?}, got {:?}",
                SEND_HANG_GRACE_PERIOD, send_hang_limit
            )));
        }
        Ok(Self {
            send_hang_limit,
            receive_hang_limit,
            idle_timeout,
            transit,
        })
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Time after going idle until the connection may be closed.
    ///
    /// The extra send and receive allowance covers a request admitted just as
    /// the connection was judged idle.
    pub fn idle_closure_timeout(&self) -> Option<Duration> {
        self.idle_timeout
            .map(|idle| idle + 2 * (self.send_hang_limit + self.receive_hang_limit))
    }

    pub fn check(
        &self,
        now: Instant,
        ts: &ConnectionTimestamps,
        transit_timeouts: (u32, u32),
    ) -> HealthVerdict {
        let since_receive = now.saturating_duration_since(ts.last_receive);
        if since_receive < RECENT_RECEIVE_WINDOW {
            return HealthVerdict::Healthy;
        }

        if ts.last_send_attempt.saturating_duration_since(ts.last_send) > self.send_hang_limit
            && now.saturating_duration_since(ts.last_send_attempt) > SEND_HANG_GRACE_PERIOD
        {
            return HealthVerdict::Unhealthy(UnhealthyReason::SendHang);
        }

        if ts.last_send.saturating_duration_since(ts.last_receive) > self.receive_hang_limit {
            let send_stale = now.saturating_duration_since(ts.last_send) > RECEIVE_HANG_GRACE_PERIOD;
            let many_unanswered = ts.sends_since_last_receive >= MIN_SENDS_SINCE_LAST_RECEIVE
                && ts.first_send_since_last_receive.is_some_and(|first| {
                    now.saturating_duration_since(first) > RECEIVE_HANG_GRACE_PERIOD
                });
            if send_stale || many_unanswered {
                return HealthVerdict::Unhealthy(UnhealthyReason::ReceiveHang);
            }
        }

        if self.transit.enabled && self.transit_timeouts_exceeded(since_receive, transit_timeouts) {
            return HealthVerdict::Unhealthy(UnhealthyReason::TransitTimeouts);
        }

        if let Some(idle) = self.idle_timeout {
            if since_receive > idle {
                return HealthVerdict::Unhealthy(UnhealthyReason::Idle);
            }
        }

        HealthVerdict::NeedsProbe
    }

    fn transit_timeouts_exceeded(&self, since_receive: Duration, counters: (u32, u32)) -> bool {
        let (timeouts, write_timeouts) = counters;
        if timeouts == 0 {
            return false;
        }
        since_receive >= self.transit.silence
            || (timeouts >= self.transit.frequent_count
                && since_receive >= self.transit.frequent_silence)
            || (write_timeouts >= 1 && since_receive >= self.transit.write_silence)
    }

    /// Whether data arrived within the idle window, and how long to wait
    /// before checking again (or, when idle, before closing).
    ///
    /// Always active when idle monitoring is disabled.
    pub fn is_active(&self, now: Instant, last_receive: Instant) -> (bool, Duration) {
        let (Some(idle), Some(closure)) = (self.idle_timeout, self.idle_closure_timeout()) else {
            return (true, Duration::MAX);
        };
        if now.saturating_duration_since(last_receive) > idle {
            (false, closure)
        } else {
            (true, (last_receive + closure).saturating_duration_since(now))
        }
    }
}
