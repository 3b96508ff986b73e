//! Outbound flow control for one connection.
//!
//! Two gates guard every send:
//!
//! - **Rate limit** (hard): at most `messages_per_second` in the trailing
//!   second and at most `burst_limit` in the trailing `burst_window`.
//!   Rejections are returned to the caller as [`SendError::RateLimited`].
//! - **Flood protection** (soft): at most `flood_max_messages` in the
//!   trailing `flood_window`. Sends over that budget are parked in a FIFO
//!   retry queue and re-evaluated after `flood_penalty`.
//!
//! The controller is driven by explicit `now` instants so the connection
//! loop owns all timers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::SendError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub rate_limit_enabled: bool,
    pub messages_per_second: u32,
    pub burst_window_ms: u64,
    pub burst_limit: u32,
    pub flood_protection_enabled: bool,
    pub flood_window_ms: u64,
    pub flood_max_messages: u32,
    pub flood_penalty_ms: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            rate_limit_enabled: true,
            messages_per_second: 5,
            burst_window_ms: 10_000,
            burst_limit: 20,
            flood_protection_enabled: true,
            flood_window_ms: 5_000,
            flood_max_messages: 10,
            flood_penalty_ms: 1_000,
        }
    }
}

impl FlowConfig {
    pub fn burst_window(&self) -> Duration {
        Duration::from_millis(self.burst_window_ms)
    }

    pub fn flood_window(&self) -> Duration {
        Duration::from_millis(self.flood_window_ms)
    }

    pub fn flood_penalty(&self) -> Duration {
        Duration::from_millis(self.flood_penalty_ms)
    }

    fn history_span(&self) -> Duration {
        Duration::from_secs(1)
            .max(self.burst_window())
            .max(self.flood_window())
    }
}

/// Externally visible counters. Reset on every (re)connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub rejected: u64,
    pub delayed: u64,
    pub connected_at: DateTime<Utc>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl FlowStats {
    fn new() -> Self {
        Self {
            messages_sent: 0,
            bytes_sent: 0,
            messages_received: 0,
            bytes_received: 0,
            rejected: 0,
            delayed: 0,
            connected_at: Utc::now(),
            last_activity: None,
        }
    }
}

/// Completion channel for a caller awaiting its send.
pub type Reply = Option<oneshot::Sender<Result<(), SendError>>>;

/// A send that cleared both gates and may be written now.
#[derive(Debug)]
pub struct Ready {
    pub line: String,
    pub reply: Reply,
}

impl Ready {
    /// Report the write outcome to the caller, if any is waiting.
    pub fn complete(self, result: Result<(), SendError>) {
        if let Some(tx) = self.reply {
            let _ = tx.send(result);
        }
    }
}

#[derive(Debug)]
struct Parked {
    line: String,
    reply: Reply,
    ready_at: Instant,
}

enum Gate {
    Pass,
    Delay,
    Reject(SendError),
}

/// Per-connection flow state.
pub struct FlowController {
    config: FlowConfig,
    sent: VecDeque<Instant>,
    parked: VecDeque<Parked>,
    stats: Arc<Mutex<FlowStats>>,
}

impl FlowController {
    pub fn new(config: FlowConfig) -> Self {
        Self {
            config,
            sent: VecDeque::new(),
            parked: VecDeque::new(),
            stats: Arc::new(Mutex::new(FlowStats::new())),
        }
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Shared handle to the statistics, readable from other tasks.
    pub fn stats_handle(&self) -> Arc<Mutex<FlowStats>> {
        Arc::clone(&self.stats)
    }

    pub fn stats(&self) -> FlowStats {
        self.stats.lock().clone()
    }

    /// Clear windows and statistics for a fresh connection.
    pub fn reset(&mut self) {
        self.sent.clear();
        *self.stats.lock() = FlowStats::new();
    }

    /// Submit a line. Returns it back when it may be written immediately;
    /// otherwise it was parked (flood) or rejected (rate limit, reply
    /// already sent).
    pub fn submit(&mut self, now: Instant, line: String, reply: Reply) -> Option<Ready> {
        if !self.parked.is_empty() {
            // Keep FIFO order behind already-parked sends.
            if let Some(err) = self.rate_check(now) {
                self.reject(reply, err);
                return None;
            }
            self.stats.lock().delayed += 1;
            self.parked.push_back(Parked {
                line,
                reply,
                ready_at: now,
            });
            return None;
        }

        match self.evaluate(now) {
            Gate::Pass => {
                self.record_send(now, &line);
                Some(Ready { line, reply })
            }
            Gate::Delay => {
                tracing::debug!(
                    penalty_ms = self.config.flood_penalty_ms,
                    "Flood window full, delaying send"
                );
                self.stats.lock().delayed += 1;
                self.parked.push_back(Parked {
                    line,
                    reply,
                    ready_at: now + self.config.flood_penalty(),
                });
                None
            }
            Gate::Reject(err) => {
                self.reject(reply, err);
                None
            }
        }
    }

    /// When the head of the retry queue should be re-evaluated.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.parked.front().map(|p| p.ready_at)
    }

    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    /// Release every parked send that clears the gates at `now`, in order.
    pub fn poll_retries(&mut self, now: Instant) -> Vec<Ready> {
        let mut out = Vec::new();
        while let Some(head) = self.parked.front() {
            if head.ready_at > now {
                break;
            }
            match self.evaluate(now) {
                Gate::Pass => {
                    if let Some(p) = self.parked.pop_front() {
                        self.record_send(now, &p.line);
                        out.push(Ready {
                            line: p.line,
                            reply: p.reply,
                        });
                    }
                }
                Gate::Delay => {
                    let penalty = self.config.flood_penalty();
                    if let Some(head) = self.parked.front_mut() {
                        head.ready_at = now + penalty;
                    }
                    break;
                }
                Gate::Reject(err) => {
                    if let Some(p) = self.parked.pop_front() {
                        self.reject(p.reply, err);
                    }
                }
            }
        }
        out
    }

    /// Fail every parked send with `err`.
    pub fn drain(&mut self, err: SendError) {
        let n = self.parked.len();
        for p in self.parked.drain(..) {
            if let Some(tx) = p.reply {
                let _ = tx.send(Err(err.clone()));
            }
        }
        if n > 0 {
            tracing::debug!(count = n, error = %err, "Drained parked sends");
        }
    }

    /// Account for an inbound line.
    pub fn record_inbound(&self, bytes: usize) {
        let mut stats = self.stats.lock();
        stats.messages_received += 1;
        stats.bytes_received += bytes as u64;
        stats.last_activity = Some(Utc::now());
    }

    /// Account for a line written outside the gates (PONG, lag PING, QUIT).
    /// It shows up in the stats but takes nothing from the send windows.
    pub fn record_bypass(&self, line: &str) {
        self.count_sent(line);
    }

    fn evaluate(&mut self, now: Instant) -> Gate {
        self.prune(now);
        if let Some(err) = self.rate_check(now) {
            return Gate::Reject(err);
        }
        if self.config.flood_protection_enabled
            && self.count_within(now, self.config.flood_window())
                >= self.config.flood_max_messages as usize
        {
            return Gate::Delay;
        }
        Gate::Pass
    }

    fn rate_check(&self, now: Instant) -> Option<SendError> {
        if !self.config.rate_limit_enabled {
            return None;
        }
        let per_second = self.count_within(now, Duration::from_secs(1));
        if per_second >= self.config.messages_per_second as usize {
            return Some(SendError::RateLimited {
                sent: per_second,
                window_ms: 1_000,
            });
        }
        let burst = self.count_within(now, self.config.burst_window());
        if burst >= self.config.burst_limit as usize {
            return Some(SendError::RateLimited {
                sent: burst,
                window_ms: self.config.burst_window_ms,
            });
        }
        None
    }

    fn count_within(&self, now: Instant, window: Duration) -> usize {
        self.sent
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < window)
            .count()
    }

    fn prune(&mut self, now: Instant) {
        let span = self.config.history_span();
        while let Some(t) = self.sent.front() {
            if now.saturating_duration_since(*t) >= span {
                self.sent.pop_front();
            } else {
                break;
            }
        }
    }

    fn record_send(&mut self, now: Instant, line: &str) {
        self.sent.push_back(now);
        self.count_sent(line);
    }

    fn count_sent(&self, line: &str) {
        let mut stats = self.stats.lock();
        stats.messages_sent += 1;
        stats.bytes_sent += line.len() as u64 + 2;
        stats.last_activity = Some(Utc::now());
    }

    fn reject(&mut self, reply: Reply, err: SendError) {
        tracing::warn!(error = %err, "Send rejected");
        self.stats.lock().rejected += 1;
        if let Some(tx) = reply {
            let _ = tx.send(Err(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FlowConfig {
        FlowConfig {
            messages_per_second: 3,
            burst_window_ms: 10_000,
            burst_limit: 8,
            flood_window_ms: 4_000,
            flood_max_messages: 5,
            flood_penalty_ms: 500,
            ..FlowConfig::default()
        }
    }

    fn send(flow: &mut FlowController, now: Instant, line: &str) -> (Option<Ready>, oneshot::Receiver<Result<(), SendError>>) {
        let (tx, rx) = oneshot::channel();
        (flow.submit(now, line.to_string(), Some(tx)), rx)
    }

    #[test]
    fn per_second_limit_rejects_excess() {
        let mut flow = FlowController::new(config());
        let now = Instant::now();
        for i in 0..3 {
            let (ready, _) = send(&mut flow, now, &format!("PRIVMSG #c :{i}"));
            assert!(ready.is_some(), "send {i} should pass");
        }
        let (ready, mut rx) = send(&mut flow, now, "PRIVMSG #c :4");
        assert!(ready.is_none());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(SendError::RateLimited { sent: 3, window_ms: 1000 })
        ));
        assert_eq!(flow.stats().rejected, 1);
        assert_eq!(flow.stats().messages_sent, 3);
    }

    #[test]
    fn window_slides() {
        let mut flow = FlowController::new(config());
        let t0 = Instant::now();
        for _ in 0..3 {
            assert!(flow.submit(t0, "PING".into(), None).is_some());
        }
        assert!(flow.submit(t0 + Duration::from_millis(999), "PING".into(), None).is_none());
        assert!(flow.submit(t0 + Duration::from_millis(1000), "PING".into(), None).is_some());
    }

    #[test]
    fn flood_window_parks_then_releases() {
        let mut flow = FlowController::new(FlowConfig {
            rate_limit_enabled: false,
            ..config()
        });
        let t0 = Instant::now();
        for i in 0..5 {
            assert!(flow.submit(t0, format!("m{i}"), None).is_some());
        }
        let (ready, mut rx) = send(&mut flow, t0, "m5");
        assert!(ready.is_none());
        assert!(rx.try_recv().is_err(), "parked sends are not failed");
        assert_eq!(flow.next_retry_at(), Some(t0 + Duration::from_millis(500)));

        // Window still full at the first retry: pushed back by the penalty.
        assert!(flow.poll_retries(t0 + Duration::from_millis(500)).is_empty());
        assert_eq!(flow.next_retry_at(), Some(t0 + Duration::from_millis(1000)));

        let released = flow.poll_retries(t0 + Duration::from_millis(4000));
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].line, "m5");
        assert_eq!(flow.parked_len(), 0);
    }

    #[test]
    fn parked_sends_keep_order() {
        let mut flow = FlowController::new(FlowConfig {
            rate_limit_enabled: false,
            ..config()
        });
        let t0 = Instant::now();
        for i in 0..5 {
            flow.submit(t0, format!("m{i}"), None);
        }
        assert!(flow.submit(t0, "a".into(), None).is_none());
        assert!(flow.submit(t0, "b".into(), None).is_none());
        let released = flow.poll_retries(t0 + Duration::from_secs(5));
        let lines: Vec<_> = released.iter().map(|r| r.line.as_str()).collect();
        assert_eq!(lines, vec!["a", "b"]);
    }

    #[test]
    fn rate_limit_wins_over_flood() {
        let mut flow = FlowController::new(FlowConfig {
            messages_per_second: 2,
            flood_max_messages: 2,
            ..config()
        });
        let t0 = Instant::now();
        flow.submit(t0, "a".into(), None);
        flow.submit(t0, "b".into(), None);
        let (ready, mut rx) = send(&mut flow, t0, "c");
        assert!(ready.is_none());
        assert!(matches!(rx.try_recv().unwrap(), Err(SendError::RateLimited { .. })));
        assert_eq!(flow.parked_len(), 0);
    }

    #[test]
    fn burst_window_limit() {
        let mut flow = FlowController::new(FlowConfig {
            flood_protection_enabled: false,
            ..config()
        });
        let t0 = Instant::now();
        let mut passed = 0;
        for s in 0..4 {
            let at = t0 + Duration::from_secs(s);
            for _ in 0..3 {
                if flow.submit(at, "x".into(), None).is_some() {
                    passed += 1;
                }
            }
        }
        assert_eq!(passed, 8);
    }

    #[test]
    fn drain_fails_parked_with_connection_closed() {
        let mut flow = FlowController::new(FlowConfig {
            rate_limit_enabled: false,
            ..config()
        });
        let t0 = Instant::now();
        for i in 0..5 {
            flow.submit(t0, format!("m{i}"), None);
        }
        let (_, mut rx) = send(&mut flow, t0, "late");
        flow.drain(SendError::ConnectionClosed);
        assert_eq!(rx.try_recv().unwrap(), Err(SendError::ConnectionClosed));
        assert_eq!(flow.next_retry_at(), None);
    }

    #[test]
    fn stats_count_bytes_and_reset() {
        let mut flow = FlowController::new(FlowConfig::default());
        let now = Instant::now();
        flow.submit(now, "JOIN #a".into(), None);
        flow.record_inbound(40);
        let stats = flow.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.bytes_sent, 9);
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.bytes_received, 40);
        assert!(stats.last_activity.is_some());
        flow.reset();
        assert_eq!(flow.stats().messages_sent, 0);
    }

    #[test]
    fn bypass_lines_leave_the_budget_alone() {
        let mut flow = FlowController::new(config());
        let now = Instant::now();
        for _ in 0..5 {
            flow.record_bypass("PONG :irc.test");
        }
        for i in 0..3 {
            let (ready, _) = send(&mut flow, now, &format!("PRIVMSG #c :{i}"));
            assert!(ready.is_some(), "send {i} should pass after keepalives");
        }
        let stats = flow.stats();
        assert_eq!(stats.messages_sent, 8);
        assert_eq!(stats.rejected, 0);
    }
}
