//! Ping/pong lag sampling.
//!
//! The connection loop calls [`LagMonitor::tick`] on every interval and
//! feeds matching PONG tokens to [`LagMonitor::on_pong`]. The monitor keeps
//! the last [`MAX_SAMPLES`] round trips and classifies the newest one.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Number of round-trip samples retained.
pub const MAX_SAMPLES: usize = 20;

/// Prefix of ping tokens we generate; anything else is not ours.
pub const TOKEN_PREFIX: &str = "skein-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LagMethod {
    /// `PING :<token>` answered by the server's `PONG`.
    #[default]
    Server,
    /// CTCP PING to our own nick, answered by our own CTCP reply.
    Ctcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LagConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub method: LagMethod,
    pub warning_threshold_ms: u64,
    pub timeout_threshold_ms: u64,
    /// No inbound traffic for this long drops the connection.
    pub idle_timeout_secs: u64,
}

impl Default for LagConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            method: LagMethod::Server,
            warning_threshold_ms: 1_000,
            timeout_threshold_ms: 10_000,
            idle_timeout_secs: 240,
        }
    }
}

impl LagConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LagStatus {
    Good,
    Warning,
    Timeout,
}

/// Classify a round trip against the configured thresholds.
pub fn classify(rtt_ms: u64, warning_ms: u64, timeout_ms: u64) -> LagStatus {
    if rtt_ms >= timeout_ms {
        LagStatus::Timeout
    } else if rtt_ms >= warning_ms {
        LagStatus::Warning
    } else {
        LagStatus::Good
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LagReport {
    pub lag_ms: u64,
    pub status: LagStatus,
    pub average_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub samples: usize,
}

/// Result of one timer tick.
#[derive(Debug, Default)]
pub struct Tick {
    /// Ping line to write, if one is due.
    pub line: Option<String>,
    /// Set when the previous ping went unanswered past the timeout.
    pub timed_out: Option<LagReport>,
}

pub struct LagMonitor {
    config: LagConfig,
    samples: VecDeque<u64>,
    outstanding: Option<u64>,
}

impl LagMonitor {
    pub fn new(config: LagConfig) -> Self {
        Self {
            config,
            samples: VecDeque::with_capacity(MAX_SAMPLES),
            outstanding: None,
        }
    }

    pub fn config(&self) -> &LagConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Forget all samples and any outstanding ping.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.outstanding = None;
    }

    /// Build a ping for `now_ms`, unless one is still in flight and has not
    /// timed out yet.
    pub fn tick(&mut self, now_ms: u64, self_nick: &str) -> Tick {
        let mut tick = Tick::default();
        if let Some(sent) = self.outstanding {
            let waited = now_ms.saturating_sub(sent);
            if waited < self.config.timeout_threshold_ms {
                return tick;
            }
            tick.timed_out = Some(self.report(waited, LagStatus::Timeout));
        }
        self.outstanding = Some(now_ms);
        let token = format!("{TOKEN_PREFIX}{now_ms}");
        tick.line = Some(match self.config.method {
            LagMethod::Server => format!("PING :{token}"),
            LagMethod::Ctcp => format!("PRIVMSG {self_nick} :\x01PING {token}\x01"),
        });
        tick
    }

    /// Handle a PONG (or CTCP PING reply) payload. Returns `None` unless the
    /// token answers the outstanding ping; late or duplicate answers are
    /// ignored.
    pub fn on_pong(&mut self, token: &str, now_ms: u64) -> Option<LagReport> {
        let sent: u64 = token.trim().strip_prefix(TOKEN_PREFIX)?.parse().ok()?;
        if sent > now_ms || self.outstanding != Some(sent) {
            return None;
        }
        self.outstanding = None;
        let rtt = now_ms - sent;
        if self.samples.len() == MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt);
        let status = classify(
            rtt,
            self.config.warning_threshold_ms,
            self.config.timeout_threshold_ms,
        );
        Some(self.report(rtt, status))
    }

    pub fn samples(&self) -> impl Iterator<Item = u64> + '_ {
        self.samples.iter().copied()
    }

    fn report(&self, lag_ms: u64, status: LagStatus) -> LagReport {
        let n = self.samples.len();
        let (sum, min, max) = self
            .samples
            .iter()
            .fold((0u64, u64::MAX, 0u64), |(s, lo, hi), &v| {
                (s + v, lo.min(v), hi.max(v))
            });
        LagReport {
            lag_ms,
            status,
            average_ms: if n == 0 { 0 } else { sum / n as u64 },
            min_ms: if n == 0 { 0 } else { min },
            max_ms: max,
            samples: n,
        }
    }
}

/// Wall-clock milliseconds used in ping tokens.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_thresholds() {
        assert_eq!(classify(500, 1000, 10_000), LagStatus::Good);
        assert_eq!(classify(1500, 1000, 10_000), LagStatus::Warning);
        assert_eq!(classify(12_000, 1000, 10_000), LagStatus::Timeout);
        assert_eq!(classify(1000, 1000, 10_000), LagStatus::Warning);
        assert_eq!(classify(10_000, 1000, 10_000), LagStatus::Timeout);
    }

    #[test]
    fn server_ping_round_trip() {
        let mut lag = LagMonitor::new(LagConfig::default());
        let tick = lag.tick(1_000, "me");
        assert_eq!(tick.line.as_deref(), Some("PING :skein-1000"));
        let report = lag.on_pong("skein-1000", 1_250).unwrap();
        assert_eq!(report.lag_ms, 250);
        assert_eq!(report.status, LagStatus::Good);
        assert_eq!(report.samples, 1);
    }

    #[test]
    fn ctcp_ping_targets_own_nick() {
        let mut lag = LagMonitor::new(LagConfig {
            method: LagMethod::Ctcp,
            ..LagConfig::default()
        });
        let tick = lag.tick(42, "me");
        assert_eq!(tick.line.as_deref(), Some("PRIVMSG me :\x01PING skein-42\x01"));
    }

    #[test]
    fn foreign_tokens_ignored() {
        let mut lag = LagMonitor::new(LagConfig::default());
        assert!(lag.on_pong("keepalive", 10).is_none());
        assert!(lag.on_pong("skein-abc", 10).is_none());
        assert!(lag.on_pong("skein-99", 10).is_none());
        lag.tick(5, "me");
        assert!(lag.on_pong("skein-5", 20).is_some());
        // Duplicate answer (echo-message) is not sampled twice.
        assert!(lag.on_pong("skein-5", 25).is_none());
        assert_eq!(lag.samples().count(), 1);
    }

    #[test]
    fn keeps_last_twenty_samples() {
        let mut lag = LagMonitor::new(LagConfig::default());
        for i in 0..25u64 {
            lag.tick(i * 1000, "me");
            lag.on_pong(&format!("skein-{}", i * 1000), i * 1000 + i);
        }
        let samples: Vec<u64> = lag.samples().collect();
        assert_eq!(samples.len(), MAX_SAMPLES);
        assert_eq!(samples[0], 5);
        lag.tick(100_000, "me");
        let report = lag.on_pong("skein-100000", 100_030).unwrap();
        assert_eq!(report.samples, MAX_SAMPLES);
        assert_eq!(report.max_ms, 30);
        assert_eq!(report.min_ms, 6);
    }

    #[test]
    fn unanswered_ping_times_out() {
        let mut lag = LagMonitor::new(LagConfig::default());
        assert!(lag.tick(0, "me").line.is_some());
        // Still waiting, below the timeout: nothing new is sent.
        let t = lag.tick(5_000, "me");
        assert!(t.line.is_none() && t.timed_out.is_none());
        let t = lag.tick(12_000, "me");
        let report = t.timed_out.unwrap();
        assert_eq!(report.status, LagStatus::Timeout);
        assert_eq!(report.lag_ms, 12_000);
        assert_eq!(t.line.as_deref(), Some("PING :skein-12000"));
    }

    #[test]
    fn reset_clears_state() {
        let mut lag = LagMonitor::new(LagConfig::default());
        lag.tick(0, "me");
        lag.on_pong("skein-0", 10);
        lag.reset();
        assert_eq!(lag.samples().count(), 0);
        assert!(lag.tick(1, "me").line.is_some());
    }
}
