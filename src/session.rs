//! Recording session continuity
//!
//! A session is an ordered log of start/pause/resume/stop events. `start`
//! and `resume` open an active interval that the next `pause` or `stop`
//! closes; a `pause` (or a `stop` that is later resumed) opens a paused
//! interval that the next `resume` closes.
//!
//! ```rust
//! use thermo_modbus::session::{compute_durations, SessionAction, SessionTracker};
//!
//! let mut tracker = SessionTracker::new();
//! tracker.record(0, SessionAction::Start, "recording started").unwrap();
//! tracker.record(10_000, SessionAction::Pause, "sensor swap").unwrap();
//! tracker.record(15_000, SessionAction::Resume, "sensor swap done").unwrap();
//! tracker.record(25_000, SessionAction::Stop, "finished").unwrap();
//!
//! let durations = compute_durations(tracker.events(), 30_000);
//! assert_eq!(durations.total_active_ms, 20_000);
//! assert_eq!(durations.total_pause_ms, 5_000);
//! ```

use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{ThermoError, ThermoResult};
use crate::utils::format::{format_millis, format_timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionAction {
    Start,
    Pause,
    Resume,
    Stop,
}

impl SessionAction {
    /// True for actions that open an active interval
    pub fn is_opening(self) -> bool {
        matches!(self, SessionAction::Start | SessionAction::Resume)
    }
}

impl fmt::Display for SessionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionAction::Start => "start",
            SessionAction::Pause => "pause",
            SessionAction::Resume => "resume",
            SessionAction::Stop => "stop",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub action: SessionAction,
    pub reason: String,
}

/// One paused stretch of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseInterval {
    pub paused_at: i64,
    /// `None` while the pause is still open
    pub resumed_at: Option<i64>,
    pub duration_ms: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDurations {
    pub total_active_ms: i64,
    pub total_pause_ms: i64,
    pub pause_events: Vec<PauseInterval>,
}

impl SessionDurations {
    pub fn total_active(&self) -> Duration {
        Duration::from_millis(self.total_active_ms.max(0) as u64)
    }

    pub fn total_pause(&self) -> Duration {
        Duration::from_millis(self.total_pause_ms.max(0) as u64)
    }
}

/// Walk `events` in order and sum active and paused time
///
/// An active interval still open at the end of the log is closed at `now`,
/// as is a trailing pause. A trailing `stop` closes the session. Negative
/// spans (out-of-order clocks) count as zero.
pub fn compute_durations(events: &[SessionEvent], now: i64) -> SessionDurations {
    let mut durations = SessionDurations::default();
    let mut active_since: Option<i64> = None;
    let mut paused: Option<(i64, String, SessionAction)> = None;

    for event in events {
        match event.action {
            SessionAction::Start | SessionAction::Resume => {
                if let Some((paused_at, reason, _)) = paused.take() {
                    let duration_ms = (event.timestamp - paused_at).max(0);
                    durations.total_pause_ms += duration_ms;
                    durations.pause_events.push(PauseInterval {
                        paused_at,
                        resumed_at: Some(event.timestamp),
                        duration_ms,
                        reason,
                    });
                }
                if active_since.is_none() {
                    active_since = Some(event.timestamp);
                }
            }
            SessionAction::Pause | SessionAction::Stop => {
                if let Some(since) = active_since.take() {
                    durations.total_active_ms += (event.timestamp - since).max(0);
                }
                if paused.is_none() {
                    paused = Some((event.timestamp, event.reason.clone(), event.action));
                }
            }
        }
    }

    if let Some(since) = active_since {
        durations.total_active_ms += (now - since).max(0);
    }
    if let Some((paused_at, reason, SessionAction::Pause)) = paused {
        let duration_ms = (now - paused_at).max(0);
        durations.total_pause_ms += duration_ms;
        durations.pause_events.push(PauseInterval {
            paused_at,
            resumed_at: None,
            duration_ms,
            reason,
        });
    }

    durations
}

/// Append-only log of session events with transition checking
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionTracker {
    events: Vec<SessionEvent>,
    /// Acquisition end while the log still ends in a pause
    closed_at: Option<i64>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a tracker from a stored log, checking every transition
    pub fn from_events(events: Vec<SessionEvent>) -> ThermoResult<Self> {
        let mut tracker = Self::new();
        for event in events {
            tracker.record(event.timestamp, event.action, event.reason)?;
        }
        Ok(tracker)
    }

    pub fn events(&self) -> &[SessionEvent] {
        &self.events
    }

    pub fn last_action(&self) -> Option<SessionAction> {
        self.events.last().map(|event| event.action)
    }

    /// True between a start/resume and the following pause/stop
    pub fn is_active(&self) -> bool {
        self.last_action().map_or(false, SessionAction::is_opening)
    }

    pub fn is_paused(&self) -> bool {
        self.last_action() == Some(SessionAction::Pause)
    }

    /// Whether `action` may follow the current last event
    pub fn can_record(&self, action: SessionAction) -> bool {
        let last = self.last_action();
        match action {
            SessionAction::Start => matches!(last, None | Some(SessionAction::Stop)),
            SessionAction::Pause | SessionAction::Stop => last.map_or(false, SessionAction::is_opening),
            SessionAction::Resume => {
                matches!(last, Some(SessionAction::Pause) | Some(SessionAction::Stop))
            }
        }
    }

    /// Append an event, rejecting illegal transitions and timestamps that
    /// go backwards
    pub fn record<S: Into<String>>(
        &mut self,
        timestamp: i64,
        action: SessionAction,
        reason: S,
    ) -> ThermoResult<()> {
        if !self.can_record(action) {
            return Err(ThermoError::session(format!(
                "cannot {} after {}",
                action,
                self.last_action()
                    .map_or_else(|| "an empty session".to_string(), |last| last.to_string())
            )));
        }
        if let Some(last) = self.events.last() {
            if timestamp < last.timestamp {
                return Err(ThermoError::session(format!(
                    "event at {} precedes last event at {}",
                    timestamp, last.timestamp
                )));
            }
        }

        let reason = reason.into();
        debug!("Session {} at {}: {}", action, timestamp, reason);
        self.closed_at = None;
        self.events.push(SessionEvent {
            timestamp,
            action,
            reason,
        });
        Ok(())
    }

    /// Open an active interval: `start` on a fresh session, `resume` after a
    /// pause or stop
    pub fn begin<S: Into<String>>(&mut self, timestamp: i64, reason: S) -> ThermoResult<SessionAction> {
        let action = if self.events.is_empty() {
            SessionAction::Start
        } else {
            SessionAction::Resume
        };
        self.record(timestamp, action, reason)?;
        Ok(action)
    }

    pub fn pause<S: Into<String>>(&mut self, timestamp: i64, reason: S) -> ThermoResult<()> {
        self.record(timestamp, SessionAction::Pause, reason)
    }

    pub fn resume<S: Into<String>>(&mut self, timestamp: i64, reason: S) -> ThermoResult<()> {
        self.record(timestamp, SessionAction::Resume, reason)
    }

    pub fn stop<S: Into<String>>(&mut self, timestamp: i64, reason: S) -> ThermoResult<()> {
        self.record(timestamp, SessionAction::Stop, reason)
    }

    /// Mark acquisition as ended while paused
    ///
    /// `stop` cannot follow `pause`, so the trailing pause is closed at
    /// `timestamp` instead of staying open until the next `resume`.
    pub fn close(&mut self, timestamp: i64) {
        if self.is_paused() {
            debug!("Session closed while paused at {}", timestamp);
            self.closed_at = Some(timestamp);
        }
    }

    /// Time the trailing pause was closed by [`close`](Self::close)
    pub fn closed_at(&self) -> Option<i64> {
        self.closed_at
    }

    /// Forget every event (new session)
    pub fn reset(&mut self) {
        self.events.clear();
        self.closed_at = None;
    }

    pub fn durations(&self, now: i64) -> SessionDurations {
        let end = self.closed_at.map_or(now, |closed| closed.min(now));
        compute_durations(&self.events, end)
    }

    /// Number of interruptions (pauses, and stops that were resumed)
    pub fn pause_count(&self) -> usize {
        let now = self.events.last().map_or(0, |event| event.timestamp);
        compute_durations(&self.events, now).pause_events.len()
    }

    /// Human-readable account of the session, one line per entry
    pub fn narrative(&self, now: i64) -> Vec<String> {
        if self.events.is_empty() {
            return Vec::new();
        }

        let durations = self.durations(now);
        let mut lines = vec![format!(
            "Session: active {}, paused {} ({} interruptions)",
            format_millis(durations.total_active_ms),
            format_millis(durations.total_pause_ms),
            durations.pause_events.len()
        )];

        for event in &self.events {
            let mut line = format!("{} {}", format_timestamp(event.timestamp), event.action);
            if !event.reason.is_empty() {
                line.push_str(": ");
                line.push_str(&event.reason);
            }
            lines.push(line);
        }

        for (index, pause) in durations.pause_events.iter().enumerate() {
            let resumed = match (pause.resumed_at, self.closed_at) {
                (Some(at), _) => format_timestamp(at),
                (None, Some(closed)) => format!("{} (stopped)", format_timestamp(closed)),
                (None, None) => "ongoing".to_string(),
            };
            lines.push(format!(
                "Pause {}: {} -> {} ({}){}",
                index + 1,
                format_timestamp(pause.paused_at),
                resumed,
                format_millis(pause.duration_ms),
                if pause.reason.is_empty() {
                    String::new()
                } else {
                    format!(" reason: {}", pause.reason)
                }
            ));
        }

        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(timestamp: i64, action: SessionAction) -> SessionEvent {
        SessionEvent {
            timestamp,
            action,
            reason: String::new(),
        }
    }

    #[test]
    fn test_durations_start_pause_resume_stop() {
        let events = vec![
            event(0, SessionAction::Start),
            event(10_000, SessionAction::Pause),
            event(15_000, SessionAction::Resume),
            event(25_000, SessionAction::Stop),
        ];
        let durations = compute_durations(&events, 99_000);
        assert_eq!(durations.total_active(), Duration::from_secs(20));
        assert_eq!(durations.total_pause(), Duration::from_secs(5));
        assert_eq!(durations.pause_events.len(), 1);
        assert_eq!(durations.pause_events[0].resumed_at, Some(15_000));
    }

    #[test]
    fn test_open_interval_closed_at_now() {
        let events = vec![event(1_000, SessionAction::Start)];
        assert_eq!(compute_durations(&events, 4_000).total_active_ms, 3_000);

        let events = vec![event(0, SessionAction::Start), event(2_000, SessionAction::Pause)];
        let durations = compute_durations(&events, 5_000);
        assert_eq!(durations.total_active_ms, 2_000);
        assert_eq!(durations.total_pause_ms, 3_000);
        assert_eq!(durations.pause_events[0].resumed_at, None);
    }

    #[test]
    fn test_stop_then_resume_counts_as_pause() {
        let events = vec![
            event(0, SessionAction::Start),
            event(1_000, SessionAction::Stop),
            event(4_000, SessionAction::Resume),
            event(6_000, SessionAction::Stop),
        ];
        let durations = compute_durations(&events, 10_000);
        assert_eq!(durations.total_active_ms, 3_000);
        assert_eq!(durations.total_pause_ms, 3_000);
    }

    #[test]
    fn test_negative_spans_clamped() {
        let events = vec![event(5_000, SessionAction::Start), event(1_000, SessionAction::Stop)];
        let durations = compute_durations(&events, 0);
        assert_eq!(durations.total_active_ms, 0);
        assert_eq!(durations.total_pause_ms, 0);
    }

    #[test]
    fn test_tracker_transitions() {
        let mut tracker = SessionTracker::new();
        assert!(tracker.pause(0, "").is_err());
        assert!(tracker.resume(0, "").is_err());

        assert_eq!(tracker.begin(0, "go").unwrap(), SessionAction::Start);
        assert!(tracker.is_active());
        assert!(tracker.record(1, SessionAction::Start, "").is_err());
        assert!(tracker.resume(1, "").is_err());

        tracker.pause(10, "break").unwrap();
        assert!(tracker.is_paused());
        assert!(tracker.stop(11, "").is_err());

        assert_eq!(tracker.begin(20, "back").unwrap(), SessionAction::Resume);
        tracker.stop(30, "done").unwrap();
        assert!(matches!(tracker.stop(31, ""), Err(ThermoError::Session { .. })));

        assert_eq!(tracker.pause_count(), 1);
        tracker.reset();
        assert!(tracker.events().is_empty());
        assert_eq!(tracker.begin(40, "again").unwrap(), SessionAction::Start);
    }

    #[test]
    fn test_timestamps_must_not_go_backwards() {
        let mut tracker = SessionTracker::new();
        tracker.begin(100, "").unwrap();
        assert!(tracker.pause(50, "").is_err());
    }

    #[test]
    fn test_from_events_validates() {
        let valid = vec![event(0, SessionAction::Start), event(5, SessionAction::Pause)];
        assert!(SessionTracker::from_events(valid).is_ok());

        let invalid = vec![event(0, SessionAction::Start), event(5, SessionAction::Resume)];
        assert!(SessionTracker::from_events(invalid).is_err());
    }

    #[test]
    fn test_narrative() {
        let mut tracker = SessionTracker::new();
        assert!(tracker.narrative(0).is_empty());

        tracker.begin(0, "").unwrap();
        tracker.pause(10_000, "sensor swap").unwrap();
        tracker.resume(15_000, "").unwrap();

        let lines = tracker.narrative(20_000);
        assert!(lines[0].contains("active 15.00s"));
        assert!(lines[0].contains("paused 5.00s"));
        assert_eq!(lines.len(), 1 + 3 + 1);
        assert!(lines[4].starts_with("Pause 1:"));
        assert!(lines[4].ends_with("reason: sensor swap"));
    }

    #[test]
    fn test_close_while_paused_ends_trailing_pause() {
        let mut tracker = SessionTracker::new();
        tracker.begin(0, "").unwrap();
        tracker.pause(10_000, "").unwrap();
        tracker.close(12_000);
        assert_eq!(tracker.closed_at(), Some(12_000));

        // Later "now" values no longer grow the pause
        let durations = tracker.durations(60_000);
        assert_eq!(durations.total_active_ms, 10_000);
        assert_eq!(durations.total_pause_ms, 2_000);

        let lines = tracker.narrative(60_000);
        let pause_line = lines.last().unwrap();
        assert!(pause_line.contains("(stopped)"));
        assert!(!pause_line.contains("ongoing"));

        // Resuming reopens the log
        tracker.resume(20_000, "").unwrap();
        assert_eq!(tracker.closed_at(), None);
    }

    #[test]
    fn test_close_ignored_unless_paused() {
        let mut tracker = SessionTracker::new();
        tracker.begin(0, "").unwrap();
        tracker.close(5_000);
        assert_eq!(tracker.closed_at(), None);
        assert!(tracker.narrative(8_000)[0].contains("active 8.00s"));
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_string(&event(7, SessionAction::Resume)).unwrap();
        assert_eq!(json, r#"{"timestamp":7,"action":"resume","reason":""}"#);
    }
}
