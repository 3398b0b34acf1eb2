use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::firestore::error::FirestoreError;
use crate::firestore::remote::persistent_stream::{RemoteTimer, StreamIo};

/// Time the watch stream may take to connect before the client reports
/// itself offline.
pub const ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Failed watch stream attempts tolerated before the client is offline.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OnlineState {
    /// Connecting, or never tried.
    #[default]
    Unknown,
    Online,
    Offline,
}

/// Derives the client's [`OnlineState`] from watch stream health.
#[derive(Debug)]
pub struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    timer_token: Option<u64>,
    next_token: u64,
    should_warn_client_is_offline: bool,
}

impl Default for OnlineStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OnlineStateTracker {
    pub fn new() -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            timer_token: None,
            next_token: 0,
            should_warn_client_is_offline: true,
        }
    }

    pub fn state(&self) -> OnlineState {
        self.state
    }

    /// Called whenever the watch stream is started. Returns the new state if
    /// it changed.
    pub fn handle_watch_stream_start(&mut self, io: &dyn StreamIo) -> Option<OnlineState> {
        if self.watch_stream_failures != 0 {
            return None;
        }
        let changed = self.apply(OnlineState::Unknown);
        if self.timer_token.is_none() {
            self.next_token += 1;
            self.timer_token = Some(self.next_token);
            io.schedule(RemoteTimer::OnlineStateTimeout, ONLINE_STATE_TIMEOUT, self.next_token);
        }
        changed
    }

    pub fn handle_timer(&mut self, token: u64) -> Option<OnlineState> {
        if self.timer_token != Some(token) {
            return None;
        }
        self.timer_token = None;
        if self.state != OnlineState::Unknown {
            return None;
        }
        self.log_offline_warning(&format!(
            "backend didn't respond within {} seconds",
            ONLINE_STATE_TIMEOUT.as_secs()
        ));
        self.apply(OnlineState::Offline)
    }

    pub fn handle_watch_stream_failure(&mut self, error: Option<&FirestoreError>) -> Option<OnlineState> {
        if self.state == OnlineState::Online {
            return self.apply(OnlineState::Unknown);
        }
        self.watch_stream_failures += 1;
        if self.watch_stream_failures < MAX_WATCH_STREAM_FAILURES {
            return None;
        }
        self.timer_token = None;
        let reason = match error {
            Some(error) => format!("connection failed {} times, most recent error: {error}", self.watch_stream_failures),
            None => format!("connection failed {} times", self.watch_stream_failures),
        };
        self.log_offline_warning(&reason);
        self.apply(OnlineState::Offline)
    }

    /// Explicit transition, e.g. Online after the first watch response or
    /// Offline when the network is disabled.
    pub fn set(&mut self, state: OnlineState) -> Option<OnlineState> {
        self.timer_token = None;
        self.watch_stream_failures = 0;
        if state == OnlineState::Online {
            self.should_warn_client_is_offline = false;
        }
        self.apply(state)
    }

    fn apply(&mut self, state: OnlineState) -> Option<OnlineState> {
        if self.state == state {
            return None;
        }
        log::debug!("online state {:?} -> {:?}", self.state, state);
        self.state = state;
        Some(state)
    }

    fn log_offline_warning(&mut self, details: &str) {
        if self.should_warn_client_is_offline {
            log::warn!(
                "could not reach the backend ({details}); operating in offline mode until a connection succeeds"
            );
            self.should_warn_client_is_offline = false;
        } else {
            log::debug!("still offline: {details}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::unavailable;
    use crate::firestore::remote::persistent_stream::testing::RecordingStreamIo;

    #[test]
    fn single_failure_goes_offline() {
        let io = RecordingStreamIo::default();
        let mut tracker = OnlineStateTracker::new();
        assert_eq!(tracker.handle_watch_stream_start(&io), None);
        let error = unavailable("reset");
        assert_eq!(
            tracker.handle_watch_stream_failure(Some(&error)),
            Some(OnlineState::Offline)
        );
    }

    #[test]
    fn timer_reports_offline_only_while_unknown() {
        let io = RecordingStreamIo::default();
        let mut tracker = OnlineStateTracker::new();
        tracker.handle_watch_stream_start(&io);
        let token = io.last_token(RemoteTimer::OnlineStateTimeout).unwrap();
        assert_eq!(tracker.handle_timer(token), Some(OnlineState::Offline));

        let mut connected = OnlineStateTracker::new();
        connected.handle_watch_stream_start(&io);
        let token = io.last_token(RemoteTimer::OnlineStateTimeout).unwrap();
        assert_eq!(connected.set(OnlineState::Online), Some(OnlineState::Online));
        assert_eq!(connected.handle_timer(token), None);
    }

    #[test]
    fn losing_an_online_stream_returns_to_unknown() {
        let mut tracker = OnlineStateTracker::new();
        tracker.set(OnlineState::Online);
        assert_eq!(tracker.handle_watch_stream_failure(None), Some(OnlineState::Unknown));
        assert_eq!(tracker.state(), OnlineState::Unknown);
    }
}
