use std::time::Duration;

use serde_json::Value as JsonValue;

use crate::firestore::error::{unavailable, FirestoreError, FirestoreErrorCode};
use crate::firestore::remote::connection::StreamKind;
use crate::util::{hard_assert, BackoffConfig, ExponentialBackoff};

/// A stream that sees no server response within this bound is restarted.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
/// An open stream that is not needed is closed after this long.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Timers the remote layer arms through [`StreamIo::schedule`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RemoteTimer {
    Backoff(StreamKind),
    HealthCheck(StreamKind),
    Idle(StreamKind),
    OnlineStateTimeout,
    /// Retry of persistence after the network was disabled by a failure.
    NetworkRecovery,
}

/// Side effects requested by the synchronous stream state machines.
///
/// Implementations perform the I/O asynchronously and report back through
/// [`StreamEvent`]s tagged with the generation or timer token they were given.
pub trait StreamIo: Send + Sync {
    fn open_stream(&self, kind: StreamKind, generation: u64);

    fn send(&self, kind: StreamKind, generation: u64, frame: JsonValue);

    fn close_stream(&self, kind: StreamKind, generation: u64);

    fn schedule(&self, timer: RemoteTimer, delay: Duration, token: u64);

    fn invalidate_credentials(&self);
}

/// I/O completions fed back into the remote store.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Opened {
        kind: StreamKind,
        generation: u64,
    },
    Message {
        kind: StreamKind,
        generation: u64,
        frame: JsonValue,
    },
    Closed {
        kind: StreamKind,
        generation: u64,
        error: Option<FirestoreError>,
    },
    TimerFired {
        timer: RemoteTimer,
        token: u64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistentStreamState {
    /// Never started, or stopped cleanly. `start` opens immediately.
    Initial,
    /// Open requested, waiting for the transport.
    Starting,
    Open,
    /// Open and the server has responded at least once.
    Healthy,
    /// Closed by an error. The next `start` backs off first.
    Error,
    Backoff,
}

/// What a handled [`StreamEvent`] means for the owner of the stream.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamTransition {
    Opened,
    Message(JsonValue),
    Closed(Option<FirestoreError>),
}

/// Connection state machine shared by the Listen and Write streams.
///
/// Every close bumps the generation, which turns late events for the previous
/// connection into no-ops. Timers carry their own token for the same reason.
#[derive(Debug)]
pub struct PersistentStream {
    kind: StreamKind,
    state: PersistentStreamState,
    generation: u64,
    backoff: ExponentialBackoff,
    next_timer_token: u64,
    health_timer: Option<u64>,
    idle_timer: Option<u64>,
    backoff_timer: Option<u64>,
}

impl PersistentStream {
    pub fn new(kind: StreamKind) -> Self {
        Self::with_backoff(kind, BackoffConfig::default())
    }

    pub fn with_backoff(kind: StreamKind, config: BackoffConfig) -> Self {
        Self {
            kind,
            state: PersistentStreamState::Initial,
            generation: 0,
            backoff: ExponentialBackoff::new(config),
            next_timer_token: 0,
            health_timer: None,
            idle_timer: None,
            backoff_timer: None,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> PersistentStreamState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_started(&self) -> bool {
        matches!(
            self.state,
            PersistentStreamState::Starting
                | PersistentStreamState::Open
                | PersistentStreamState::Healthy
                | PersistentStreamState::Backoff
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, PersistentStreamState::Open | PersistentStreamState::Healthy)
    }

    pub fn start(&mut self, io: &dyn StreamIo) {
        if self.state == PersistentStreamState::Error {
            self.perform_backoff(io);
            return;
        }
        hard_assert(
            self.state == PersistentStreamState::Initial,
            format!("{} stream already started", self.kind.label()),
        );
        self.state = PersistentStreamState::Starting;
        self.generation += 1;
        log::debug!(
            "opening {} stream (generation {})",
            self.kind.label(),
            self.generation
        );
        io.open_stream(self.kind, self.generation);
        let token = self.next_token();
        self.health_timer = Some(token);
        io.schedule(RemoteTimer::HealthCheck(self.kind), HEALTH_CHECK_TIMEOUT, token);
    }

    /// Closes the stream without an error; the next `start` connects at once.
    pub fn stop(&mut self, io: &dyn StreamIo) {
        if self.is_started() {
            self.close(io, PersistentStreamState::Initial, None);
        }
    }

    /// Tears the connection down after a protocol error detected by the owner.
    pub fn fail(&mut self, io: &dyn StreamIo, error: FirestoreError) -> StreamTransition {
        self.close(io, PersistentStreamState::Error, Some(error))
    }

    /// Forgets accumulated backoff so a user-visible restart is immediate.
    pub fn inhibit_backoff(&mut self) {
        hard_assert(
            !self.is_started(),
            "can only inhibit backoff on a stopped stream",
        );
        self.state = PersistentStreamState::Initial;
        self.backoff.reset();
    }

    /// Arms the idle timer if the stream is open and not already idling.
    pub fn mark_idle(&mut self, io: &dyn StreamIo) {
        if self.is_open() && self.idle_timer.is_none() {
            let token = self.next_token();
            self.idle_timer = Some(token);
            io.schedule(RemoteTimer::Idle(self.kind), IDLE_TIMEOUT, token);
        }
    }

    pub fn send(&mut self, io: &dyn StreamIo, frame: JsonValue) {
        self.idle_timer = None;
        io.send(self.kind, self.generation, frame);
    }

    /// Applies `event` and reports what changed for the owner. Events of other
    /// streams and stale events return `None`.
    pub fn handle_event(&mut self, io: &dyn StreamIo, event: StreamEvent) -> Option<StreamTransition> {
        match event {
            StreamEvent::Opened { kind, generation } => {
                if kind != self.kind || generation != self.generation {
                    return None;
                }
                if self.state != PersistentStreamState::Starting {
                    return None;
                }
                self.state = PersistentStreamState::Open;
                Some(StreamTransition::Opened)
            }
            StreamEvent::Message {
                kind,
                generation,
                frame,
            } => {
                if kind != self.kind || generation != self.generation || !self.is_open() {
                    return None;
                }
                if self.state == PersistentStreamState::Open {
                    self.state = PersistentStreamState::Healthy;
                    self.health_timer = None;
                    self.backoff.reset();
                }
                Some(StreamTransition::Message(frame))
            }
            StreamEvent::Closed {
                kind,
                generation,
                error,
            } => {
                if kind != self.kind || generation != self.generation || !self.is_started() {
                    return None;
                }
                let error = error.unwrap_or_else(|| unavailable("stream closed by the server"));
                Some(self.close(io, PersistentStreamState::Error, Some(error)))
            }
            StreamEvent::TimerFired { timer, token } => self.handle_timer(io, timer, token),
        }
    }

    fn handle_timer(&mut self, io: &dyn StreamIo, timer: RemoteTimer, token: u64) -> Option<StreamTransition> {
        match timer {
            RemoteTimer::HealthCheck(kind) if kind == self.kind => {
                if self.health_timer != Some(token) {
                    return None;
                }
                self.health_timer = None;
                if !matches!(
                    self.state,
                    PersistentStreamState::Starting | PersistentStreamState::Open
                ) {
                    return None;
                }
                log::debug!(
                    "{} stream did not respond in time, restarting",
                    self.kind.label()
                );
                let error = unavailable("stream health check timed out");
                Some(self.close(io, PersistentStreamState::Error, Some(error)))
            }
            RemoteTimer::Idle(kind) if kind == self.kind => {
                if self.idle_timer != Some(token) || !self.is_open() {
                    return None;
                }
                self.idle_timer = None;
                log::debug!("closing idle {} stream", self.kind.label());
                Some(self.close(io, PersistentStreamState::Initial, None))
            }
            RemoteTimer::Backoff(kind) if kind == self.kind => {
                if self.backoff_timer != Some(token) || self.state != PersistentStreamState::Backoff {
                    return None;
                }
                self.backoff_timer = None;
                self.state = PersistentStreamState::Initial;
                self.start(io);
                None
            }
            _ => None,
        }
    }

    fn close(
        &mut self,
        io: &dyn StreamIo,
        final_state: PersistentStreamState,
        error: Option<FirestoreError>,
    ) -> StreamTransition {
        self.idle_timer = None;
        self.health_timer = None;
        self.backoff_timer = None;

        if final_state != PersistentStreamState::Error {
            self.backoff.reset();
        } else if let Some(error) = &error {
            match error.code {
                FirestoreErrorCode::ResourceExhausted => {
                    log::debug!(
                        "{} stream exhausted a quota, using maximum backoff",
                        self.kind.label()
                    );
                    self.backoff.reset_to_max();
                }
                FirestoreErrorCode::Unauthenticated => io.invalidate_credentials(),
                _ => {}
            }
        }

        if self.state != PersistentStreamState::Backoff {
            io.close_stream(self.kind, self.generation);
        }
        self.generation += 1;
        self.state = final_state;
        log::debug!(
            "{} stream closed ({:?})",
            self.kind.label(),
            error.as_ref().map(FirestoreError::code_str)
        );
        StreamTransition::Closed(error)
    }

    fn perform_backoff(&mut self, io: &dyn StreamIo) {
        self.state = PersistentStreamState::Backoff;
        let delay = self.backoff.next_delay();
        let token = self.next_token();
        self.backoff_timer = Some(token);
        log::debug!(
            "backing off {} stream for {delay:?}",
            self.kind.label()
        );
        io.schedule(RemoteTimer::Backoff(self.kind), delay, token);
    }

    fn next_token(&mut self) -> u64 {
        self.next_timer_token += 1;
        self.next_timer_token
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;
    use crate::firestore::local::kv_store::lock_unpoisoned;

    #[derive(Clone, Debug, PartialEq)]
    pub enum IoCall {
        Open(StreamKind, u64),
        Send(StreamKind, u64, JsonValue),
        Close(StreamKind, u64),
        Schedule(RemoteTimer, Duration, u64),
        InvalidateCredentials,
    }

    /// [`StreamIo`] that only records what was asked of it.
    #[derive(Debug, Default)]
    pub struct RecordingStreamIo {
        calls: Mutex<Vec<IoCall>>,
    }

    impl RecordingStreamIo {
        pub fn take(&self) -> Vec<IoCall> {
            std::mem::take(&mut *lock_unpoisoned(&self.calls))
        }

        pub fn sent(&self, kind: StreamKind) -> Vec<JsonValue> {
            lock_unpoisoned(&self.calls)
                .iter()
                .filter_map(|call| match call {
                    IoCall::Send(sent_kind, _, frame) if *sent_kind == kind => Some(frame.clone()),
                    _ => None,
                })
                .collect()
        }

        /// Generation of the most recent open request for `kind`.
        pub fn last_open(&self, kind: StreamKind) -> Option<u64> {
            lock_unpoisoned(&self.calls).iter().rev().find_map(|call| match call {
                IoCall::Open(opened, generation) if *opened == kind => Some(*generation),
                _ => None,
            })
        }

        /// Token of the most recently scheduled `timer`.
        pub fn last_token(&self, timer: RemoteTimer) -> Option<u64> {
            lock_unpoisoned(&self.calls).iter().rev().find_map(|call| match call {
                IoCall::Schedule(scheduled, _, token) if *scheduled == timer => Some(*token),
                _ => None,
            })
        }
    }

    impl StreamIo for RecordingStreamIo {
        fn open_stream(&self, kind: StreamKind, generation: u64) {
            lock_unpoisoned(&self.calls).push(IoCall::Open(kind, generation));
        }

        fn send(&self, kind: StreamKind, generation: u64, frame: JsonValue) {
            lock_unpoisoned(&self.calls).push(IoCall::Send(kind, generation, frame));
        }

        fn close_stream(&self, kind: StreamKind, generation: u64) {
            lock_unpoisoned(&self.calls).push(IoCall::Close(kind, generation));
        }

        fn schedule(&self, timer: RemoteTimer, delay: Duration, token: u64) {
            lock_unpoisoned(&self.calls).push(IoCall::Schedule(timer, delay, token));
        }

        fn invalidate_credentials(&self) {
            lock_unpoisoned(&self.calls).push(IoCall::InvalidateCredentials);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::testing::{IoCall, RecordingStreamIo};
    use super::*;
    use crate::firestore::error::{resource_exhausted, unauthenticated};

    fn opened(stream: &mut PersistentStream, io: &RecordingStreamIo) {
        stream.start(io);
        let generation = stream.generation();
        assert_eq!(
            stream.handle_event(
                io,
                StreamEvent::Opened {
                    kind: StreamKind::Listen,
                    generation
                }
            ),
            Some(StreamTransition::Opened)
        );
    }

    #[test]
    fn start_opens_and_arms_health_check() {
        let io = RecordingStreamIo::default();
        let mut stream = PersistentStream::new(StreamKind::Listen);
        stream.start(&io);
        assert_eq!(stream.state(), PersistentStreamState::Starting);
        assert_eq!(
            io.take(),
            vec![
                IoCall::Open(StreamKind::Listen, 1),
                IoCall::Schedule(RemoteTimer::HealthCheck(StreamKind::Listen), HEALTH_CHECK_TIMEOUT, 1),
            ]
        );
    }

    #[test]
    fn stale_generation_events_are_ignored() {
        let io = RecordingStreamIo::default();
        let mut stream = PersistentStream::new(StreamKind::Listen);
        opened(&mut stream, &io);
        stream.stop(&io);
        stream.start(&io);

        let stale = StreamEvent::Message {
            kind: StreamKind::Listen,
            generation: 1,
            frame: json!({}),
        };
        assert_eq!(stream.handle_event(&io, stale), None);
        let stale_close = StreamEvent::Closed {
            kind: StreamKind::Listen,
            generation: 1,
            error: None,
        };
        assert_eq!(stream.handle_event(&io, stale_close), None);
        assert_eq!(stream.state(), PersistentStreamState::Starting);
    }

    #[test]
    fn error_close_backs_off_before_reopening() {
        let io = RecordingStreamIo::default();
        let mut stream = PersistentStream::new(StreamKind::Listen);
        opened(&mut stream, &io);
        let generation = stream.generation();
        let transition = stream.handle_event(
            &io,
            StreamEvent::Closed {
                kind: StreamKind::Listen,
                generation,
                error: Some(unavailable("reset")),
            },
        );
        assert!(matches!(transition, Some(StreamTransition::Closed(Some(_)))));
        assert_eq!(stream.state(), PersistentStreamState::Error);

        io.take();
        stream.start(&io);
        assert_eq!(stream.state(), PersistentStreamState::Backoff);
        let token = io.last_token(RemoteTimer::Backoff(StreamKind::Listen)).unwrap();
        assert!(!io.take().iter().any(|call| matches!(call, IoCall::Open(..))));

        stream.handle_event(
            &io,
            StreamEvent::TimerFired {
                timer: RemoteTimer::Backoff(StreamKind::Listen),
                token,
            },
        );
        assert_eq!(stream.state(), PersistentStreamState::Starting);
        assert!(io.take().iter().any(|call| matches!(call, IoCall::Open(StreamKind::Listen, _))));
    }

    #[test]
    fn resource_exhausted_jumps_to_max_backoff() {
        let io = RecordingStreamIo::default();
        let mut stream = PersistentStream::new(StreamKind::Write);
        stream.start(&io);
        let generation = stream.generation();
        stream.handle_event(
            &io,
            StreamEvent::Closed {
                kind: StreamKind::Write,
                generation,
                error: Some(resource_exhausted("slow down")),
            },
        );
        io.take();
        stream.start(&io);
        let delay = io
            .take()
            .into_iter()
            .find_map(|call| match call {
                IoCall::Schedule(RemoteTimer::Backoff(_), delay, _) => Some(delay),
                _ => None,
            })
            .unwrap();
        assert!(delay >= Duration::from_secs(30));
    }

    #[test]
    fn unauthenticated_invalidates_credentials() {
        let io = RecordingStreamIo::default();
        let mut stream = PersistentStream::new(StreamKind::Listen);
        opened(&mut stream, &io);
        let generation = stream.generation();
        stream.handle_event(
            &io,
            StreamEvent::Closed {
                kind: StreamKind::Listen,
                generation,
                error: Some(unauthenticated("expired")),
            },
        );
        assert!(io.take().contains(&IoCall::InvalidateCredentials));
    }

    #[test]
    fn health_check_restarts_silent_stream() {
        let io = RecordingStreamIo::default();
        let mut stream = PersistentStream::new(StreamKind::Listen);
        opened(&mut stream, &io);
        let token = io.last_token(RemoteTimer::HealthCheck(StreamKind::Listen)).unwrap();
        let transition = stream.handle_event(
            &io,
            StreamEvent::TimerFired {
                timer: RemoteTimer::HealthCheck(StreamKind::Listen),
                token,
            },
        );
        assert!(matches!(transition, Some(StreamTransition::Closed(Some(_)))));
        assert_eq!(stream.state(), PersistentStreamState::Error);
    }

    #[test]
    fn first_message_disarms_health_check() {
        let io = RecordingStreamIo::default();
        let mut stream = PersistentStream::new(StreamKind::Listen);
        opened(&mut stream, &io);
        let token = io.last_token(RemoteTimer::HealthCheck(StreamKind::Listen)).unwrap();
        let generation = stream.generation();
        stream.handle_event(
            &io,
            StreamEvent::Message {
                kind: StreamKind::Listen,
                generation,
                frame: json!({}),
            },
        );
        assert_eq!(stream.state(), PersistentStreamState::Healthy);
        let transition = stream.handle_event(
            &io,
            StreamEvent::TimerFired {
                timer: RemoteTimer::HealthCheck(StreamKind::Listen),
                token,
            },
        );
        assert_eq!(transition, None);
    }

    #[test]
    fn idle_timer_closes_cleanly_unless_cancelled_by_send() {
        let io = RecordingStreamIo::default();
        let mut stream = PersistentStream::new(StreamKind::Listen);
        opened(&mut stream, &io);
        stream.mark_idle(&io);
        let first = io.last_token(RemoteTimer::Idle(StreamKind::Listen)).unwrap();
        stream.send(&io, json!({ "removeTarget": 2 }));
        let fired = StreamEvent::TimerFired {
            timer: RemoteTimer::Idle(StreamKind::Listen),
            token: first,
        };
        assert_eq!(stream.handle_event(&io, fired), None);

        stream.mark_idle(&io);
        let second = io.last_token(RemoteTimer::Idle(StreamKind::Listen)).unwrap();
        let transition = stream.handle_event(
            &io,
            StreamEvent::TimerFired {
                timer: RemoteTimer::Idle(StreamKind::Listen),
                token: second,
            },
        );
        assert_eq!(transition, Some(StreamTransition::Closed(None)));
        assert_eq!(stream.state(), PersistentStreamState::Initial);
    }
}
