//! Call state machine
//!
//! Calling, Proceeding and Completing are caller-only; Received, Early and
//! Completed callee-only. Everything else is shared.

use crate::domain::shared::EngineError;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    /// Created, no INVITE yet
    Idle,
    /// INVITE sent
    Calling,
    /// 1xx other than 100 received
    Proceeding,
    /// 2xx received, ACK not yet sent
    Completing,
    /// INVITE received
    Received,
    /// 1xx sent
    Early,
    /// 2xx sent, waiting for ACK
    Completed,
    Ready,
    /// BYE sent
    Terminating,
    Terminated,
}

impl CallState {
    pub fn name(&self) -> &'static str {
        match self {
            CallState::Idle => "Idle",
            CallState::Calling => "Calling",
            CallState::Proceeding => "Proceeding",
            CallState::Completing => "Completing",
            CallState::Received => "Received",
            CallState::Early => "Early",
            CallState::Completed => "Completed",
            CallState::Ready => "Ready",
            CallState::Terminating => "Terminating",
            CallState::Terminated => "Terminated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    /// We received the INVITE
    Inbound,
    /// We sent the INVITE
    Outbound,
}

/// When the call was answered and when it ended
#[derive(Debug, Clone, Copy, Default)]
pub struct CallTimes {
    pub answered_at: Option<Instant>,
    pub ended_at: Option<Instant>,
}

impl CallTimes {
    /// Time between answer and end
    pub fn talk_time(&self) -> Option<Duration> {
        Some(self.ended_at?.duration_since(self.answered_at?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    /// INVITE sent
    Invite,
    /// INVITE received
    Incoming,
    /// 1xx (other than 100) received
    Progress,
    /// 1xx sent
    EarlyResponse,
    /// 2xx to our INVITE received
    Answered,
    /// 2xx to the peer's INVITE sent
    Accepted,
    /// ACK sent (caller) or received (callee)
    Acknowledged,
    /// BYE sent
    Bye,
    /// BYE completed or received, INVITE failed or cancelled
    Ended,
}

fn next_state(state: CallState, event: CallEvent) -> Option<CallState> {
    use CallEvent as E;
    use CallState as S;
    let next = match (state, event) {
        (S::Idle, E::Invite) => S::Calling,
        (S::Idle, E::Incoming) => S::Received,
        (S::Calling | S::Proceeding, E::Progress) => S::Proceeding,
        (S::Calling | S::Proceeding, E::Answered) => S::Completing,
        (S::Received | S::Early, E::EarlyResponse) => S::Early,
        (S::Received | S::Early, E::Accepted) => S::Completed,
        (S::Completing | S::Completed, E::Acknowledged) => S::Ready,
        (S::Ready | S::Completed | S::Completing, E::Bye) => S::Terminating,
        (S::Terminated, E::Ended) => return None,
        (_, E::Ended) => S::Terminated,
        _ => return None,
    };
    Some(next)
}

#[derive(Debug, Clone)]
pub struct CallStateMachine {
    state: CallState,
    times: CallTimes,
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self {
            state: CallState::Idle,
            times: CallTimes::default(),
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn times(&self) -> &CallTimes {
        &self.times
    }

    pub fn process_event(&mut self, event: CallEvent, now: Instant) -> Result<CallState, EngineError> {
        let next = next_state(self.state, event).ok_or_else(|| {
            EngineError::InvalidState(format!("Invalid state transition: {} + {:?}", self.state.name(), event))
        })?;
        match event {
            CallEvent::Answered | CallEvent::Accepted => self.times.answered_at = Some(now),
            CallEvent::Ended => self.times.ended_at = Some(now),
            _ => {}
        }
        self.state = next;
        Ok(next)
    }

    /// Our INVITE can still be cancelled
    pub fn can_cancel(&self) -> bool {
        matches!(self.state, CallState::Calling | CallState::Proceeding)
    }

    /// A BYE may be sent
    pub fn can_terminate(&self) -> bool {
        matches!(
            self.state,
            CallState::Ready | CallState::Completed | CallState::Completing
        )
    }
}

impl Default for CallStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
