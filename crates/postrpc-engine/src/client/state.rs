//! Request lifecycle as a plain state machine.
//!
//! No timers and no I/O here: every incoming envelope kind has one
//! transition method, and the caller owns the clock.

use std::time::Duration;

use postrpc_core::error::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingAck,
    AwaitingResult,
    AwaitingAsyncResult,
    ConsumingStream,
    Settled,
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub ack: Duration,
    pub request: Duration,
    pub async_result: Duration,
}

/// What the driver must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Ignored,
    /// Replace the running timer.
    Rearm(Duration),
    /// Stop the timer and bind the announced stream.
    OpenStream,
    /// Terminal: settle with the envelope that caused it.
    Settle,
}

#[derive(Debug)]
pub struct RequestMachine {
    phase: Phase,
    timeouts: Timeouts,
    expected_ack: Option<String>,
}

impl RequestMachine {
    pub fn new(timeouts: Timeouts, expected_ack: Option<String>) -> Self {
        Self {
            phase: Phase::AwaitingAck,
            timeouts,
            expected_ack,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Initial timer once the request is on the wire.
    pub fn start(&mut self, require_ack: bool) -> Duration {
        if require_ack {
            self.phase = Phase::AwaitingAck;
            self.timeouts.ack
        } else {
            self.phase = Phase::AwaitingResult;
            self.timeouts.request
        }
    }

    pub fn on_ack(&mut self, token: Option<&str>) -> Transition {
        if self.phase != Phase::AwaitingAck {
            return Transition::Ignored;
        }
        if let Some(expected) = self.expected_ack.as_deref() {
            if token != Some(expected) {
                return Transition::Ignored;
            }
        }
        self.phase = Phase::AwaitingResult;
        Transition::Rearm(self.timeouts.request)
    }

    pub fn on_async(&mut self) -> Transition {
        match self.phase {
            Phase::AwaitingAck | Phase::AwaitingResult => {
                self.phase = Phase::AwaitingAsyncResult;
                Transition::Rearm(self.timeouts.async_result)
            }
            _ => Transition::Ignored,
        }
    }

    /// RESPONSE and ERROR settle the same way.
    pub fn on_result(&mut self) -> Transition {
        match self.phase {
            Phase::Settled | Phase::ConsumingStream => Transition::Ignored,
            _ => {
                self.phase = Phase::Settled;
                Transition::Settle
            }
        }
    }

    pub fn on_stream_start(&mut self) -> Transition {
        match self.phase {
            Phase::Settled | Phase::ConsumingStream => Transition::Ignored,
            _ => {
                self.phase = Phase::ConsumingStream;
                Transition::OpenStream
            }
        }
    }

    /// Timer fired. Returns the phase-specific code, `None` if no timer
    /// should have been running.
    pub fn on_timeout(&mut self) -> Option<ErrorCode> {
        let code = match self.phase {
            Phase::AwaitingAck => ErrorCode::AckTimeout,
            Phase::AwaitingResult => ErrorCode::Timeout,
            Phase::AwaitingAsyncResult => ErrorCode::AsyncTimeout,
            Phase::ConsumingStream | Phase::Settled => return None,
        };
        self.phase = Phase::Settled;
        Some(code)
    }

    pub fn settle(&mut self) {
        self.phase = Phase::Settled;
    }

    pub fn is_settled(&self) -> bool {
        self.phase == Phase::Settled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(token: Option<&str>) -> RequestMachine {
        RequestMachine::new(
            Timeouts {
                ack: Duration::from_millis(10),
                request: Duration::from_millis(100),
                async_result: Duration::from_millis(1000),
            },
            token.map(str::to_string),
        )
    }

    #[test]
    fn ack_moves_to_request_timeout_exactly_once() {
        let mut m = machine(None);
        assert_eq!(m.start(true), Duration::from_millis(10));
        assert_eq!(m.on_ack(None), Transition::Rearm(Duration::from_millis(100)));
        assert_eq!(m.on_ack(None), Transition::Ignored);
        assert_eq!(m.phase(), Phase::AwaitingResult);
    }

    #[test]
    fn mismatched_ack_token_is_ignored() {
        let mut m = machine(Some("t1"));
        m.start(true);
        assert_eq!(m.on_ack(Some("t2")), Transition::Ignored);
        assert_eq!(m.on_ack(None), Transition::Ignored);
        assert_eq!(m.on_ack(Some("t1")), Transition::Rearm(Duration::from_millis(100)));
    }

    #[test]
    fn no_ack_phase_without_require_ack() {
        let mut m = machine(None);
        assert_eq!(m.start(false), Duration::from_millis(100));
        assert_eq!(m.on_timeout(), Some(ErrorCode::Timeout));
        assert!(m.is_settled());
    }

    #[test]
    fn timeouts_name_the_phase() {
        let mut m = machine(None);
        m.start(true);
        assert_eq!(m.on_timeout(), Some(ErrorCode::AckTimeout));

        let mut m = machine(None);
        m.start(true);
        m.on_ack(None);
        assert_eq!(m.on_async(), Transition::Rearm(Duration::from_millis(1000)));
        assert_eq!(m.on_timeout(), Some(ErrorCode::AsyncTimeout));
    }

    #[test]
    fn settled_is_terminal() {
        let mut m = machine(None);
        m.start(true);
        m.on_ack(None);
        assert_eq!(m.on_result(), Transition::Settle);
        assert_eq!(m.on_result(), Transition::Ignored);
        assert_eq!(m.on_async(), Transition::Ignored);
        assert_eq!(m.on_stream_start(), Transition::Ignored);
        assert_eq!(m.on_timeout(), None);
    }

    #[test]
    fn stream_start_disarms_the_timer() {
        let mut m = machine(None);
        m.start(false);
        assert_eq!(m.on_stream_start(), Transition::OpenStream);
        assert_eq!(m.on_timeout(), None);
        assert_eq!(m.on_result(), Transition::Ignored);
        m.settle();
        assert!(m.is_settled());
    }
}
