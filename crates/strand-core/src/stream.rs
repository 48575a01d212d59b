//! Per-call stream state machine.
//!
//! One call is one bidirectional stream with a request half (written
//! locally) and a response half (written by the peer). Unary-shaped halves
//! carry exactly one message and close themselves after it.

use crate::error::Status;
use crate::method::StreamingShape;

/// State of a call's pair of half-streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, nothing sent yet
    Idle,
    /// Both halves open
    Open,
    /// Local side completed its half; responses may still arrive
    HalfClosedLocal,
    /// Peer completed its half; local side may still send
    HalfClosedRemote,
    /// Both halves done, or the call failed
    Closed,
}

/// Transition table for one call
#[derive(Debug, Clone)]
pub struct StreamStateMachine {
    shape: StreamingShape,
    state: StreamState,
    sent: u64,
    received: u64,
    remote_closed: bool,
}

impl StreamStateMachine {
    pub fn new(shape: StreamingShape) -> Self {
        Self {
            shape,
            state: StreamState::Idle,
            sent: 0,
            received: 0,
            remote_closed: false,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn shape(&self) -> StreamingShape {
        self.shape
    }

    pub fn messages_sent(&self) -> u64 {
        self.sent
    }

    pub fn messages_received(&self) -> u64 {
        self.received
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Whether the local half is still writable
    pub fn can_send(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Idle → Open
    pub fn open(&mut self) -> Result<(), Status> {
        match self.state {
            StreamState::Idle => {
                self.state = StreamState::Open;
                Ok(())
            }
            other => Err(Status::failed_precondition(format!(
                "call already opened (state {:?})",
                other
            ))),
        }
    }

    /// Account for one outgoing message.
    ///
    /// Returns `true` when the message also closed the local half, which
    /// happens after the only message of a single-request call.
    pub fn on_send(&mut self) -> Result<bool, Status> {
        match self.state {
            StreamState::Open | StreamState::HalfClosedRemote => {}
            StreamState::Idle => return Err(Status::failed_precondition("call not opened")),
            StreamState::HalfClosedLocal | StreamState::Closed => {
                return Err(Status::failed_precondition("write after request stream completed"))
            }
        }
        self.sent += 1;
        if self.shape.is_single_request() {
            self.close_send()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Local half is complete
    pub fn close_send(&mut self) -> Result<(), Status> {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            StreamState::Idle => return Err(Status::failed_precondition("call not opened")),
            StreamState::HalfClosedLocal | StreamState::Closed => {
                return Err(Status::failed_precondition("request stream already completed"))
            }
        };
        Ok(())
    }

    /// Account for one incoming message; violations are the peer's fault
    pub fn on_receive(&mut self) -> Result<(), Status> {
        match self.state {
            StreamState::Open | StreamState::HalfClosedLocal => {}
            StreamState::Idle => return Err(Status::internal("message before call opened")),
            StreamState::HalfClosedRemote | StreamState::Closed => {
                return Err(Status::internal("message after end of response stream"))
            }
        }
        if self.shape.is_single_response() && self.received >= 1 {
            return Err(Status::internal(format!(
                "{} call received more than one response",
                self.shape
            )));
        }
        self.received += 1;
        Ok(())
    }

    /// The peer's half is complete
    pub fn on_remote_close(&mut self) -> Result<(), Status> {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            StreamState::Idle => return Err(Status::internal("end of stream before call opened")),
            StreamState::HalfClosedRemote | StreamState::Closed => {
                return Err(Status::internal("duplicate end of response stream"))
            }
        };
        self.remote_closed = true;
        if self.shape.is_single_response() && self.received == 0 {
            return Err(Status::internal(format!(
                "{} call completed without a response",
                self.shape
            )));
        }
        Ok(())
    }

    /// Reading is a programmer error once the response half has been drained
    pub fn check_read(&self) -> Result<(), Status> {
        if self.remote_closed {
            return Err(Status::failed_precondition("read after response stream ended"));
        }
        Ok(())
    }

    /// Terminal error: both halves are gone
    pub fn fail(&mut self) {
        self.state = StreamState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;

    #[test]
    fn test_bidi_lifecycle() {
        let mut sm = StreamStateMachine::new(StreamingShape::BidiStreaming);
        assert_eq!(sm.state(), StreamState::Idle);
        sm.open().unwrap();

        assert!(!sm.on_send().unwrap());
        assert!(!sm.on_send().unwrap());
        sm.on_receive().unwrap();
        sm.close_send().unwrap();
        assert_eq!(sm.state(), StreamState::HalfClosedLocal);

        sm.on_receive().unwrap();
        sm.on_remote_close().unwrap();
        assert_eq!(sm.state(), StreamState::Closed);
        assert_eq!(sm.messages_sent(), 2);
        assert_eq!(sm.messages_received(), 2);
    }

    #[test]
    fn test_unary_auto_half_close() {
        let mut sm = StreamStateMachine::new(StreamingShape::Unary);
        sm.open().unwrap();
        assert!(sm.on_send().unwrap());
        assert_eq!(sm.state(), StreamState::HalfClosedLocal);

        let err = sm.on_send().unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[test]
    fn test_write_after_complete_fails() {
        let mut sm = StreamStateMachine::new(StreamingShape::ClientStreaming);
        sm.open().unwrap();
        sm.close_send().unwrap();
        assert_eq!(sm.on_send().unwrap_err().code(), Code::FailedPrecondition);
        assert_eq!(sm.close_send().unwrap_err().code(), Code::FailedPrecondition);
    }

    #[test]
    fn test_read_after_remote_close_fails() {
        let mut sm = StreamStateMachine::new(StreamingShape::ServerStreaming);
        sm.open().unwrap();
        sm.on_send().unwrap();
        sm.check_read().unwrap();
        sm.on_receive().unwrap();
        sm.on_remote_close().unwrap();
        assert_eq!(sm.check_read().unwrap_err().code(), Code::FailedPrecondition);
    }

    #[test]
    fn test_single_response_violations() {
        let mut sm = StreamStateMachine::new(StreamingShape::Unary);
        sm.open().unwrap();
        sm.on_send().unwrap();
        sm.on_receive().unwrap();
        assert_eq!(sm.on_receive().unwrap_err().code(), Code::Internal);

        let mut empty = StreamStateMachine::new(StreamingShape::ClientStreaming);
        empty.open().unwrap();
        empty.close_send().unwrap();
        assert_eq!(empty.on_remote_close().unwrap_err().code(), Code::Internal);
    }

    #[test]
    fn test_remote_close_then_local_send() {
        let mut sm = StreamStateMachine::new(StreamingShape::BidiStreaming);
        sm.open().unwrap();
        sm.on_remote_close().unwrap();
        assert_eq!(sm.state(), StreamState::HalfClosedRemote);
        assert!(sm.can_send());
        sm.on_send().unwrap();
        sm.close_send().unwrap();
        assert!(sm.is_closed());
    }

    #[test]
    fn test_fail_closes() {
        let mut sm = StreamStateMachine::new(StreamingShape::BidiStreaming);
        sm.open().unwrap();
        sm.fail();
        assert!(sm.is_closed());
        assert!(!sm.can_send());
    }
}
