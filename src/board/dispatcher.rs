// Command dispatch: codec + transport + retries
//
// Transport errors are retried up to the policy's attempt count. A decode
// failure (garbled or misaligned response) gets exactly one extra attempt,
// even when the attempt count is already used up.

use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::protocol::{self, Command, InvalidPayloadError, ProtocolError, ResponseFrame, READ_LEN};
use crate::transport::{BusAddress, Transport, TransportError};

/// A verified board location, produced by discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardHandle {
    pub location: BusAddress,
    pub board_id: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts for transient transport errors (at least 1)
    pub attempts: u32,
    /// Delay between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: crate::config::RETRY_ATTEMPTS,
            backoff: crate::config::RETRY_BACKOFF,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    InvalidPayload(#[from] InvalidPayloadError),

    #[error("{source} (after {attempts} attempt(s))")]
    Transport {
        source: TransportError,
        attempts: u32,
    },

    #[error("{source} (after {attempts} attempt(s))")]
    Protocol {
        source: ProtocolError,
        attempts: u32,
    },
}

impl DispatchError {
    /// Number of transport exchanges made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            DispatchError::InvalidPayload(_) => 0,
            DispatchError::Transport { attempts, .. } | DispatchError::Protocol { attempts, .. } => {
                *attempts
            }
        }
    }
}

enum ExchangeError {
    Transport(TransportError),
    Protocol(ProtocolError),
}

/// Owns the transport and the board handle for a session
pub struct Dispatcher<T: Transport> {
    transport: T,
    handle: BoardHandle,
    retry: RetryPolicy,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: T, handle: BoardHandle, retry: RetryPolicy) -> Self {
        Self {
            transport,
            handle,
            retry,
        }
    }

    pub fn handle(&self) -> BoardHandle {
        self.handle
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Point the dispatcher at a re-verified location (after an address change)
    pub fn rebind(&mut self, handle: BoardHandle) {
        self.handle = handle;
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Send a command with the session retry policy
    pub fn dispatch(&mut self, command: Command, payload: &[u8]) -> Result<ResponseFrame, DispatchError> {
        let policy = self.retry;
        self.dispatch_with(command, payload, &policy)
    }

    /// Send a command with an explicit retry policy
    pub fn dispatch_with(
        &mut self,
        command: Command,
        payload: &[u8],
        policy: &RetryPolicy,
    ) -> Result<ResponseFrame, DispatchError> {
        let frame = protocol::encode(command, payload)?;
        let max_attempts = policy.attempts.max(1);
        let location = self.handle.location;

        let mut attempts = 0;
        let mut protocol_retry_used = false;
        loop {
            attempts += 1;
            match self.exchange(command, &frame.payload) {
                Ok(response) => {
                    if attempts > 1 {
                        debug!(%command, attempts, "Command succeeded after retry");
                    }
                    return Ok(response);
                }
                Err(ExchangeError::Transport(e)) => {
                    if attempts >= max_attempts {
                        error!(%location, %command, attempts, "Transport error: {}", e);
                        return Err(DispatchError::Transport { source: e, attempts });
                    }
                    warn!(%location, %command, attempt = attempts, "Transport error, retrying: {}", e);
                }
                Err(ExchangeError::Protocol(e)) => {
                    if protocol_retry_used {
                        error!(%location, %command, attempts, "Protocol error: {}", e);
                        return Err(DispatchError::Protocol { source: e, attempts });
                    }
                    protocol_retry_used = true;
                    warn!(%location, %command, attempt = attempts, "Protocol error, retrying once: {}", e);
                }
            }
            thread::sleep(policy.backoff);
        }
    }

    /// One transport round trip, no retries
    fn exchange(&mut self, command: Command, payload: &[u8]) -> Result<ResponseFrame, ExchangeError> {
        let BusAddress { bus, address } = self.handle.location;

        if !command.is_read() {
            self.transport
                .write(bus, address, command.code(), payload)
                .map_err(ExchangeError::Transport)?;
            return Ok(ResponseFrame {
                command,
                payload: Vec::new(),
            });
        }

        let raw = self
            .transport
            .read(bus, address, command.code(), READ_LEN)
            .map_err(ExchangeError::Transport)?;
        protocol::decode(&raw, command).map_err(ExchangeError::Protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::protocol::ProtocolErrorKind;
    use crate::transport::sim::{CallKind, SimulatedBoard};

    const BOARD: BusAddress = BusAddress::new(1, 0x15);

    fn dispatcher(sim: &SimulatedBoard, attempts: u32, backoff_ms: u64) -> Dispatcher<SimulatedBoard> {
        let handle = BoardHandle {
            location: BOARD,
            board_id: protocol::BOARD_ID,
        };
        let policy = RetryPolicy {
            attempts,
            backoff: Duration::from_millis(backoff_ms),
        };
        Dispatcher::new(sim.clone(), handle, policy)
    }

    #[test]
    fn test_write_command_does_not_read() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let mut d = dispatcher(&sim, 3, 0);

        let response = d.dispatch(Command::SetMotorAForward, &[100]).unwrap();
        assert!(response.payload.is_empty());

        let calls = sim.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, CallKind::Write);
        assert_eq!(calls[0].data, vec![100]);
        assert_eq!(sim.motor_pwm(BOARD), [(1, 100), (0, 0)]);
    }

    #[test]
    fn test_invalid_payload_makes_no_calls() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        let mut d = dispatcher(&sim, 3, 0);

        let err = d.dispatch(Command::SetLeds, &[1]).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidPayload(_)));
        assert_eq!(err.attempts(), 0);
        assert!(sim.calls().is_empty());
    }

    #[test]
    fn test_recovers_from_transient_failure() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        sim.fail_next(2);
        let mut d = dispatcher(&sim, 3, 1);

        let response = d.dispatch(Command::GetId, &[]).unwrap();
        assert_eq!(response.byte(0), protocol::BOARD_ID);
        assert_eq!(sim.calls().len(), 3);
    }

    #[test]
    fn test_retry_exhaustion_counts_and_spacing() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        sim.fail_always(true);
        let backoff = Duration::from_millis(15);
        let mut d = dispatcher(&sim, 4, backoff.as_millis() as u64);

        let err = d.dispatch(Command::GetBatteryVoltage, &[]).unwrap_err();
        match err {
            DispatchError::Transport { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected error: {other:?}"),
        }

        let calls = sim.calls();
        assert_eq!(calls.len(), 4);
        for pair in calls.windows(2) {
            assert!(pair[1].at.duration_since(pair[0].at) >= backoff);
        }
    }

    #[test]
    fn test_protocol_error_retried_once() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        sim.corrupt_next(5);
        let mut d = dispatcher(&sim, 5, 0);

        let err = d.dispatch(Command::GetFailsafe, &[]).unwrap_err();
        match err {
            DispatchError::Protocol { attempts, source } => {
                assert_eq!(attempts, 2);
                assert!(matches!(source.kind, ProtocolErrorKind::CommandMismatch { .. }));
                assert_eq!(source.raw.len(), READ_LEN);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(sim.calls().len(), 2);
    }

    #[test]
    fn test_single_corrupt_frame_is_absorbed() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        sim.corrupt_next(1);
        let mut d = dispatcher(&sim, 3, 0);

        let response = d.dispatch(Command::GetFailsafe, &[]).unwrap();
        assert_eq!(response.byte(0), 0);
    }

    #[test]
    fn test_corrupt_frame_retried_with_single_attempt_policy() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        sim.corrupt_next(1);
        let mut d = dispatcher(&sim, 1, 0);

        let response = d.dispatch(Command::GetId, &[]).unwrap();
        assert_eq!(response.byte(0), protocol::BOARD_ID);
        assert_eq!(sim.calls().len(), 2);
    }

    #[test]
    fn test_explicit_policy_overrides_session_policy() {
        let sim = SimulatedBoard::new().with_board(BOARD);
        sim.fail_always(true);
        let mut d = dispatcher(&sim, 5, 0);

        let once = RetryPolicy {
            attempts: 1,
            backoff: Duration::ZERO,
        };
        let err = d.dispatch_with(Command::AllOff, &[0], &once).unwrap_err();
        assert_eq!(err.attempts(), 1);
    }
}
