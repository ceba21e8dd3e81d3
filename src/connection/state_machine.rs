// src/connection/state_machine.rs

//! The per-connection Bolt protocol state machine.
//!
//! Every reply a connection emits goes through [`step`], which validates
//! the `(state, request, response)` triple and yields the next state.
//! Keeping the whole transition relation in one table makes it directly
//! testable and removes the duplicated RESET/GOODBYE handling a
//! per-state dispatch would need.

use crate::core::BoltGateError;
use crate::core::protocol::{RequestType, ResponseType};

/// The protocol phase of a single client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolState {
    /// Waiting for the version handshake and HELLO.
    Negotiation,
    /// HELLO accepted, waiting for LOGON.
    Authentication,
    /// Authenticated and idle.
    Ready,
    /// An autocommit query holds an open result stream.
    Streaming,
    /// Inside an explicit transaction, no open stream.
    TxReady,
    /// Inside an explicit transaction with an open result stream.
    TxStreaming,
    /// A request failed; data requests are ignored until RESET.
    Failed,
    /// A RESET arrived while work was in flight; pending requests drain
    /// as IGNORED until the RESET itself is answered.
    Interrupted,
    /// Terminal. The connection must be torn down.
    Defunct,
}

/// Computes the state after answering `request` with `response` while in
/// `state`. `Record` responses are intermediate stream items and never
/// change state. An illegal triple is a caller bug: replies are only
/// produced through this function, so legality is enforced at the single
/// point of emission.
pub fn step(
    state: ProtocolState,
    request: RequestType,
    response: ResponseType,
) -> Result<ProtocolState, BoltGateError> {
    use ProtocolState::*;
    use RequestType::*;
    use ResponseType::*;

    if response == Record {
        return Ok(state);
    }

    let next = match (state, request, response) {
        (Negotiation, Hello, Success) => Authentication,
        (Negotiation, Hello, Failure) => Defunct,

        (Authentication, Logon, Success) => Ready,
        (Authentication, Logon, Failure) => Defunct,

        (Ready, Logoff, Success) => Authentication,
        (Ready, Logoff, Failure) => Failed,
        (Ready, Run, Success) => Streaming,
        (Ready, Run, Failure) => Failed,
        (Ready, Begin, Success) => TxReady,
        (Ready, Begin, Failure) => Failed,
        (Ready, Route, Success) => Ready,

        (Streaming, Pull | Discard, Success) => Ready,
        (Streaming, Pull | Discard, Failure) => Failed,

        (TxReady, Run, Success) => TxStreaming,
        (TxReady, Run, Failure) => Failed,
        (TxReady, Commit | Rollback, Success) => Ready,
        (TxReady, Commit | Rollback, Failure) => Failed,

        (TxStreaming, Run | Pull, Success) => TxStreaming,
        (TxStreaming, Run | Pull, Failure) => Failed,
        (TxStreaming, Commit, Success) => Ready,
        (TxStreaming, Commit, Failure) => Failed,
        (TxStreaming, Discard, Success) => TxReady,
        (TxStreaming, Discard, Failure) => Failed,

        (Failed, Run | Pull | Discard, Ignored) => Failed,

        (Interrupted, Run | Pull | Discard | Begin | Commit | Rollback, Ignored) => Failed,
        (Interrupted, Reset, Success) => Ready,
        (Interrupted, Reset, Failure) => Defunct,

        (Ready | Streaming | TxReady | TxStreaming | Failed, Reset, _) => Ready,
        (Ready | Streaming | TxReady | TxStreaming | Failed | Interrupted, Goodbye, _) => Defunct,

        (state, request, response) => {
            return Err(BoltGateError::IllegalTransition {
                state,
                request,
                response,
            });
        }
    };
    Ok(next)
}

/// True when `request` has any legal response in `state` — the check the
/// dispatcher uses to turn an out-of-place request into a FAILURE reply
/// instead of a torn-down connection.
pub fn request_allowed(state: ProtocolState, request: RequestType) -> bool {
    [
        ResponseType::Success,
        ResponseType::Failure,
        ResponseType::Ignored,
    ]
    .iter()
    .any(|&response| step(state, request, response).is_ok())
}
