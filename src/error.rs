use std::fmt;
use std::io;

use serde_json::Error as JSONError;

use crate::messages::Reason;

use super::{CallError, ErrorType, ID};

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
}

#[derive(Debug)]
pub enum ErrorKind {
    /// A peer sent a message that is not legal in its current handshake
    /// state (e.g. CALL before HELLO/WELCOME completed).
    InvalidState(&'static str),
    /// The realm rejected the session during HELLO/WELCOME.
    HandshakeError(Reason),
    /// A CALL-chain (CALL/INVOCATION/YIELD/RESULT) failed with a WAMP
    /// error reason that needs to be relayed back to the caller as ERROR.
    ErrorReason(ErrorType, ID, Reason),
    /// A message could not be decoded off the wire.
    MalformedMessage(JSONError),
    /// The peer's outbound link is gone (socket closed, task dropped).
    Io(String),
}

impl Error {
    pub fn new(kind: ErrorKind) -> Error {
        Error { kind }
    }

    fn get_description(&self) -> String {
        format!("WAMP Error: {}", self.kind.description())
    }

    #[inline]
    pub fn get_kind(self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get_description())
    }
}

impl std::error::Error for Error {}

impl ErrorKind {
    pub fn description(&self) -> String {
        match *self {
            ErrorKind::InvalidState(s) => s.to_string(),
            ErrorKind::HandshakeError(ref r) => r.to_string(),
            ErrorKind::ErrorReason(_, _, ref r) => r.to_string(),
            ErrorKind::MalformedMessage(ref e) => e.to_string(),
            ErrorKind::Io(ref s) => s.clone(),
        }
    }
}

impl From<JSONError> for Error {
    fn from(e: JSONError) -> Error {
        Error::new(ErrorKind::MalformedMessage(e))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::new(ErrorKind::Io(e.to_string()))
    }
}

impl From<CallError> for Error {
    fn from(e: CallError) -> Error {
        let (reason, _, _) = e.into_tuple();
        Error::new(ErrorKind::HandshakeError(reason))
    }
}
