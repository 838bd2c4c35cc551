use failure::Fail;

pub type Result<T> = std::result::Result<T, Error>;
pub type Error = failure::Error;

/// Failure modes of the UDP transport: binding, sending, and matching
/// responses to outstanding transactions. Matches the teacher crate's
/// per-module `ErrorKind` + `failure::Error` pattern.
#[derive(Debug, Fail)]
pub enum ErrorKind {
    #[fail(display = "failed to bind UDP socket on port {}: {}", port, cause)]
    BindFailed { port: u16, cause: String },

    #[fail(display = "failed to send datagram to {}: {}", to, cause)]
    SendFailed { to: String, cause: String },

    #[fail(display = "failed to encode outgoing message: {}", cause)]
    EncodeFailed { cause: String },

    #[fail(display = "transaction id already in use, try again")]
    DuplicateTransaction,

    #[fail(display = "no free transaction id found after {} attempts", attempts)]
    TransactionIdExhausted { attempts: u32 },

    #[fail(display = "query timed out waiting for a response")]
    Timeout,

    #[fail(display = "transaction was cancelled before a response arrived")]
    Cancelled,

    #[fail(display = "remote returned protocol error {}: {}", code, message)]
    RemoteError { code: i64, message: String },

    #[fail(display = "response did not match the query that was sent")]
    UnexpectedReply,
}
