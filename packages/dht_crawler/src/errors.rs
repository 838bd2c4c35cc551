use failure::Fail;

pub type Result<T> = std::result::Result<T, Error>;
pub type Error = failure::Error;

/// Error kinds of §7. Wire-level failures (`InvalidBencode`,
/// `MalformedMessage`, `UnknownMethod`, `BadToken`) are absorbed inside the
/// receive loop and never surface here — these variants exist so they can
/// be logged and counted, not returned to the application.
#[derive(Debug, Fail)]
pub enum ErrorKind {
    #[fail(display = "invalid bencode on the wire")]
    InvalidBencode,

    #[fail(display = "message is missing a required field")]
    MalformedMessage,

    #[fail(display = "unknown query method")]
    UnknownMethod,

    #[fail(display = "announce_peer token did not verify")]
    BadToken,

    #[fail(display = "socket error: {}", cause)]
    SocketError { cause: String },

    #[fail(display = "bootstrap failed: no seed replied and no nodes were discovered")]
    BootstrapFailed,

    #[fail(display = "session already running")]
    AlreadyRunning,

    #[fail(display = "failed to bind: {}", cause)]
    BindFailed { cause: String },

    #[fail(display = "announce_peer failed: {}", cause)]
    AnnounceFailed { cause: String },
}
