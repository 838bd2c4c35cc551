use failure::Fail;

pub type Result<T> = std::result::Result<T, Error>;
pub type Error = failure::Error;

/// Failure modes specific to identifiers, endpoints, and the KRPC wire
/// codec. Wrapped in `failure::Error` so callers can `.downcast_ref` when
/// they need to distinguish kinds, matching the error style used throughout
/// the teacher crate's `errors` modules.
#[derive(Debug, Fail)]
pub enum ErrorKind {
    #[fail(display = "node id must be 40 hex characters, got {} characters", len)]
    InvalidNodeIdLength { len: usize },

    #[fail(display = "node id is not valid hex")]
    InvalidNodeIdHex,

    #[fail(display = "endpoint address is invalid: {}", address)]
    InvalidAddress { address: String },

    #[fail(display = "endpoint port must not be zero")]
    ZeroPort,

    #[fail(display = "endpoint address must not be a wildcard address")]
    WildcardAddress,

    #[fail(display = "failed to resolve host {}: {}", host, cause)]
    ResolveFailed { host: String, cause: String },

    #[fail(display = "bencode decode error: {}", cause)]
    DecodeError { cause: String },

    #[fail(display = "bencode encode error: {}", cause)]
    EncodeError { cause: String },
}
