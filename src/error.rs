//! A custom error type shared by the PE layer, the CMS builder, the key
//! provider, and the daemon.

use core::fmt;
use core::result;

#[derive(Debug)]
/// A custom error
#[non_exhaustive]
pub enum Error {
    /// The binary's magic is bad
    BadMagic(u64),
    /// An entity (PE image, kernel module, wire message body) is malformed
    Malformed(String),
    /// A buffer is too short to hold the requested number of entities
    BufferTooShort(usize, &'static str),
    /// A peer violated the socket framing rules; the connection must be
    /// closed without a response
    Protocol(String),
    /// A token or certificate was not found
    NotFound(String),
    /// More than one certificate matched a nickname
    Ambiguous(String),
    /// The token rejected the supplied PIN
    AuthFailed(String),
    /// A digest, signing, or encoding primitive failed
    Crypto(String),
    /// A signing request named a file format the service does not know
    UnknownFormat(u32),
    /// Another daemon instance already owns the socket
    AlreadyRunning,
    /// The daemon could not drop to the service user
    Privilege(String),
    /// An IO based error
    IO(std::io::Error),
    /// Error from the scroll crate
    Scroll(scroll::Error),
    /// Error from the der crate
    Der(der::Error),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IO(io) => io.source(),
            Error::Scroll(scroll) => scroll.source(),
            Error::Der(der) => der.source(),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::IO(err)
    }
}

impl From<scroll::Error> for Error {
    fn from(err: scroll::Error) -> Error {
        Error::Scroll(err)
    }
}

impl From<der::Error> for Error {
    fn from(err: der::Error) -> Error {
        Error::Der(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::BadMagic(magic) => write!(fmt, "invalid magic number: 0x{magic:x}"),
            Error::Malformed(msg) => write!(fmt, "malformed entity: {msg}"),
            Error::BufferTooShort(n, item) => write!(fmt, "buffer is too short for {n} {item}"),
            Error::Protocol(msg) => write!(fmt, "protocol violation: {msg}"),
            Error::NotFound(what) => write!(fmt, "{what} not found"),
            Error::Ambiguous(what) => write!(fmt, "more than one certificate matches \"{what}\""),
            Error::AuthFailed(token) => write!(fmt, "authentication failed for token \"{token}\""),
            Error::Crypto(msg) => write!(fmt, "crypto operation failed: {msg}"),
            Error::UnknownFormat(fmt_code) => write!(fmt, "unrecognised format {fmt_code}"),
            Error::AlreadyRunning => write!(fmt, "already running"),
            Error::Privilege(msg) => write!(fmt, "unable to drop privileges: {msg}"),
            Error::IO(err) => write!(fmt, "{err}"),
            Error::Scroll(err) => write!(fmt, "{err}"),
            Error::Der(err) => write!(fmt, "{err}"),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    /// The daemon response code a request-scoped failure maps to. Token and
    /// certificate lookups answer `-1`, PIN rejection `-2`, everything else
    /// that still deserves a response `-3`.
    pub fn response_code(&self) -> i32 {
        match self {
            Error::NotFound(_) => -1,
            Error::AuthFailed(_) => -2,
            _ => -3,
        }
    }
}
