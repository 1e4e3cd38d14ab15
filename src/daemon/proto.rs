//! Wire framing for the signing socket.
//!
//! Every message is a 12-byte little-endian header `(version, command,
//! size)` followed by exactly `size` body bytes. Strings inside bodies are
//! `(size u32, bytes)` where `size` counts a mandatory trailing NUL. A
//! handler must consume a body completely; leftover or missing bytes mean
//! the peer is not speaking this protocol and the connection is dropped.

use scroll::{Pread, Pwrite, SizeWith};

use crate::error;

/// Protocol magic; any other value closes the connection.
pub const PROTOCOL_VERSION: u32 = 0x2A9E_DAF0;

/// Body value selecting PE image signing.
pub const FORMAT_PE_BINARY: u32 = 0;
/// Body value selecting kernel-module signing.
pub const FORMAT_KERNEL_MODULE: u32 = 1;

#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Pread, Pwrite, SizeWith)]
pub struct MsgHeader {
    pub version: u32,
    pub command: u32,
    pub size: u32,
}

pub const SIZEOF_MSG_HEADER: usize = 12;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u32)]
pub enum Command {
    KillDaemon = 0,
    UnlockToken = 1,
    SignAttached = 2,
    SignDetached = 3,
    Response = 4,
    IsTokenUnlocked = 5,
    GetCmdVersion = 6,
}

impl TryFrom<u32> for Command {
    type Error = error::Error;

    fn try_from(value: u32) -> error::Result<Self> {
        Ok(match value {
            0 => Command::KillDaemon,
            1 => Command::UnlockToken,
            2 => Command::SignAttached,
            3 => Command::SignDetached,
            4 => Command::Response,
            5 => Command::IsTokenUnlocked,
            6 => Command::GetCmdVersion,
            other => {
                return Err(error::Error::Protocol(format!(
                    "unexpected command 0x{other:x}"
                )))
            }
        })
    }
}

/// Command metadata: name for the logs, version for GET_CMD_VERSION.
pub const COMMAND_TABLE: &[(Command, &str, i32)] = &[
    (Command::KillDaemon, "kill-daemon", 0),
    (Command::UnlockToken, "unlock-token", 0),
    (Command::SignAttached, "sign-attached", 0),
    (Command::SignDetached, "sign-detached", 0),
    (Command::Response, "response", 0),
    (Command::IsTokenUnlocked, "is-token-unlocked", 0),
    (Command::GetCmdVersion, "get-cmd-version", 0),
];

/// The version of a wire command, or -1 when the code is unknown.
pub fn command_version(code: u32) -> i32 {
    COMMAND_TABLE
        .iter()
        .find(|(cmd, _, _)| *cmd as u32 == code)
        .map(|(_, _, version)| *version)
        .unwrap_or(-1)
}

pub fn command_name(command: Command) -> &'static str {
    COMMAND_TABLE
        .iter()
        .find(|(cmd, _, _)| *cmd == command)
        .map(|(_, name, _)| *name)
        .unwrap_or("unknown")
}

/// Strict body reader: every field is accounted for and [`finish`]
/// (BodyReader::finish) fails unless the body was consumed exactly.
pub struct BodyReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> BodyReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        BodyReader { bytes, offset: 0 }
    }

    pub fn read_u32(&mut self) -> error::Result<u32> {
        self.bytes
            .gread_with(&mut self.offset, scroll::LE)
            .map_err(|_| error::Error::Protocol("body is short of a u32 field".into()))
    }

    /// A `(size, bytes)` string; `size` includes the trailing NUL, which
    /// must be present.
    pub fn read_string(&mut self) -> error::Result<String> {
        let size = self.read_u32()? as usize;
        if size == 0 {
            return Err(error::Error::Protocol("string with no terminator".into()));
        }
        let bytes = self
            .bytes
            .get(self.offset..self.offset + size)
            .ok_or_else(|| error::Error::Protocol("string runs past the body".into()))?;
        self.offset += size;
        if bytes[size - 1] != 0 {
            return Err(error::Error::Protocol("string is not NUL-terminated".into()));
        }
        String::from_utf8(bytes[..size - 1].to_vec())
            .map_err(|_| error::Error::Protocol("string is not UTF-8".into()))
    }

    /// The body must be fully consumed at this point.
    pub fn finish(self) -> error::Result<()> {
        if self.offset != self.bytes.len() {
            return Err(error::Error::Protocol(format!(
                "{} trailing bytes after the last field",
                self.bytes.len() - self.offset
            )));
        }
        Ok(())
    }
}

fn header_bytes(command: u32, size: u32) -> Vec<u8> {
    let mut buf = vec![0u8; SIZEOF_MSG_HEADER];
    buf.pwrite_with(
        MsgHeader {
            version: PROTOCOL_VERSION,
            command,
            size,
        },
        0,
        scroll::LE,
    )
    .expect("header buffer is sized for the header");
    buf
}

/// Append a wire string to a body under construction.
pub fn put_string(body: &mut Vec<u8>, value: &str) {
    let size = (value.len() + 1) as u32;
    body.extend_from_slice(&size.to_le_bytes());
    body.extend_from_slice(value.as_bytes());
    body.push(0);
}

/// A complete framed request, for clients and tests.
pub fn encode_request(command: Command, body: &[u8]) -> Vec<u8> {
    let mut message = header_bytes(command as u32, body.len() as u32);
    message.extend_from_slice(body);
    message
}

/// The framed response: `rc` plus an optional NUL-terminated message.
pub fn encode_response(rc: i32, errmsg: Option<&str>) -> Vec<u8> {
    let errlen = errmsg.map(|msg| msg.len() + 1).unwrap_or(0);
    let mut message = header_bytes(Command::Response as u32, (4 + errlen) as u32);
    message.extend_from_slice(&rc.to_le_bytes());
    if let Some(msg) = errmsg {
        message.extend_from_slice(msg.as_bytes());
        message.push(0);
    }
    message
}

/// Split a response body into `(rc, errmsg)`.
pub fn decode_response(body: &[u8]) -> error::Result<(i32, Option<String>)> {
    if body.len() < 4 {
        return Err(error::Error::Protocol("response body is short".into()));
    }
    let rc = i32::from_le_bytes(body[..4].try_into().expect("length checked"));
    let errmsg = if body.len() > 4 {
        let msg = &body[4..];
        if msg.last() != Some(&0) {
            return Err(error::Error::Protocol(
                "response message is not NUL-terminated".into(),
            ));
        }
        Some(
            String::from_utf8(msg[..msg.len() - 1].to_vec())
                .map_err(|_| error::Error::Protocol("response message is not UTF-8".into()))?,
        )
    } else {
        None
    };
    Ok((rc, errmsg))
}
