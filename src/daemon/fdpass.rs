//! SCM_RIGHTS descriptor passing.
//!
//! A signing request is followed by two single-descriptor control messages
//! (input file, then output file). The data portion is a bounded two-byte
//! placeholder; anything other than exactly one descriptor per message is
//! treated as a hostile peer.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};

use crate::error;

/// Receive exactly one descriptor from `socket`.
pub fn receive_fd(socket: RawFd) -> error::Result<OwnedFd> {
    let mut placeholder = [0u8; 2];
    let mut iov = [IoSliceMut::new(&mut placeholder)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
    let message = recvmsg::<UnixAddr>(
        socket,
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )
    .map_err(|e| error::Error::Protocol(format!("recvmsg failed: {e}")))?;

    for cmsg in message
        .cmsgs()
        .map_err(|e| error::Error::Protocol(format!("control message walk failed: {e}")))?
    {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                // the kernel installed the descriptor in our table; own it
                return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    Err(error::Error::Protocol(
        "message carried no descriptor".into(),
    ))
}

/// Send one descriptor over `socket`; the client half of [`receive_fd`].
pub fn send_fd(socket: RawFd, fd: BorrowedFd<'_>) -> error::Result<()> {
    let placeholder = [0u8; 2];
    let iov = [IoSlice::new(&placeholder)];
    let fds = [fd.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<UnixAddr>(socket, &iov, &cmsg, MsgFlags::empty(), None)
        .map_err(|e| error::Error::Protocol(format!("sendmsg failed: {e}")))?;
    Ok(())
}
