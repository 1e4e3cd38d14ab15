//! The signing daemon: one process owns the unlocked token sessions and
//! serves signing requests from unprivileged clients over a local socket.
//!
//! Scheduling is single-threaded and cooperative over `poll`. Every accepted
//! connection becomes one more pollable descriptor; requests are serviced in
//! arrival order and nothing runs concurrently, so the unlocked-token
//! registry needs no locking. A malformed request costs the offending peer
//! its connection and nothing else.

pub mod fdpass;
pub mod proto;

use std::collections::BTreeSet;
use std::fs;
use std::io::{Read, Seek, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::socket::{bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use nix::unistd::{chdir, setgid, setgroups, setuid, User};
use scroll::Pread;

use crate::alg::DigestAlgorithm;
use crate::cms::{self, oids, SignatureMode, SigningIdentity};
use crate::error;
use crate::kmod;
use crate::provider::{KeyProvider, Pin};

use proto::{BodyReader, Command, MsgHeader, PROTOCOL_VERSION, SIZEOF_MSG_HEADER};

/// Where clients look for the daemon.
pub const SOCKET_PATH: &str = "/var/run/pesign/socket";
/// ASCII decimal pid, trailing newline.
pub const PIDFILE_PATH: &str = "/var/run/pesign.pid";
/// The dedicated service user the daemon drops to.
pub const SERVICE_USER: &str = "pesign";

const LISTEN_BACKLOG: i32 = 5;
/// Upper bound on a command body; real bodies are a few hundred bytes.
const MAX_BODY: u32 = 64 * 1024;

/// Set by the signal handlers; consulted before and after every poll.
pub static SHOULD_EXIT: AtomicBool = AtomicBool::new(false);

extern "C" fn quit_handler(_signal: i32) {
    SHOULD_EXIT.store(true, Ordering::SeqCst);
}

/// Route SIGTERM, SIGINT, and SIGQUIT into an orderly shutdown.
pub fn install_signal_handlers() -> error::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(quit_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGQUIT] {
        unsafe { sigaction(signal, &action) }.map_err(nix_io)?;
    }
    Ok(())
}

fn nix_io(err: nix::Error) -> error::Error {
    error::Error::IO(std::io::Error::from_raw_os_error(err as i32))
}

/// Immutable daemon configuration; request handlers borrow from it.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    /// Written before privileges drop; `None` skips the pidfile.
    pub pidfile: Option<PathBuf>,
    /// User to drop to before accepting; `None` keeps the invoking user
    /// (tests run this way).
    pub service_user: Option<String>,
    /// Content-hash algorithm for signatures this daemon produces.
    pub default_digest: DigestAlgorithm,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            socket_path: PathBuf::from(SOCKET_PATH),
            pidfile: Some(PathBuf::from(PIDFILE_PATH)),
            service_user: Some(SERVICE_USER.to_string()),
            default_digest: DigestAlgorithm::Sha256,
        }
    }
}

impl DaemonConfig {
    /// A configuration for running inside a test: temp socket, no pidfile,
    /// no privilege drop.
    pub fn unprivileged(socket_path: impl Into<PathBuf>) -> Self {
        DaemonConfig {
            socket_path: socket_path.into(),
            pidfile: None,
            service_user: None,
            default_digest: DigestAlgorithm::Sha256,
        }
    }
}

enum Disposition {
    Keep,
    Close,
}

pub struct Daemon {
    config: DaemonConfig,
    provider: Box<dyn KeyProvider>,
    /// Tokens authenticated in this process. Sticky: entries are never
    /// removed before exit.
    unlocked: BTreeSet<String>,
    should_exit: bool,
}

impl Daemon {
    pub fn new(config: DaemonConfig, provider: Box<dyn KeyProvider>) -> Self {
        Daemon {
            config,
            provider,
            unlocked: BTreeSet::new(),
            should_exit: false,
        }
    }

    /// Bind, drop privileges, and serve until a KILL_DAEMON command or a
    /// termination signal arrives.
    pub fn run(&mut self) -> error::Result<()> {
        oids::register();
        check_socket(&self.config.socket_path)?;
        let listener = bind_socket(&self.config.socket_path)?;
        if let Some(pidfile) = self.config.pidfile.clone() {
            write_pidfile(&pidfile)?;
        }
        if let Some(user) = self.config.service_user.clone() {
            drop_privileges(&user)?;
        }
        info!("signing daemon starting (pid {})", std::process::id());

        let result = self.serve(&listener);
        self.shutdown();
        result
    }

    fn serve(&mut self, listener: &UnixListener) -> error::Result<()> {
        let mut connections: Vec<UnixStream> = Vec::new();
        loop {
            if self.should_exit || SHOULD_EXIT.load(Ordering::SeqCst) {
                return Ok(());
            }

            let events = {
                let mut pollfds = Vec::with_capacity(connections.len() + 1);
                pollfds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
                for connection in &connections {
                    pollfds.push(PollFd::new(
                        connection.as_fd(),
                        PollFlags::POLLIN | PollFlags::POLLPRI,
                    ));
                }
                match poll(&mut pollfds, PollTimeout::NONE) {
                    Ok(_) => (),
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(err) => {
                        warn!("poll: {err}");
                        continue;
                    }
                }
                pollfds
                    .iter()
                    .map(|pfd| pfd.revents().unwrap_or(PollFlags::empty()))
                    .collect::<Vec<_>>()
            };
            if self.should_exit || SHOULD_EXIT.load(Ordering::SeqCst) {
                return Ok(());
            }

            if events[0].contains(PollFlags::POLLIN) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        debug!("accepted client connection");
                        connections.push(stream);
                        // re-poll; pending events come right back
                        continue;
                    }
                    Err(err) => warn!("accept failed: {err}"),
                }
            }

            let mut keep = vec![true; connections.len()];
            for (index, revents) in events.iter().skip(1).enumerate() {
                if index >= connections.len() {
                    break;
                }
                let hangup = revents
                    .intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL);
                let readable = revents.intersects(PollFlags::POLLIN | PollFlags::POLLPRI);
                if readable {
                    if let Disposition::Close = self.service_connection(&mut connections[index]) {
                        keep[index] = false;
                    }
                } else if hangup {
                    keep[index] = false;
                }
            }
            let mut kept = keep.into_iter();
            connections.retain(|_| kept.next().unwrap_or(false));
        }
    }

    fn shutdown(&mut self) {
        let _ = fs::remove_file(&self.config.socket_path);
        if let Some(pidfile) = &self.config.pidfile {
            let _ = fs::remove_file(pidfile);
        }
        info!("signing daemon exiting (pid {})", std::process::id());
    }

    /// One request on one connection, start to finish.
    fn service_connection(&mut self, stream: &mut UnixStream) -> Disposition {
        let mut header_bytes = [0u8; SIZEOF_MSG_HEADER];
        if stream.read_exact(&mut header_bytes).is_err() {
            // hung up between requests
            return Disposition::Close;
        }
        let header: MsgHeader = (&header_bytes[..])
            .pread_with(0, scroll::LE)
            .expect("fixed-size header always parses");

        if header.version != PROTOCOL_VERSION {
            error!(
                "got version 0x{:x}, expected version 0x{:x}",
                header.version, PROTOCOL_VERSION
            );
            error!("possible exploit attempt. closing.");
            return Disposition::Close;
        }
        if header.size > MAX_BODY {
            error!("got message with invalid size {}", header.size);
            error!("possible exploit attempt. closing.");
            return Disposition::Close;
        }
        let command = match Command::try_from(header.command) {
            Ok(Command::Response) => {
                error!("got unexpected command 0x{:x}", header.command);
                error!("possible exploit attempt. closing.");
                return Disposition::Close;
            }
            Ok(command) => command,
            Err(_) => {
                error!("got unexpected command 0x{:x}", header.command);
                error!("possible exploit attempt. closing.");
                return Disposition::Close;
            }
        };

        let mut body = vec![0u8; header.size as usize];
        if stream.read_exact(&mut body).is_err() {
            error!("{}: invalid data", proto::command_name(command));
            error!("possible exploit attempt. closing.");
            return Disposition::Close;
        }

        match self.dispatch(command, &body, stream) {
            Ok(disposition) => disposition,
            Err(err) => {
                error!("{}: {err}", proto::command_name(command));
                error!("possible exploit attempt. closing.");
                Disposition::Close
            }
        }
    }

    /// Protocol errors bubble out as `Err` and close the connection without
    /// a response; request-scoped failures are answered with an `rc` and a
    /// message.
    fn dispatch(
        &mut self,
        command: Command,
        body: &[u8],
        stream: &mut UnixStream,
    ) -> error::Result<Disposition> {
        match command {
            Command::KillDaemon => {
                BodyReader::new(body).finish()?;
                info!("shutdown requested");
                self.should_exit = true;
                Ok(Disposition::Keep)
            }
            Command::UnlockToken => {
                let mut reader = BodyReader::new(body);
                let token = reader.read_string()?;
                let pin = Pin::new(reader.read_string()?);
                reader.finish()?;
                info!("unlocking token \"{token}\"");
                let (rc, errmsg) = match self.unlock_token(&token, &pin) {
                    Ok(()) => (0, None),
                    Err(err) => (err.response_code(), Some(err.to_string())),
                };
                self.respond(stream, rc, errmsg.as_deref())
            }
            Command::IsTokenUnlocked => {
                let mut reader = BodyReader::new(body);
                let token = reader.read_string()?;
                reader.finish()?;
                let unlocked = self.unlocked.contains(&token);
                info!(
                    "token \"{token}\" is {}unlocked",
                    if unlocked { "" } else { "not " }
                );
                self.respond(stream, if unlocked { 0 } else { 1 }, None)
            }
            Command::GetCmdVersion => {
                let mut reader = BodyReader::new(body);
                let queried = reader.read_u32()?;
                reader.finish()?;
                let version = proto::command_version(queried);
                debug!("cmd-version: command {queried} -> {version}");
                self.respond(stream, version, None)
            }
            Command::SignAttached | Command::SignDetached => {
                let mut reader = BodyReader::new(body);
                let file_format = reader.read_u32()?;
                let token = reader.read_string()?;
                let certificate = reader.read_string()?;
                reader.finish()?;

                let in_fd = fdpass::receive_fd(stream.as_raw_fd())?;
                let out_fd = fdpass::receive_fd(stream.as_raw_fd())?;

                info!("attempting to sign with key \"{token}:{certificate}\"");
                let mode = if command == Command::SignAttached {
                    SignatureMode::Attached
                } else {
                    SignatureMode::Detached
                };
                let (rc, errmsg) =
                    match self.sign(file_format, &token, &certificate, in_fd, out_fd, mode) {
                        Ok(()) => (0, None),
                        Err(err) => {
                            warn!("signing failed: {err}");
                            (err.response_code(), Some(err.to_string()))
                        }
                    };
                self.respond(stream, rc, errmsg.as_deref())
            }
            Command::Response => Err(error::Error::Protocol(
                "response is a server-to-client command".into(),
            )),
        }
    }

    fn unlock_token(&mut self, token_name: &str, pin: &Pin) -> error::Result<()> {
        let token = self.provider.find_token(token_name)?;
        self.provider.authenticate(&token, pin)?;
        info!("authentication succeeded for token \"{token_name}\"");
        self.unlocked.insert(token_name.to_string());
        Ok(())
    }

    fn sign(
        &mut self,
        file_format: u32,
        token: &str,
        certificate: &str,
        in_fd: OwnedFd,
        out_fd: OwnedFd,
        mode: SignatureMode,
    ) -> error::Result<()> {
        // Signing never prompts; it rides on the session the unlock handler
        // authenticated.
        if !self.unlocked.contains(token) {
            return Err(error::Error::NotFound(format!(
                "unlocked session for token \"{token}\""
            )));
        }

        let mut input_file = fs::File::from(in_fd);
        input_file.rewind()?;
        let mut input = Vec::new();
        input_file.read_to_end(&mut input)?;
        let mut output = fs::File::from(out_fd);

        let identity = SigningIdentity {
            token,
            certificate,
            digest: self.config.default_digest,
        };
        match file_format {
            proto::FORMAT_PE_BINARY => {
                cms::sign_pe(self.provider.as_mut(), &identity, &input, &mut output, mode)
            }
            proto::FORMAT_KERNEL_MODULE => {
                kmod::sign_module(self.provider.as_mut(), &identity, &input, &mut output, mode)
            }
            other => Err(error::Error::UnknownFormat(other)),
        }
        // both descriptors close here, success or failure
    }

    fn respond(
        &mut self,
        stream: &mut UnixStream,
        rc: i32,
        errmsg: Option<&str>,
    ) -> error::Result<Disposition> {
        let response = proto::encode_response(rc, errmsg);
        if let Err(err) = stream.write_all(&response) {
            warn!("could not send response to client: {err}");
            return Ok(Disposition::Close);
        }
        Ok(Disposition::Keep)
    }
}

/// Refuse to start when a live daemon already owns the socket; clean up a
/// stale one.
fn check_socket(path: &Path) -> error::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if let Ok(stream) = UnixStream::connect(path) {
        if stream.peer_addr().is_ok() {
            return Err(error::Error::AlreadyRunning);
        }
    }
    // nobody answered; blindly remove the leftover
    let _ = fs::remove_file(path);
    Ok(())
}

fn bind_socket(path: &Path) -> error::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .map_err(nix_io)?;
    let addr = UnixAddr::new(path).map_err(nix_io)?;
    bind(fd.as_raw_fd(), &addr).map_err(nix_io)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o660))?;
    listen(&fd, Backlog::new(LISTEN_BACKLOG).map_err(nix_io)?).map_err(nix_io)?;
    Ok(UnixListener::from(fd))
}

fn write_pidfile(path: &Path) -> error::Result<()> {
    fs::write(path, format!("{}\n", std::process::id()))?;
    Ok(())
}

/// Resolve the service user, refuse uid/gid 0, drop supplementary groups,
/// then gid, then uid, and move to the service home.
fn drop_privileges(username: &str) -> error::Result<()> {
    let user = User::from_name(username)
        .map_err(nix_io)?
        .ok_or_else(|| error::Error::Privilege(format!("no such user \"{username}\"")))?;
    if user.uid.is_root() || user.gid.as_raw() == 0 {
        return Err(error::Error::Privilege(format!(
            "cowardly refusing to run with uid = {} and gid = {}",
            user.uid, user.gid
        )));
    }
    let home = if user.dir.as_os_str().is_empty() {
        PathBuf::from("/")
    } else {
        user.dir.clone()
    };
    chdir(&home).map_err(nix_io)?;
    if nix::unistd::Uid::effective().is_root() {
        setgroups(&[]).map_err(|e| error::Error::Privilege(e.to_string()))?;
        setgid(user.gid).map_err(|e| error::Error::Privilege(e.to_string()))?;
        setuid(user.uid).map_err(|e| error::Error::Privilege(e.to_string()))?;
    }
    Ok(())
}
