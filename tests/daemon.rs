//! Daemon protocol end-to-end over a temp socket: framing, the
//! unlocked-token registry, descriptor passing, and hostile-peer handling.

mod common;

use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use efisign::alg::DigestAlgorithm;
use efisign::daemon::proto::{
    self, Command, FORMAT_KERNEL_MODULE, FORMAT_PE_BINARY, SIZEOF_MSG_HEADER,
};
use efisign::daemon::{fdpass, Daemon, DaemonConfig};
use efisign::kmod::MODULE_MAGIC;
use efisign::pe::PeImage;

use common::{build_pe, SoftToken, CERT_NICKNAME, TOKEN_NAME};

struct TestDaemon {
    socket_path: PathBuf,
    handle: Option<JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

impl TestDaemon {
    fn start(pin: Option<&'static str>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("socket");
        let config = DaemonConfig::unprivileged(&socket_path);
        let handle = thread::spawn(move || {
            let provider = SoftToken::new(pin);
            Daemon::new(config, Box::new(provider))
                .run()
                .expect("daemon run");
        });
        wait_for_socket(&socket_path);
        TestDaemon {
            socket_path,
            handle: Some(handle),
            _dir: dir,
        }
    }

    fn connect(&self) -> UnixStream {
        UnixStream::connect(&self.socket_path).unwrap()
    }

    fn kill(mut self) {
        let mut stream = self.connect();
        stream
            .write_all(&proto::encode_request(Command::KillDaemon, &[]))
            .unwrap();
        self.handle.take().unwrap().join().unwrap();
        assert!(!self.socket_path.exists(), "socket removed at shutdown");
    }
}

fn wait_for_socket(path: &Path) {
    for _ in 0..3000 {
        if path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("daemon socket never appeared");
}

/// Send a framed request and read the framed response.
fn roundtrip(stream: &mut UnixStream, command: Command, body: &[u8]) -> (i32, Option<String>) {
    stream
        .write_all(&proto::encode_request(command, body))
        .unwrap();
    read_response(stream)
}

fn read_response(stream: &mut UnixStream) -> (i32, Option<String>) {
    let mut header = [0u8; SIZEOF_MSG_HEADER];
    stream.read_exact(&mut header).unwrap();
    assert_eq!(&header[..4], &proto::PROTOCOL_VERSION.to_le_bytes());
    assert_eq!(&header[4..8], &(Command::Response as u32).to_le_bytes());
    let size = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
    let mut body = vec![0u8; size];
    stream.read_exact(&mut body).unwrap();
    proto::decode_response(&body).unwrap()
}

fn unlock_body(token: &str, pin: &str) -> Vec<u8> {
    let mut body = vec![];
    proto::put_string(&mut body, token);
    proto::put_string(&mut body, pin);
    body
}

fn sign_body(format: u32, token: &str, cert: &str) -> Vec<u8> {
    let mut body = vec![];
    body.extend_from_slice(&format.to_le_bytes());
    proto::put_string(&mut body, token);
    proto::put_string(&mut body, cert);
    body
}

/// Issue a signing command: framed body, then the two descriptors.
fn sign_roundtrip(
    stream: &mut UnixStream,
    command: Command,
    format: u32,
    input: &[u8],
) -> (i32, Option<String>, std::fs::File) {
    let mut in_file = tempfile::tempfile().unwrap();
    in_file.write_all(input).unwrap();
    let out_file = tempfile::tempfile().unwrap();

    stream
        .write_all(&proto::encode_request(
            command,
            &sign_body(format, TOKEN_NAME, CERT_NICKNAME),
        ))
        .unwrap();
    fdpass::send_fd(stream.as_raw_fd(), in_file.as_fd()).unwrap();
    fdpass::send_fd(stream.as_raw_fd(), out_file.as_fd()).unwrap();

    let (rc, errmsg) = read_response(stream);
    (rc, errmsg, out_file)
}

fn read_all(file: &mut std::fs::File) -> Vec<u8> {
    let mut contents = Vec::new();
    file.seek(SeekFrom::Start(0)).unwrap();
    file.read_to_end(&mut contents).unwrap();
    contents
}

#[test]
fn unlock_query_sign_and_version_flow() {
    let daemon = TestDaemon::start(None);
    let mut stream = daemon.connect();

    // not unlocked yet
    let mut query = vec![];
    proto::put_string(&mut query, TOKEN_NAME);
    assert_eq!(
        roundtrip(&mut stream, Command::IsTokenUnlocked, &query).0,
        1
    );

    // empty PIN unlocks a PIN-less token
    let (rc, errmsg) = roundtrip(
        &mut stream,
        Command::UnlockToken,
        &unlock_body(TOKEN_NAME, ""),
    );
    assert_eq!((rc, errmsg), (0, None));

    // the registry is sticky across further commands
    assert_eq!(
        roundtrip(&mut stream, Command::IsTokenUnlocked, &query).0,
        0
    );
    assert_eq!(
        roundtrip(
            &mut stream,
            Command::GetCmdVersion,
            &(Command::SignAttached as u32).to_le_bytes()
        )
        .0,
        0
    );
    assert_eq!(
        roundtrip(&mut stream, Command::GetCmdVersion, &9999u32.to_le_bytes()).0,
        -1
    );
    assert_eq!(
        roundtrip(&mut stream, Command::IsTokenUnlocked, &query).0,
        0
    );

    // attached PE signing over passed descriptors
    let image = build_pe(&[b"daemon signing test"]);
    let (rc, errmsg, mut out) =
        sign_roundtrip(&mut stream, Command::SignAttached, FORMAT_PE_BINARY, &image);
    assert_eq!(errmsg, None);
    assert_eq!(rc, 0);
    let signed = read_all(&mut out);
    let parsed = PeImage::parse(&signed).unwrap();
    assert_eq!(parsed.certificates.len(), 1);
    let unsigned_digest = PeImage::parse(&image)
        .unwrap()
        .authenticode_digests(DigestAlgorithm::Sha256)
        .unwrap();
    let signed_digest = parsed.authenticode_digests(DigestAlgorithm::Sha256).unwrap();
    assert_eq!(
        unsigned_digest.selected_digest(),
        signed_digest.selected_digest()
    );

    // detached kernel-module signing on the same connection
    let module = b"fake module".to_vec();
    let (rc, _, mut out) = sign_roundtrip(
        &mut stream,
        Command::SignDetached,
        FORMAT_KERNEL_MODULE,
        &module,
    );
    assert_eq!(rc, 0);
    let der = read_all(&mut out);
    assert!(der.starts_with(&[0x30])); // a DER SEQUENCE, not a module
    assert!(!der.ends_with(MODULE_MAGIC));

    daemon.kill();
}

#[test]
fn wrong_pin_is_rejected_and_token_stays_locked() {
    let daemon = TestDaemon::start(Some("hunter2"));
    let mut stream = daemon.connect();

    let (rc, errmsg) = roundtrip(
        &mut stream,
        Command::UnlockToken,
        &unlock_body(TOKEN_NAME, ""),
    );
    assert!(rc < 0);
    assert!(errmsg.unwrap().contains("authentication failed"));

    let mut query = vec![];
    proto::put_string(&mut query, TOKEN_NAME);
    assert_eq!(
        roundtrip(&mut stream, Command::IsTokenUnlocked, &query).0,
        1
    );

    // correct PIN succeeds
    let (rc, _) = roundtrip(
        &mut stream,
        Command::UnlockToken,
        &unlock_body(TOKEN_NAME, "hunter2"),
    );
    assert_eq!(rc, 0);

    daemon.kill();
}

#[test]
fn signing_without_unlock_is_refused() {
    let daemon = TestDaemon::start(Some("pin"));
    let mut stream = daemon.connect();
    let image = build_pe(&[b"locked"]);
    let (rc, errmsg, mut out) =
        sign_roundtrip(&mut stream, Command::SignAttached, FORMAT_PE_BINARY, &image);
    assert_eq!(rc, -1);
    assert!(errmsg.unwrap().contains("not found"));
    assert_eq!(read_all(&mut out).len(), 0);
    daemon.kill();
}

#[test]
fn unknown_format_gets_an_error_response() {
    let daemon = TestDaemon::start(None);
    let mut stream = daemon.connect();
    roundtrip(
        &mut stream,
        Command::UnlockToken,
        &unlock_body(TOKEN_NAME, ""),
    );
    let (rc, errmsg, _out) = sign_roundtrip(&mut stream, Command::SignAttached, 7, b"whatever");
    assert_eq!(rc, -3);
    assert!(errmsg.unwrap().contains("unrecognised format 7"));
    daemon.kill();
}

#[test]
fn bad_version_closes_only_the_offending_connection() {
    let daemon = TestDaemon::start(None);
    let mut good = daemon.connect();
    // prove the good connection works
    assert_eq!(
        roundtrip(&mut good, Command::GetCmdVersion, &0u32.to_le_bytes()).0,
        0
    );

    let mut hostile = daemon.connect();
    let mut message = vec![];
    message.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
    message.extend_from_slice(&(Command::GetCmdVersion as u32).to_le_bytes());
    message.extend_from_slice(&0u32.to_le_bytes());
    hostile.write_all(&message).unwrap();

    // no response; the peer just hangs up
    let mut buf = [0u8; 1];
    assert_eq!(hostile.read(&mut buf).unwrap(), 0);

    // other connections keep receiving service
    assert_eq!(
        roundtrip(&mut good, Command::GetCmdVersion, &0u32.to_le_bytes()).0,
        0
    );

    daemon.kill();
}

#[test]
fn short_string_framing_closes_the_connection() {
    let daemon = TestDaemon::start(None);
    let mut stream = daemon.connect();

    // a token-name string whose declared size runs past the body
    let mut body = vec![];
    body.extend_from_slice(&64u32.to_le_bytes());
    body.extend_from_slice(b"short");
    stream
        .write_all(&proto::encode_request(Command::IsTokenUnlocked, &body))
        .unwrap();

    let mut buf = [0u8; 1];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);

    daemon.kill();
}

#[test]
fn second_instance_refuses_to_start() {
    let daemon = TestDaemon::start(None);
    let config = DaemonConfig::unprivileged(&daemon.socket_path);
    let provider = SoftToken::new(None);
    let err = Daemon::new(config, Box::new(provider)).run().unwrap_err();
    assert!(matches!(err, efisign::Error::AlreadyRunning));
    daemon.kill();
}
