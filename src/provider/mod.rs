//! The capability interface over a PKCS#11-style token.
//!
//! The daemon and the signature composer only ever talk to this trait, so
//! the whole signing path can run against an in-memory software token in
//! tests while production uses the [`pkcs11`] backend.

#[cfg(feature = "pkcs11")]
pub mod pkcs11;

use zeroize::Zeroizing;

use crate::alg::DigestAlgorithm;
use crate::error;

/// A PIN in transit; zeroed when it goes out of scope.
pub type Pin = Zeroizing<String>;

/// An enumerable token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHandle {
    /// Provider-scoped identifier (a PKCS#11 slot id for the hardware
    /// backend).
    pub id: u64,
    /// The token label clients address it by.
    pub name: String,
}

/// A private key resolved inside an authenticated token session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHandle {
    /// The token the key lives on.
    pub token: String,
    /// Provider-scoped object identifier.
    pub object: u64,
}

/// What `find_certificate` resolves: the certificate DER and, when a private
/// key was required, its handle.
#[derive(Debug, Clone)]
pub struct CertificateEntry {
    pub certificate_der: Vec<u8>,
    pub key: Option<KeyHandle>,
}

/// Synchronous token access. Authentication state is a property of the
/// provider instance and persists for its lifetime; `authenticate` is
/// idempotent and returns immediately for an already-unlocked token.
pub trait KeyProvider {
    /// Every token the provider can currently reach.
    fn list_tokens(&mut self) -> error::Result<Vec<TokenHandle>>;

    /// Look a token up by label.
    fn find_token(&mut self, name: &str) -> error::Result<TokenHandle> {
        self.list_tokens()?
            .into_iter()
            .find(|token| token.name == name)
            .ok_or_else(|| error::Error::NotFound(format!("token \"{name}\"")))
    }

    /// Unlock `token` with `pin`. An empty PIN is only accepted by tokens
    /// with no PIN set.
    fn authenticate(&mut self, token: &TokenHandle, pin: &Pin) -> error::Result<()>;

    /// Find the certificate `nickname` on `token`. With
    /// `needs_private_key`, only certificates whose private key the token
    /// holds qualify, and a second qualifying match is an error rather than
    /// a silent pick.
    fn find_certificate(
        &mut self,
        token: &TokenHandle,
        nickname: &str,
        needs_private_key: bool,
    ) -> error::Result<CertificateEntry>;

    /// Raw PKCS#1 v1.5 RSA signature over `DigestInfo(digest_alg, digest)`.
    fn sign(
        &mut self,
        key: &KeyHandle,
        digest_alg: DigestAlgorithm,
        digest: &[u8],
    ) -> error::Result<Vec<u8>>;

    /// Size in bytes of a signature block this key produces (the modulus
    /// size); lets the composer reserve certificate-table space before
    /// signing.
    fn signature_len(&mut self, key: &KeyHandle) -> error::Result<usize>;
}
