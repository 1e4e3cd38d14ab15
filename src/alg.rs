//! The digest algorithm table.
//!
//! Every signing pass runs all enabled algorithms so a file can later be
//! re-signed with a different one without re-reading it; exactly one entry
//! is selected as the content hash of the signature being produced.

use der::asn1::ObjectIdentifier;
use digest::{Digest, DynDigest};

use crate::error;

/// rsaEncryption, the digest-encryption algorithm for every entry.
pub const OID_RSA_ENCRYPTION: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");

const OID_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");
#[cfg(feature = "sha1-digest")]
const OID_SHA1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.14.3.2.26");

#[derive(Debug, PartialEq, Eq, Copy, Clone, PartialOrd, Ord)]
pub enum DigestAlgorithm {
    Sha256,
    #[cfg(feature = "sha1-digest")]
    Sha1,
}

#[cfg(feature = "sha1-digest")]
const ALL: &[DigestAlgorithm] = &[DigestAlgorithm::Sha256, DigestAlgorithm::Sha1];
#[cfg(not(feature = "sha1-digest"))]
const ALL: &[DigestAlgorithm] = &[DigestAlgorithm::Sha256];

impl DigestAlgorithm {
    /// All algorithms the build knows about, selection order first.
    pub fn all() -> &'static [DigestAlgorithm] {
        ALL
    }

    pub fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            #[cfg(feature = "sha1-digest")]
            DigestAlgorithm::Sha1 => "sha1",
        }
    }

    pub fn from_name(name: &str) -> error::Result<Self> {
        match name {
            "sha256" => Ok(DigestAlgorithm::Sha256),
            #[cfg(feature = "sha1-digest")]
            "sha1" => Ok(DigestAlgorithm::Sha1),
            _ => Err(error::Error::NotFound(format!("digest algorithm \"{name}\""))),
        }
    }

    pub fn oid(self) -> ObjectIdentifier {
        match self {
            DigestAlgorithm::Sha256 => OID_SHA256,
            #[cfg(feature = "sha1-digest")]
            DigestAlgorithm::Sha1 => OID_SHA1,
        }
    }

    /// Size of the produced digest in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 32,
            #[cfg(feature = "sha1-digest")]
            DigestAlgorithm::Sha1 => 20,
        }
    }

    /// A fresh streaming context for this algorithm.
    pub fn hasher(self) -> Box<dyn DynDigest> {
        match self {
            DigestAlgorithm::Sha256 => Box::new(sha2::Sha256::new()),
            #[cfg(feature = "sha1-digest")]
            DigestAlgorithm::Sha1 => Box::new(sha1::Sha1::new()),
        }
    }

    /// One-shot digest of a flat buffer.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        let mut ctx = self.hasher();
        ctx.update(data);
        ctx.finalize().into_vec()
    }
}
