//! # efisign
//!
//! Authenticode signing for UEFI Secure Boot artifacts.
//!
//! The crate covers the whole signing path:
//!
//! * [`pe`] — a PE32/PE32+ image view with the byte-range layout the
//!   Authenticode digest is computed over, plus certificate-table mutation
//!   for attached signatures
//! * [`cms`] — the DER structures (`SpcIndirectDataContent`, authenticated
//!   attributes, `SignerInfo`, `SignedData`) and the composer that drives a
//!   signing end to end
//! * [`kmod`] — Linux kernel-module signatures with the fixed trailer the
//!   module loader expects
//! * [`provider`] — the capability interface over a PKCS#11 token, with a
//!   `cryptoki` backend behind the `pkcs11` feature
//! * [`daemon`] — the long-lived service that owns unlocked token sessions
//!   and serves signing requests over a Unix socket, descriptors passed via
//!   SCM_RIGHTS
//!
//! # Example: detached signature over an in-memory image
//!
//! ```no_run
//! use efisign::alg::DigestAlgorithm;
//! use efisign::cms::{sign_pe, SignatureMode, SigningIdentity};
//! # fn provider() -> Box<dyn efisign::provider::KeyProvider> { unimplemented!() }
//!
//! let mut provider = provider();
//! let identity = SigningIdentity {
//!     token: "NSS Certificate DB",
//!     certificate: "Red Hat Test CA",
//!     digest: DigestAlgorithm::Sha256,
//! };
//! let image = std::fs::read("shim.efi")?;
//! let mut out = std::fs::File::create("shim.efi.p7b")?;
//! sign_pe(provider.as_mut(), &identity, &image, &mut out, SignatureMode::Detached)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod alg;
pub mod cms;
pub mod daemon;
pub mod error;
pub mod kmod;
pub mod pe;
pub mod provider;
pub mod secrets;

pub use crate::error::{Error, Result};
