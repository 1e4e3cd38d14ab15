//! Linux kernel-module signing.
//!
//! Modules are signed as flat blobs: no SPC wrapper, no excluded ranges.
//! The attached form appends the PKCS#7 DER and then the fixed trailer the
//! kernel's module loader walks backwards from:
//!
//! ```text
//! [module bytes][SignedData DER][module_signature][magic]
//! ```

use std::fs::File;
use std::io::{Seek, Write};

use der::Encode;
use log::info;

use crate::cms::{self, oids, pkcs7, SignatureMode, SigningIdentity};
use crate::error;
use crate::provider::KeyProvider;

/// Trailing marker the kernel scans for.
pub const MODULE_MAGIC: &[u8; 28] = b"~Module signature appended~\n";
/// `id_type`: the signature is a PKCS#7 blob keyed by issuer and serial.
pub const PKEY_ID_PKCS7: u8 = 0x02;
/// `module_signature` struct plus the magic.
pub const TRAILER_LEN: usize = 12 + MODULE_MAGIC.len();

/// The fixed 12-byte `module_signature` structure: zeroed algorithm and
/// name/key-id length fields (the PKCS#7 body carries all of that),
/// `id_type` = PKCS#7, and the big-endian DER length.
fn signature_info(sig_len: u32) -> [u8; 12] {
    let mut info = [0u8; 12];
    info[3] = PKEY_ID_PKCS7;
    info[8..12].copy_from_slice(&sig_len.to_be_bytes());
    info
}

/// Sign a kernel module. Atomic like the PE path: any failure truncates the
/// output to zero before returning.
pub fn sign_module(
    provider: &mut dyn KeyProvider,
    identity: &SigningIdentity<'_>,
    input: &[u8],
    output: &mut File,
    mode: SignatureMode,
) -> error::Result<()> {
    let result = sign_module_inner(provider, identity, input, output, mode);
    if result.is_err() {
        let _ = output.set_len(0);
    }
    result
}

fn sign_module_inner(
    provider: &mut dyn KeyProvider,
    identity: &SigningIdentity<'_>,
    input: &[u8],
    output: &mut File,
    mode: SignatureMode,
) -> error::Result<()> {
    if input.is_empty() {
        return Err(error::Error::Malformed("module is empty".into()));
    }
    let (entry, key) = cms::resolve_identity(provider, identity)?;
    output.rewind()?;
    output.set_len(0)?;

    let module_digest = identity.digest.digest(input);
    let signed_attrs = pkcs7::kmod_signed_attributes(&module_digest)?;
    let signature = cms::sign_attributes(provider, &key, identity.digest, &signed_attrs)?;

    let content_info = pkcs7::EncapsulatedContentInfo {
        econtent_type: oids::DATA,
        econtent: None,
    };
    let sid = pkcs7::IssuerAndSerialNumber::from_certificate_der(&entry.certificate_der)?;
    let signer = pkcs7::signer_info(sid, identity.digest, signed_attrs, &signature)?;
    let signed = pkcs7::signed_data(identity.digest, content_info, &entry.certificate_der, signer)?;
    let der = pkcs7::ContentInfo::wrap(&signed)?.to_der()?;

    let sig_len = u32::try_from(der.len())
        .map_err(|_| error::Error::Crypto("signature too large for module trailer".into()))?;

    match mode {
        SignatureMode::Attached => {
            output.write_all(input)?;
            output.write_all(&der)?;
            output.write_all(&signature_info(sig_len))?;
            output.write_all(MODULE_MAGIC)?;
            info!(
                "module signature appended ({} bytes of DER, {} byte trailer)",
                der.len(),
                TRAILER_LEN
            );
        }
        SignatureMode::Detached => {
            output.write_all(&der)?;
            info!("detached module signature written ({} bytes)", der.len());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailer_is_exactly_forty_bytes() {
        assert_eq!(TRAILER_LEN, 40);
    }

    #[test]
    fn signature_info_layout() {
        let info = signature_info(0x0102_0304);
        assert_eq!(&info[..3], &[0, 0, 0]);
        assert_eq!(info[3], PKEY_ID_PKCS7);
        assert_eq!(&info[4..8], &[0, 0, 0, 0]);
        assert_eq!(&info[8..12], &[0x01, 0x02, 0x03, 0x04]);
    }
}
