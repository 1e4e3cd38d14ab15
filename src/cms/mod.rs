//! End-to-end assembly of one Authenticode signature.
//!
//! The composer ties the layers together: the PE layout picks the hashable
//! ranges, the digest engine produces the content hash, the DER layer builds
//! the SPC content and authenticated attributes, the key provider signs the
//! attribute digest, and the result lands either inside the image's
//! certificate table or on its own as a detached blob.

pub mod oids;
pub mod pkcs7;
pub mod spc;

use std::fs::File;
use std::io::{Seek, Write};

use der::asn1::SetOfVec;
use der::Encode;
use log::{debug, info};
use x509_cert::attr::Attribute;

use crate::alg::DigestAlgorithm;
use crate::error;
use crate::pe::certificate_table::AttributeCertificate;
use crate::pe::{writer, PeImage};
use crate::provider::{CertificateEntry, KeyHandle, KeyProvider};
use crate::secrets::SecretBytes;

/// Who signs, with what, hashed how. Request-scoped: the daemon borrows the
/// strings out of the wire message, the CLI out of its arguments.
#[derive(Debug, Clone, Copy)]
pub struct SigningIdentity<'a> {
    pub token: &'a str,
    pub certificate: &'a str,
    pub digest: DigestAlgorithm,
}

/// Attached signatures land in the image; detached ones stand alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureMode {
    Attached,
    Detached,
}

/// Resolve the identity to a certificate and private-key handle. The token
/// session must already be authenticated; signing never prompts.
pub fn resolve_identity(
    provider: &mut dyn KeyProvider,
    identity: &SigningIdentity<'_>,
) -> error::Result<(CertificateEntry, KeyHandle)> {
    let token = provider.find_token(identity.token)?;
    let entry = provider.find_certificate(&token, identity.certificate, true)?;
    let key = entry.key.clone().ok_or_else(|| {
        error::Error::NotFound(format!(
            "private key for certificate \"{}\"",
            identity.certificate
        ))
    })?;
    Ok((entry, key))
}

/// Sign a PE image. The composer commits atomically: if anything fails after
/// the output was touched, the output is truncated to zero before the error
/// surfaces.
pub fn sign_pe(
    provider: &mut dyn KeyProvider,
    identity: &SigningIdentity<'_>,
    input: &[u8],
    output: &mut File,
    mode: SignatureMode,
) -> error::Result<()> {
    let result = match mode {
        SignatureMode::Attached => sign_pe_attached(provider, identity, input, output),
        SignatureMode::Detached => sign_pe_detached(provider, identity, input, output),
    };
    if result.is_err() {
        let _ = output.set_len(0);
    }
    result
}

fn sign_pe_attached(
    provider: &mut dyn KeyProvider,
    identity: &SigningIdentity<'_>,
    input: &[u8],
    output: &mut File,
) -> error::Result<()> {
    let (entry, key) = resolve_identity(provider, identity)?;

    // Work on a copy of the input; the original is never touched.
    let mut image_bytes = input.to_vec();

    // First pass: how much certificate-table space does this signature need?
    // The DER length only depends on digest and modulus sizes, so encoding
    // with a provisional digest and an all-zero signature pins it exactly.
    let signature_len = provider.signature_len(&key)?;
    let (layout, provisional) = {
        let image = PeImage::parse(&image_bytes)?;
        let digests = image.authenticode_digests(identity.digest)?;
        (image.layout.clone(), digests)
    };
    let placeholder = assemble_content_info(
        identity.digest,
        provisional.selected_digest(),
        &entry.certificate_der,
        &vec![0u8; signature_len],
    )?;
    let placeholder_cert = AttributeCertificate::from_signed_data(&placeholder)?;
    let added = placeholder_cert.aligned_len();

    let cert_offset = writer::allocate_signature_space(&mut image_bytes, &layout, added)?;
    // Park the placeholder in the table so the extended image stays
    // parseable; the final signature overwrites it byte for byte.
    writer::append_certificate(&mut image_bytes, cert_offset, &placeholder_cert)?;
    debug!(
        "reserved {added} bytes of signature space at {cert_offset:#x}"
    );

    // Second pass: the extension moved the certificate table, so the bytes
    // feeding the digest changed; recompute before signing.
    let digests = {
        let image = PeImage::parse(&image_bytes)?;
        image.authenticode_digests(identity.digest)?
    };

    let signed_attrs = build_pe_attributes(identity.digest, digests.selected_digest())?;
    let signature = sign_attributes(provider, &key, identity.digest, &signed_attrs)?;
    let content_info = assemble_pe_signed_data(
        identity.digest,
        digests.selected_digest(),
        &entry.certificate_der,
        signed_attrs,
        &signature,
    )?;
    debug_assert_eq!(content_info.len(), placeholder.len());

    let certificate = AttributeCertificate::from_signed_data(&content_info)?;
    writer::append_certificate(&mut image_bytes, cert_offset, &certificate)?;

    output.rewind()?;
    output.set_len(0)?;
    output.write_all(&image_bytes)?;
    info!(
        "attached {} signature written ({} bytes of image)",
        identity.digest.name(),
        image_bytes.len()
    );
    Ok(())
}

fn sign_pe_detached(
    provider: &mut dyn KeyProvider,
    identity: &SigningIdentity<'_>,
    input: &[u8],
    output: &mut File,
) -> error::Result<()> {
    let (entry, key) = resolve_identity(provider, identity)?;
    output.rewind()?;
    output.set_len(0)?;

    let image = PeImage::parse(input)?;
    let digests = image.authenticode_digests(identity.digest)?;

    let signed_attrs = build_pe_attributes(identity.digest, digests.selected_digest())?;
    let signature = sign_attributes(provider, &key, identity.digest, &signed_attrs)?;
    let content_info = assemble_pe_signed_data(
        identity.digest,
        digests.selected_digest(),
        &entry.certificate_der,
        signed_attrs,
        &signature,
    )?;

    output.write_all(&content_info)?;
    info!(
        "detached {} signature written ({} bytes of DER)",
        identity.digest.name(),
        content_info.len()
    );
    Ok(())
}

/// The authenticated attributes for a PE signature: the message digest is
/// taken over the content octets of the `SpcIndirectDataContent`, not the
/// image digest itself.
fn build_pe_attributes(
    alg: DigestAlgorithm,
    image_digest: &[u8],
) -> error::Result<SetOfVec<Attribute>> {
    let indirect = spc::SpcIndirectDataContent::for_pe_digest(alg, image_digest)?;
    let content_digest = alg.digest(&indirect.value_der()?);
    pkcs7::pe_signed_attributes(&content_digest)
}

/// Hash the EXPLICIT `SET OF` encoding of the attributes and have the token
/// sign it. The raw signature is scrubbed by the caller's buffer when the
/// request winds down.
pub(crate) fn sign_attributes(
    provider: &mut dyn KeyProvider,
    key: &KeyHandle,
    alg: DigestAlgorithm,
    attrs: &SetOfVec<Attribute>,
) -> error::Result<SecretBytes> {
    let attr_der = pkcs7::encode_signed_attributes(attrs)?;
    let attr_digest = alg.digest(&attr_der);
    let signature = provider.sign(key, alg, &attr_digest)?;
    Ok(SecretBytes::new(signature))
}

fn assemble_pe_signed_data(
    alg: DigestAlgorithm,
    image_digest: &[u8],
    signer_cert_der: &[u8],
    signed_attrs: SetOfVec<Attribute>,
    signature: &[u8],
) -> error::Result<Vec<u8>> {
    let indirect = spc::SpcIndirectDataContent::for_pe_digest(alg, image_digest)?;
    let content_info = pkcs7::EncapsulatedContentInfo {
        econtent_type: oids::SPC_INDIRECT_DATA,
        econtent: Some(der::asn1::Any::encode_from(&indirect)?),
    };
    let sid = pkcs7::IssuerAndSerialNumber::from_certificate_der(signer_cert_der)?;
    let signer = pkcs7::signer_info(sid, alg, signed_attrs, signature)?;
    let signed = pkcs7::signed_data(alg, content_info, signer_cert_der, signer)?;
    Ok(pkcs7::ContentInfo::wrap(&signed)?.to_der()?)
}

/// Space estimation path: same structure, provisional digest, zero
/// signature.
fn assemble_content_info(
    alg: DigestAlgorithm,
    image_digest: &[u8],
    signer_cert_der: &[u8],
    signature: &[u8],
) -> error::Result<Vec<u8>> {
    let attrs = build_pe_attributes(alg, image_digest)?;
    assemble_pe_signed_data(alg, image_digest, signer_cert_der, attrs, signature)
}
