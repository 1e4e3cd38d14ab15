//! PKCS#7 `SignedData` as Authenticode consumers expect it: version 1,
//! a single signer identified by issuer and serial, authenticated
//! attributes, and the signer certificate carried in the `[0] IMPLICIT`
//! certificate set.
//!
//! One asymmetry is load-bearing and easy to get wrong: the authenticated
//! attributes are tagged `[0] IMPLICIT` inside `SignerInfo`, but the bytes
//! that get hashed and signed are the same attributes under their natural
//! EXPLICIT `SET OF` tag. [`encode_signed_attributes`] produces the latter.

use core::cmp::Ordering;

use der::asn1::{Any, ObjectIdentifier, OctetString, SetOfVec};
use der::{Decode, Encode, Reader, Sequence, ValueOrd};
use spki::AlgorithmIdentifierOwned;
use x509_cert::attr::Attribute;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::Certificate;

use crate::alg::DigestAlgorithm;
use crate::cms::oids;
use crate::cms::spc::{algorithm_identifier, SpcSpOpusInfo};
use crate::error;

pub use crate::cms::spc::DigestInfo;

/// `IssuerAndSerialNumber` from RFC 2315 §6.7.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct IssuerAndSerialNumber {
    pub issuer: Name,
    pub serial_number: SerialNumber,
}

impl IssuerAndSerialNumber {
    /// Pull the identifier out of the signer certificate.
    pub fn from_certificate_der(cert_der: &[u8]) -> error::Result<Self> {
        let cert = Certificate::from_der(cert_der)?;
        Ok(IssuerAndSerialNumber {
            issuer: cert.tbs_certificate.issuer.clone(),
            serial_number: cert.tbs_certificate.serial_number.clone(),
        })
    }
}

/// `SignerInfo` from RFC 2315 §9.2, pinned to the issuerAndSerialNumber
/// identifier choice.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct SignerInfo {
    pub version: u8,
    pub sid: IssuerAndSerialNumber,
    pub digest_algorithm: AlgorithmIdentifierOwned,
    #[asn1(
        context_specific = "0",
        tag_mode = "IMPLICIT",
        constructed = "true",
        optional = "true"
    )]
    pub signed_attrs: Option<SetOfVec<Attribute>>,
    pub signature_algorithm: AlgorithmIdentifierOwned,
    pub signature: OctetString,
}

// SET OF SignerInfo needs an ordering; there is only ever one signer, so
// comparing complete encodings is fine.
impl ValueOrd for SignerInfo {
    fn value_cmp(&self, other: &Self) -> der::Result<Ordering> {
        Ok(self.to_der()?.cmp(&other.to_der()?))
    }
}

/// `EncapsulatedContentInfo`: the inner content info of `SignedData`. The
/// content is carried as a bare `ANY` under the `[0] EXPLICIT` tag, which is
/// how Authenticode embeds `SpcIndirectDataContent` (not wrapped in an
/// OCTET STRING as RFC 5652 would have it).
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct EncapsulatedContentInfo {
    pub econtent_type: ObjectIdentifier,
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT", optional = "true")]
    pub econtent: Option<Any>,
}

/// `SignedData` from RFC 2315 §9.1.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct SignedData {
    pub version: u8,
    pub digest_algorithms: SetOfVec<AlgorithmIdentifierOwned>,
    pub content_info: EncapsulatedContentInfo,
    #[asn1(
        context_specific = "0",
        tag_mode = "IMPLICIT",
        constructed = "true",
        optional = "true"
    )]
    pub certificates: Option<SetOfVec<Any>>,
    pub signer_infos: SetOfVec<SignerInfo>,
}

/// The outer `ContentInfo` wrapping a `SignedData`.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct ContentInfo {
    pub content_type: ObjectIdentifier,
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT")]
    pub content: Any,
}

impl ContentInfo {
    pub fn wrap(signed_data: &SignedData) -> error::Result<Self> {
        Ok(ContentInfo {
            content_type: oids::SIGNED_DATA,
            content: Any::encode_from(signed_data)?,
        })
    }

    /// Re-parse a DER blob and hand back the inner `SignedData`. Trailing
    /// bytes (certificate-table alignment padding) are tolerated; the outer
    /// TLV length decides where the structure ends.
    pub fn unwrap_signed_data(der_bytes: &[u8]) -> error::Result<SignedData> {
        let mut reader = der::SliceReader::new(der_bytes)?;
        let header = der::Header::decode(&mut reader)?;
        let prefix = usize::try_from(reader.position())?;
        let body = usize::try_from(header.length)?;
        let trimmed = der_bytes.get(..prefix + body).ok_or_else(|| {
            error::Error::Malformed("signature DER is shorter than its own length".into())
        })?;
        let content_info = ContentInfo::from_der(trimmed)?;
        if content_info.content_type != oids::SIGNED_DATA {
            return Err(error::Error::Malformed(format!(
                "outer content type {} is not signedData",
                content_info.content_type
            )));
        }
        Ok(content_info.content.decode_as()?)
    }
}

fn attribute(oid: ObjectIdentifier, value: Any) -> error::Result<Attribute> {
    Ok(Attribute {
        oid,
        values: SetOfVec::try_from(vec![value])?,
    })
}

/// The four authenticated attributes of a PE signature: content-type,
/// message-digest over the indirect-data content octets, opus-info, and
/// statement-type naming commercial code signing.
pub fn pe_signed_attributes(
    content_digest: &[u8],
) -> error::Result<SetOfVec<Attribute>> {
    let statement_type: Vec<ObjectIdentifier> = vec![oids::SPC_COMMERCIAL_CODE_SIGNING];
    let attrs = vec![
        attribute(
            oids::CONTENT_TYPE,
            Any::encode_from(&oids::SPC_INDIRECT_DATA)?,
        )?,
        attribute(
            oids::MESSAGE_DIGEST,
            Any::encode_from(&OctetString::new(content_digest)?)?,
        )?,
        attribute(
            oids::SPC_SP_OPUS_INFO,
            Any::encode_from(&SpcSpOpusInfo::default())?,
        )?,
        attribute(oids::SPC_STATEMENT_TYPE, Any::encode_from(&statement_type)?)?,
    ];
    // SetOfVec re-sorts into canonical SET OF order.
    Ok(SetOfVec::try_from(attrs)?)
}

/// The two attributes of a kernel-module signature.
pub fn kmod_signed_attributes(module_digest: &[u8]) -> error::Result<SetOfVec<Attribute>> {
    let attrs = vec![
        attribute(oids::CONTENT_TYPE, Any::encode_from(&oids::DATA)?)?,
        attribute(
            oids::MESSAGE_DIGEST,
            Any::encode_from(&OctetString::new(module_digest)?)?,
        )?,
    ];
    Ok(SetOfVec::try_from(attrs)?)
}

/// DER of the attributes under their EXPLICIT `SET OF` tag; hash these bytes
/// to produce the value the token signs.
pub fn encode_signed_attributes(attrs: &SetOfVec<Attribute>) -> error::Result<Vec<u8>> {
    Ok(attrs.to_der()?)
}

/// Assemble a complete `SignerInfo` once the token has produced the raw
/// PKCS#1 v1.5 signature over the attribute digest.
pub fn signer_info(
    sid: IssuerAndSerialNumber,
    alg: DigestAlgorithm,
    signed_attrs: SetOfVec<Attribute>,
    signature: &[u8],
) -> error::Result<SignerInfo> {
    Ok(SignerInfo {
        version: 1,
        sid,
        digest_algorithm: algorithm_identifier(alg.oid()),
        signed_attrs: Some(signed_attrs),
        signature_algorithm: algorithm_identifier(crate::alg::OID_RSA_ENCRYPTION),
        signature: OctetString::new(signature)?,
    })
}

/// Assemble the `SignedData` carrying one signer and the signer certificate.
pub fn signed_data(
    alg: DigestAlgorithm,
    content_info: EncapsulatedContentInfo,
    signer_cert_der: &[u8],
    signer: SignerInfo,
) -> error::Result<SignedData> {
    let certificates = SetOfVec::try_from(vec![Any::from_der(signer_cert_der)?])?;
    Ok(SignedData {
        version: 1,
        digest_algorithms: SetOfVec::try_from(vec![algorithm_identifier(alg.oid())])?,
        content_info,
        certificates: Some(certificates),
        signer_infos: SetOfVec::try_from(vec![signer])?,
    })
}

impl SignerInfo {
    /// The message-digest attribute value, if present. Used when validating
    /// a signature against a freshly computed digest.
    pub fn message_digest(&self) -> Option<Vec<u8>> {
        let attrs = self.signed_attrs.as_ref()?;
        attrs
            .iter()
            .find(|attr| attr.oid == oids::MESSAGE_DIGEST)
            .and_then(|attr| attr.values.iter().next())
            .and_then(|any| any.decode_as::<OctetString>().ok())
            .map(|octets| octets.as_bytes().to_vec())
    }
}
