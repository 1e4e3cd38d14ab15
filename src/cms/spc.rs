//! The Microsoft SPC structures that bind a PE digest to a signature.
//!
//! Reference: Windows Authenticode Portable Executable Signature Format
//! (http://msdn.microsoft.com/en-US/windows/hardware/gg463183). The document
//! differs from what signing tools actually emit; the shapes below follow
//! the wire.

use der::asn1::{Any, BitString, BmpString, Ia5String, ObjectIdentifier, OctetString};
use der::{Choice, Encode, Sequence};
use spki::AlgorithmIdentifierOwned;

use crate::alg::DigestAlgorithm;
use crate::cms::oids;
use crate::error;

/// The UCS-2 file string every signer still emits for the long-dead
/// publisher-link field.
pub const OBSOLETE: &str = "<<<Obsolete>>>";

/// `AlgorithmIdentifier` with the explicit two-byte NULL parameter encoding
/// that Authenticode consumers expect.
pub fn algorithm_identifier(oid: ObjectIdentifier) -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid,
        parameters: Some(Any::from(der::asn1::AnyRef::NULL)),
    }
}

/// ```text
/// SpcString ::= CHOICE {
///     unicode [0] IMPLICIT BMPSTRING,
///     ascii   [1] IMPLICIT IA5STRING }
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Choice)]
pub enum SpcString {
    #[asn1(context_specific = "0", tag_mode = "IMPLICIT")]
    Unicode(BmpString),
    #[asn1(context_specific = "1", tag_mode = "IMPLICIT")]
    Ascii(Ia5String),
}

/// ```text
/// SpcLink ::= CHOICE {
///     url     [0] IMPLICIT IA5STRING,
///     moniker [1] IMPLICIT SpcSerializedObject,
///     file    [2] EXPLICIT SpcString }
/// ```
/// Monikers carry page hashes, which this signer never produces.
#[derive(Clone, Debug, Eq, PartialEq, Choice)]
pub enum SpcLink {
    #[asn1(context_specific = "0", tag_mode = "IMPLICIT")]
    Url(Ia5String),
    #[asn1(context_specific = "2", tag_mode = "EXPLICIT", constructed = "true")]
    File(SpcString),
}

impl SpcLink {
    /// The fixed `[2]` file link holding `<<<Obsolete>>>` in UCS-2, no
    /// terminator.
    pub fn obsolete_file() -> error::Result<Self> {
        let unicode = BmpString::from_utf8(OBSOLETE)
            .map_err(|_| error::Error::Crypto("could not encode SpcString".into()))?;
        Ok(SpcLink::File(SpcString::Unicode(unicode)))
    }
}

/// ```text
/// SpcPeImageData ::= SEQUENCE {
///     flags SpcPeImageFlags DEFAULT includeResources,
///     file  [0] EXPLICIT SpcLink OPTIONAL }
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct SpcPeImageData {
    pub flags: BitString,
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT", optional = "true")]
    pub file: Option<SpcLink>,
}

impl SpcPeImageData {
    /// Flags zero plus the obsolete file link: the shape every UEFI signer
    /// emits.
    pub fn for_pe_image() -> error::Result<Self> {
        Ok(SpcPeImageData {
            flags: BitString::from_bytes(&[])
                .map_err(|_| error::Error::Crypto("could not encode image flags".into()))?,
            file: Some(SpcLink::obsolete_file()?),
        })
    }
}

/// ```text
/// SpcAttributeTypeAndOptionalValue ::= SEQUENCE {
///     type  ObjectID,
///     value [0] EXPLICIT ANY OPTIONAL }
/// ```
/// (The `value` rides unwrapped on the wire, matching observed signatures.)
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct SpcAttributeTypeAndOptionalValue {
    pub attribute_type: ObjectIdentifier,
    pub value: Any,
}

/// `DigestInfo ::= SEQUENCE { digestAlgorithm AlgorithmIdentifier, digest OCTETSTRING }`
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct DigestInfo {
    pub digest_algorithm: AlgorithmIdentifierOwned,
    pub digest: OctetString,
}

impl DigestInfo {
    pub fn new(alg: DigestAlgorithm, digest: &[u8]) -> error::Result<Self> {
        Ok(DigestInfo {
            digest_algorithm: algorithm_identifier(alg.oid()),
            digest: OctetString::new(digest)
                .map_err(|_| error::Error::Crypto("could not encode digest".into()))?,
        })
    }
}

/// The inner content of an Authenticode signature.
///
/// ```text
/// SpcIndirectDataContent ::= SEQUENCE {
///     data          SpcAttributeTypeAndOptionalValue,
///     messageDigest DigestInfo }
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct SpcIndirectDataContent {
    pub data: SpcAttributeTypeAndOptionalValue,
    pub message_digest: DigestInfo,
}

impl SpcIndirectDataContent {
    /// Bind a PE digest: SPC_PE_IMAGE_DATA with flags 0 and the obsolete
    /// link, then the DigestInfo for the selected algorithm.
    pub fn for_pe_digest(alg: DigestAlgorithm, digest: &[u8]) -> error::Result<Self> {
        let image_data = SpcPeImageData::for_pe_image()?;
        Ok(SpcIndirectDataContent {
            data: SpcAttributeTypeAndOptionalValue {
                attribute_type: oids::SPC_PE_IMAGE_DATA,
                value: Any::encode_from(&image_data)?,
            },
            message_digest: DigestInfo::new(alg, digest)?,
        })
    }

    /// The DER of the two fields without the outer SEQUENCE header. This is
    /// what the message-digest authenticated attribute hashes: PKCS#7
    /// digests the content octets of the content info, not its full TLV.
    pub fn value_der(&self) -> error::Result<Vec<u8>> {
        let mut der = self.data.to_der()?;
        der.extend_from_slice(&self.message_digest.to_der()?);
        Ok(der)
    }
}

/// ```text
/// SpcSpOpusInfo ::= SEQUENCE {
///     programName [0] EXPLICIT SpcString OPTIONAL,
///     moreInfo    [1] EXPLICIT SpcLink OPTIONAL }
/// ```
/// Both fields stay absent, so the attribute value is an empty sequence.
#[derive(Clone, Debug, Default, Eq, PartialEq, Sequence)]
pub struct SpcSpOpusInfo {
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT", optional = "true")]
    pub program_name: Option<SpcString>,
    #[asn1(context_specific = "1", tag_mode = "EXPLICIT", optional = "true")]
    pub more_info: Option<SpcLink>,
}
