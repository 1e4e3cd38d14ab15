//! The object identifiers an Authenticode signature carries, plus the
//! startup registry that maps them back to names for log and error text.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use der::asn1::ObjectIdentifier;

/// PKCS#7 data
pub const DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
/// PKCS#7 signedData
pub const SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");
/// PKCS#9 contentType
pub const CONTENT_TYPE: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.3");
/// PKCS#9 messageDigest
pub const MESSAGE_DIGEST: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");

/// SPC_INDIRECT_DATA_OBJID
pub const SPC_INDIRECT_DATA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.2.1.4");
/// SPC_STATEMENT_TYPE_OBJID
pub const SPC_STATEMENT_TYPE: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.2.1.11");
/// SPC_SP_OPUS_INFO_OBJID
pub const SPC_SP_OPUS_INFO: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.2.1.12");
/// SPC_PE_IMAGE_DATA_OBJID
pub const SPC_PE_IMAGE_DATA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.2.1.15");
/// SPC_INDIVIDUAL_SP_KEY_PURPOSE_OBJID
pub const SPC_INDIVIDUAL_CODE_SIGNING: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.2.1.21");
/// SPC_COMMERCIAL_SP_KEY_PURPOSE_OBJID
pub const SPC_COMMERCIAL_CODE_SIGNING: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.2.1.22");

static REGISTRY: OnceLock<BTreeMap<ObjectIdentifier, &'static str>> = OnceLock::new();

/// Register the SPC and Microsoft OIDs. Called once at service startup;
/// idempotent.
pub fn register() {
    REGISTRY.get_or_init(|| {
        BTreeMap::from([
            (SPC_INDIRECT_DATA, "spcIndirectDataContext"),
            (SPC_STATEMENT_TYPE, "spcStatementType"),
            (SPC_SP_OPUS_INFO, "spcSpOpusInfo"),
            (SPC_PE_IMAGE_DATA, "spcPEImageData"),
            (SPC_INDIVIDUAL_CODE_SIGNING, "individualCodeSigning"),
            (SPC_COMMERCIAL_CODE_SIGNING, "commercialCodeSigning"),
        ])
    });
}

/// Human-readable name of a registered OID, for log lines.
pub fn describe(oid: &ObjectIdentifier) -> Option<&'static str> {
    REGISTRY.get().and_then(|map| map.get(oid).copied())
}
