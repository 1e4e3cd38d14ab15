//! Parsing and encoding of the Attribute Certificate Table.
//! See reference:
//! https://learn.microsoft.com/en-us/windows/win32/debug/pe-format#the-attribute-certificate-table-image-only
//! https://learn.microsoft.com/en-us/windows/win32/api/wintrust/ns-wintrust-win_certificate

use core::ops::Range;

use log::debug;
use scroll::{ctx, Pread, Pwrite, SizeWith};

use crate::error;
use crate::pe::utils::{align_to, pad};

/// WIN_CERT_REVISION_2_0, the only revision the signer emits.
pub const WIN_CERT_REVISION_2_0: u16 = 0x0200;
/// WIN_CERT_REVISION_1_0, accepted on parse for legacy images.
pub const WIN_CERT_REVISION_1_0: u16 = 0x0100;
/// WIN_CERT_TYPE_PKCS_SIGNED_DATA
pub const WIN_CERT_TYPE_PKCS_SIGNED_DATA: u16 = 0x0002;
/// WIN_CERT_TYPE_X509
pub const WIN_CERT_TYPE_X509: u16 = 0x0001;

/// WIN_CERTIFICATE header structure
#[repr(C)]
#[derive(Debug, Copy, Clone, Pread, Pwrite, SizeWith)]
pub struct AttributeCertificateHeader {
    /// dwLength, includes this header and the trailing alignment padding
    pub length: u32,
    /// wRevision
    pub revision: u16,
    /// wCertificateType
    pub certificate_type: u16,
}

/// Static size of the [`AttributeCertificateHeader`] structure.
pub const ATTRIBUTE_CERTIFICATE_HEADER_SIZEOF: usize =
    core::mem::size_of::<AttributeCertificateHeader>();

/// One entry of the certificate table. `certificate` holds the payload
/// (a PKCS#7 `SignedData` for the signatures this crate produces) without
/// the header or padding.
#[derive(Debug, Clone)]
pub struct AttributeCertificate<'a> {
    pub length: u32,
    pub revision: u16,
    pub certificate_type: u16,
    pub certificate: &'a [u8],
}

impl<'a> AttributeCertificate<'a> {
    /// Wrap a PKCS#7 `SignedData` DER as a revision 2.0 signed-data entry.
    /// `length` covers the header, the payload, and the 8-byte alignment
    /// padding.
    pub fn from_signed_data(signed_data: &'a [u8]) -> error::Result<Self> {
        let length = (align_to(signed_data.len(), 8) + ATTRIBUTE_CERTIFICATE_HEADER_SIZEOF)
            .try_into()
            .map_err(|_| {
                error::Error::Malformed(
                    "attribute certificate length does not fit in a `u32`".into(),
                )
            })?;
        Ok(Self {
            length,
            revision: WIN_CERT_REVISION_2_0,
            certificate_type: WIN_CERT_TYPE_PKCS_SIGNED_DATA,
            certificate: signed_data,
        })
    }

    pub fn parse(bytes: &'a [u8], current_offset: &mut usize) -> error::Result<Self> {
        debug!("reading certificate header at {current_offset}");
        let header: AttributeCertificateHeader = bytes.gread_with(current_offset, scroll::LE)?;
        match header.revision {
            WIN_CERT_REVISION_1_0 | WIN_CERT_REVISION_2_0 => (),
            other => {
                return Err(error::Error::Malformed(format!(
                    "invalid attribute certificate revision {other:#x}"
                )))
            }
        }
        let cert_size = header
            .length
            .saturating_sub(ATTRIBUTE_CERTIFICATE_HEADER_SIZEOF as u32)
            as usize;
        let payload = bytes
            .get(*current_offset..current_offset.saturating_add(cert_size))
            .ok_or_else(|| {
                error::Error::Malformed(format!(
                    "certificate table entry of {cert_size} bytes extends past the table"
                ))
            })?;
        // Move past the payload, then round up to the next 8-byte boundary.
        // The offset is strictly increasing, which bounds table enumeration.
        *current_offset = current_offset.saturating_add(cert_size);
        *current_offset = align_to(*current_offset, 8);
        Ok(Self {
            length: header.length,
            revision: header.revision,
            certificate_type: header.certificate_type,
            certificate: payload,
        })
    }

    /// Total on-disk size of the entry including alignment padding.
    pub fn aligned_len(&self) -> usize {
        align_to(
            ATTRIBUTE_CERTIFICATE_HEADER_SIZEOF + self.certificate.len(),
            8,
        )
    }
}

impl ctx::TryIntoCtx<scroll::Endian> for &AttributeCertificate<'_> {
    type Error = error::Error;

    /// Writes an aligned attribute certificate into the buffer.
    fn try_into_ctx(self, bytes: &mut [u8], ctx: scroll::Endian) -> Result<usize, Self::Error> {
        let offset = &mut 0;
        debug_assert!(
            self.length as usize % 8 == 0,
            "attribute certificate's length field is unaligned"
        );
        bytes.gwrite_with(self.length, offset, ctx)?;
        bytes.gwrite_with(self.revision, offset, ctx)?;
        bytes.gwrite_with(self.certificate_type, offset, ctx)?;
        bytes.gwrite(self.certificate, offset)?;
        if let Some(cert_padding) = pad(self.certificate.len(), 8) {
            bytes.gwrite(&cert_padding[..], offset)?;
        }
        Ok(*offset)
    }
}

/// Parse every WIN_CERTIFICATE inside `table` (a file range from the
/// certificate table directory entry).
pub fn enumerate_certificates<'a>(
    bytes: &'a [u8],
    table: Range<usize>,
) -> error::Result<Vec<AttributeCertificate<'a>>> {
    if table.end > bytes.len() {
        return Err(error::Error::Malformed(
            "end of attribute certificate table is after the end of the PE binary".into(),
        ));
    }
    let mut attrs = vec![];
    let mut current_offset = table.start;
    while current_offset < table.end {
        attrs.push(AttributeCertificate::parse(bytes, &mut current_offset)?);
    }
    Ok(attrs)
}
