//! Certificate-table mutation on an owned image buffer.
//!
//! Attached signing only ever touches the certificate table directory entry
//! and the certificate table region itself; everything else in the image is
//! left byte-identical, which is what keeps the Authenticode digest stable
//! across signing.

use scroll::Pwrite;

use crate::error;
use crate::pe::certificate_table::AttributeCertificate;
use crate::pe::data_directories::DataDirectory;
use crate::pe::Layout;

/// Rewrite the certificate table directory entry in place.
pub fn write_certificate_table_entry(
    bytes: &mut [u8],
    layout: &Layout,
    offset: u32,
    size: u32,
) -> error::Result<()> {
    let entry = DataDirectory {
        virtual_address: offset,
        size,
    };
    bytes.pwrite_with(entry, layout.certtable_entry.start, scroll::LE)?;
    Ok(())
}

/// Grow `bytes` so the certificate table can hold `added` more bytes after
/// any signatures already present, and point the directory entry at the
/// enlarged region. Returns the offset where the new certificate goes.
pub fn allocate_signature_space(
    bytes: &mut Vec<u8>,
    layout: &Layout,
    added: usize,
) -> error::Result<usize> {
    debug_assert!(added % 8 == 0, "certificate space must stay 8-byte aligned");
    let table_start = layout.insertion_offset;
    let append_at = match &layout.certtable {
        Some(table) => {
            if table.end != bytes.len() {
                return Err(error::Error::Malformed(
                    "certificate table is not at the end of the image".into(),
                ));
            }
            table.end
        }
        None => table_start,
    };
    let new_end = append_at + added;
    bytes.resize(new_end, 0);
    write_certificate_table_entry(
        bytes,
        layout,
        table_start as u32,
        (new_end - table_start) as u32,
    )?;
    Ok(append_at)
}

/// Serialize `cert` (header, payload, alignment padding) at `offset`.
pub fn append_certificate(
    bytes: &mut [u8],
    offset: usize,
    cert: &AttributeCertificate<'_>,
) -> error::Result<usize> {
    Ok(bytes.pwrite_with(cert, offset, scroll::LE)?)
}
