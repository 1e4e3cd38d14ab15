//! A PE32 and PE32+ image view for Authenticode signing.
//!
//! Parsing produces a [`PeImage`]: the decoded headers, the section table
//! sorted by raw-data offset, any signatures already present, and a
//! [`Layout`] of precomputed offsets — everything the digest engine and the
//! certificate-table writer need without re-walking the headers.

pub mod authenticode;
pub mod certificate_table;
pub mod data_directories;
pub mod header;
pub mod optional_header;
pub mod section_table;
pub mod utils;
pub mod writer;

use core::ops::Range;

use log::debug;

use crate::error;

/// Reject anything claiming more sections than a sane linker emits.
pub const MAX_SECTIONS: usize = 96;

/// Byte offsets of everything the signer touches or skips.
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    /// The 4-byte image checksum inside the optional header
    pub checksum: Range<usize>,
    /// The 8-byte certificate table directory entry
    pub certtable_entry: Range<usize>,
    /// SizeOfHeaders: end of the header region
    pub size_of_headers: usize,
    /// Raw-data ranges of the sections, ascending, zero-size sections skipped
    pub section_ranges: Vec<Range<usize>>,
    /// The existing certificate table, if any
    pub certtable: Option<Range<usize>>,
    /// Where a certificate table begins or would begin (8-byte aligned)
    pub insertion_offset: usize,
    /// Everything before this offset is covered by the digest ranges
    pub signed_len: usize,
    /// Total file length at parse time
    pub file_len: usize,
}

#[derive(Debug)]
/// An analyzed PE32/PE32+ binary
pub struct PeImage<'a> {
    pub bytes: &'a [u8],
    pub header: header::Header,
    /// Sections in ascending `PointerToRawData` order
    pub sections: Vec<section_table::SectionTable>,
    pub layout: Layout,
    /// Signatures already embedded in the image, in table order
    pub certificates: Vec<certificate_table::AttributeCertificate<'a>>,
}

impl<'a> PeImage<'a> {
    /// Reads a PE binary from the underlying `bytes`.
    pub fn parse(bytes: &'a [u8]) -> error::Result<Self> {
        let header = header::Header::parse(bytes)?;
        let machine = header.coff_header.machine;
        if !header::SIGNABLE_MACHINES.contains(&machine) {
            return Err(error::Error::Malformed(format!(
                "machine type {:#x} ({}) is not signable",
                machine,
                header::machine_to_str(machine)
            )));
        }
        let optional_header = header.optional_header.as_ref().ok_or_else(|| {
            error::Error::Malformed("image has no optional header".to_string())
        })?;

        let nsections = header.coff_header.number_of_sections as usize;
        if nsections > MAX_SECTIONS {
            return Err(error::Error::Malformed(format!(
                "image claims {nsections} sections, more than the maximum of {MAX_SECTIONS}"
            )));
        }
        let mut offset = header.dos_header.pe_pointer as usize
            + header::SIZEOF_PE_MAGIC
            + header::SIZEOF_COFF_HEADER
            + header.coff_header.size_of_optional_header as usize;
        if nsections > bytes.len() / section_table::SIZEOF_SECTION_TABLE {
            return Err(error::Error::BufferTooShort(nsections, "sections"));
        }
        let mut sections = Vec::with_capacity(nsections);
        for i in 0..nsections {
            let section = section_table::SectionTable::parse(bytes, &mut offset)?;
            debug!("({}) {:#x?}", i, section);
            sections.push(section);
        }
        sections.sort_by_key(|s| s.pointer_to_raw_data);

        let layout = Layout::compute(bytes, optional_header, &sections)?;
        let certificates = match layout.certtable.clone() {
            Some(table) => certificate_table::enumerate_certificates(bytes, table)?,
            None => vec![],
        };

        Ok(PeImage {
            bytes,
            header,
            sections,
            layout,
            certificates,
        })
    }
}

impl Layout {
    fn compute(
        bytes: &[u8],
        optional_header: &optional_header::OptionalHeader,
        sections: &[section_table::SectionTable],
    ) -> error::Result<Self> {
        let file_len = bytes.len();
        let checksum_start = optional_header.checksum_offset();
        let checksum = checksum_start..checksum_start + 4;

        if optional_header.windows_fields.number_of_rva_and_sizes as usize
            <= data_directories::CERTIFICATE_TABLE_INDEX
        {
            return Err(error::Error::Malformed(
                "optional header has no certificate table directory entry".to_string(),
            ));
        }
        let entry_start = optional_header.certificate_table_entry_offset();
        let certtable_entry = entry_start..entry_start + data_directories::SIZEOF_DATA_DIRECTORY;

        let size_of_headers = optional_header.windows_fields.size_of_headers as usize;
        if size_of_headers < certtable_entry.end || size_of_headers > file_len {
            return Err(error::Error::Malformed(format!(
                "SizeOfHeaders ({size_of_headers:#x}) is outside the image"
            )));
        }

        // Sections arrive sorted by raw-data pointer; their on-disk ranges
        // must stay inside the file and out of each other.
        let mut section_ranges = Vec::with_capacity(sections.len());
        let mut previous_end = size_of_headers;
        for section in sections {
            if section.size_of_raw_data == 0 {
                continue;
            }
            let range = section.raw_data_range();
            if range.start < previous_end || range.end > file_len {
                return Err(error::Error::Malformed(format!(
                    "section \"{}\" raw data {:#x}..{:#x} overlaps or runs past EOF",
                    section.name(),
                    range.start,
                    range.end
                )));
            }
            previous_end = range.end;
            section_ranges.push(range);
        }

        let certtable = match optional_header.data_directories.get_certificate_table() {
            Some(dd) => {
                let start = dd.virtual_address as usize;
                let end = start + dd.size as usize;
                if start < previous_end || end > file_len {
                    return Err(error::Error::Malformed(format!(
                        "certificate table {start:#x}..{end:#x} is outside the unsigned tail"
                    )));
                }
                Some(start..end)
            }
            None => None,
        };

        // With no table present the next signature lands at the 8-aligned end
        // of file, keeping any trailing non-section data inside the digest.
        let (insertion_offset, signed_len) = match &certtable {
            Some(table) => (table.start, table.start),
            None => (utils::align_to(file_len, 8), file_len),
        };

        Ok(Layout {
            checksum,
            certtable_entry,
            size_of_headers,
            section_ranges,
            certtable,
            insertion_offset,
            signed_len,
            file_len,
        })
    }

    /// The ordered, pairwise-disjoint byte ranges that feed the digest
    /// engine: the whole file minus the checksum field, the certificate
    /// table directory entry, the certificate table payload, and any bytes
    /// past the signed region.
    pub fn hashable_ranges(&self) -> Vec<Range<usize>> {
        let mut ranges = Vec::with_capacity(self.section_ranges.len() + 4);
        ranges.push(0..self.checksum.start);
        ranges.push(self.checksum.end..self.certtable_entry.start);
        ranges.push(self.certtable_entry.end..self.size_of_headers);
        let mut tail = self.size_of_headers;
        for section in &self.section_ranges {
            ranges.push(section.clone());
            tail = section.end;
        }
        if self.signed_len > tail {
            ranges.push(tail..self.signed_len);
        }
        ranges.retain(|r| !r.is_empty());
        ranges
    }
}
