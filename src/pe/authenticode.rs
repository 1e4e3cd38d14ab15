//! The Authenticode digest engine.
//!
//! Reference:
//!   https://learn.microsoft.com/en-us/windows-hardware/drivers/install/authenticode
//!
//! Authenticode works by omitting regions of the PE binary from the digest.
//! Those regions are:
//!   - the image checksum field
//!   - the data directory entry for the certificate table
//!   - the certificate table itself
//!   - anything past the signed region
//!
//! The engine walks the hashable ranges once, feeding every enabled
//! algorithm, so a later re-sign with a different algorithm needs no second
//! read of the image.

use core::ops::Range;

use crate::alg::DigestAlgorithm;
use crate::error;

use super::PeImage;

/// One digest per enabled algorithm, with one marked as the content hash for
/// the signature being assembled.
#[derive(Debug, Clone)]
pub struct DigestSet {
    pub selected: DigestAlgorithm,
    entries: Vec<(DigestAlgorithm, Vec<u8>)>,
}

impl DigestSet {
    pub fn get(&self, alg: DigestAlgorithm) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(a, _)| *a == alg)
            .map(|(_, d)| d.as_slice())
    }

    /// The digest selected as the content hash.
    pub fn selected_digest(&self) -> &[u8] {
        self.get(self.selected)
            .expect("selected algorithm is always computed")
    }
}

impl PeImage<'_> {
    /// The byte ranges contributing to the Authenticode hash, in file order,
    /// yielded as slices of the underlying image.
    pub fn authenticode_ranges(&self) -> AuthenticodeRanges<'_> {
        AuthenticodeRanges {
            image: self,
            ranges: self.layout.hashable_ranges(),
            index: 0,
        }
    }

    /// Run every enabled digest algorithm over the hashable ranges in a
    /// single streaming pass.
    pub fn authenticode_digests(&self, selected: DigestAlgorithm) -> error::Result<DigestSet> {
        let mut contexts: Vec<_> = DigestAlgorithm::all()
            .iter()
            .map(|&alg| (alg, alg.hasher()))
            .collect();
        for chunk in self.authenticode_ranges() {
            for (_, ctx) in contexts.iter_mut() {
                ctx.update(chunk);
            }
        }
        let entries = contexts
            .into_iter()
            .map(|(alg, ctx)| (alg, ctx.finalize().into_vec()))
            .collect();
        Ok(DigestSet { selected, entries })
    }
}

pub struct AuthenticodeRanges<'s> {
    image: &'s PeImage<'s>,
    ranges: Vec<Range<usize>>,
    index: usize,
}

impl<'s> Iterator for AuthenticodeRanges<'s> {
    type Item = &'s [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let range = self.ranges.get(self.index)?.clone();
        self.index += 1;
        Some(&self.image.bytes[range])
    }
}

#[cfg(test)]
mod tests {
    use super::super::Layout;

    fn layout(file_len: usize) -> Layout {
        Layout {
            checksum: 0xd8..0xdc,
            certtable_entry: 0x128..0x130,
            size_of_headers: 0x200,
            section_ranges: vec![0x200..0x400],
            certtable: None,
            insertion_offset: crate::pe::utils::align_to(file_len, 8),
            signed_len: file_len,
            file_len,
        }
    }

    #[test]
    fn ranges_skip_exactly_the_excluded_regions() {
        let layout = layout(0x400);
        let ranges = layout.hashable_ranges();
        assert_eq!(
            ranges,
            vec![0..0xd8, 0xdc..0x128, 0x130..0x200, 0x200..0x400]
        );
        // Union covers the file minus the two header holes.
        let hashed: usize = ranges.iter().map(|r| r.len()).sum();
        assert_eq!(hashed, 0x400 - 4 - 8);
    }

    #[test]
    fn trailing_bytes_inside_the_signed_region_are_hashed() {
        let layout = layout(0x40d);
        let ranges = layout.hashable_ranges();
        assert_eq!(ranges.last().unwrap().clone(), 0x400..0x40d);
    }

    #[test]
    fn certificate_table_payload_is_excluded() {
        let mut layout = layout(0x500);
        layout.certtable = Some(0x408..0x500);
        layout.insertion_offset = 0x408;
        layout.signed_len = 0x408;
        let ranges = layout.hashable_ranges();
        assert_eq!(ranges.last().unwrap().clone(), 0x400..0x408);
    }
}
