//! Digest-engine behavior on synthetic images.

mod common;

use efisign::alg::DigestAlgorithm;
use efisign::pe::PeImage;

#[test]
fn all_enabled_algorithms_are_computed_in_one_pass() {
    let image_bytes = common::build_pe(&[b"section zero", b"section one"]);
    let image = PeImage::parse(&image_bytes).unwrap();
    let digests = image.authenticode_digests(DigestAlgorithm::Sha256).unwrap();

    assert_eq!(digests.selected, DigestAlgorithm::Sha256);
    assert_eq!(digests.selected_digest().len(), 32);
    for &alg in DigestAlgorithm::all() {
        assert_eq!(digests.get(alg).unwrap().len(), alg.digest_len());
    }
}

#[test]
fn digest_matches_a_straight_line_reference() {
    // Hash the file with the three excluded header holes cut out by hand
    // and compare against the engine.
    let image_bytes = common::build_pe(&[b"payload"]);
    let image = PeImage::parse(&image_bytes).unwrap();
    let digests = image.authenticode_digests(DigestAlgorithm::Sha256).unwrap();

    let checksum = image.layout.checksum.clone();
    let entry = image.layout.certtable_entry.clone();
    let mut reference = Vec::new();
    reference.extend_from_slice(&image_bytes[..checksum.start]);
    reference.extend_from_slice(&image_bytes[checksum.end..entry.start]);
    reference.extend_from_slice(&image_bytes[entry.end..]);

    assert_eq!(
        digests.selected_digest(),
        DigestAlgorithm::Sha256.digest(&reference)
    );
}

#[test]
fn pe32_image_parses_and_digests() {
    let image_bytes = common::build_pe32(&[b"legacy code", b"legacy data"]);
    let image = PeImage::parse(&image_bytes).unwrap();
    let optional_header = image.header.optional_header.as_ref().unwrap();
    assert!(!optional_header.is_64());
    assert_eq!(image.layout.section_ranges.len(), 2);

    // Same hand-cut reference as the 64-bit case; only the hole offsets
    // move with the smaller optional header.
    let digests = image.authenticode_digests(DigestAlgorithm::Sha256).unwrap();
    let checksum = image.layout.checksum.clone();
    let entry = image.layout.certtable_entry.clone();
    let mut reference = Vec::new();
    reference.extend_from_slice(&image_bytes[..checksum.start]);
    reference.extend_from_slice(&image_bytes[checksum.end..entry.start]);
    reference.extend_from_slice(&image_bytes[entry.end..]);
    assert_eq!(
        digests.selected_digest(),
        DigestAlgorithm::Sha256.digest(&reference)
    );
}

#[test]
fn pe32_and_pe32_plus_hole_offsets_differ() {
    let image32 = common::build_pe32(&[b"x"]);
    let image64 = common::build_pe(&[b"x"]);
    let layout32 = PeImage::parse(&image32).unwrap().layout;
    let layout64 = PeImage::parse(&image64).unwrap().layout;
    // checksum sits at the same spot in both optional headers, but the
    // directory entries do not
    assert_eq!(layout32.checksum, layout64.checksum);
    assert!(layout32.certtable_entry.start < layout64.certtable_entry.start);
}

#[test]
fn zero_section_image_parses_and_digests() {
    let image_bytes = common::build_pe(&[]);
    let image = PeImage::parse(&image_bytes).unwrap();
    assert!(image.layout.section_ranges.is_empty());
    assert!(image.certificates.is_empty());
    let digests = image.authenticode_digests(DigestAlgorithm::Sha256).unwrap();
    assert_eq!(digests.selected_digest().len(), 32);
}

#[test]
fn overlapping_sections_are_rejected() {
    let mut image_bytes = common::build_pe(&[b"one", b"two"]);
    // Point the second section's raw data back into the first.
    let second_entry = 0x58 + 240 + 40;
    image_bytes[second_entry + 20..second_entry + 24]
        .copy_from_slice(&(common::SIZE_OF_HEADERS as u32).to_le_bytes());
    assert!(PeImage::parse(&image_bytes).is_err());
}

#[test]
fn sections_past_eof_are_rejected() {
    let mut image_bytes = common::build_pe(&[b"only"]);
    let entry = 0x58 + 240;
    image_bytes[entry + 16..entry + 20].copy_from_slice(&0x10_0000u32.to_le_bytes());
    assert!(PeImage::parse(&image_bytes).is_err());
}

#[test]
fn non_pe_input_is_rejected() {
    assert!(PeImage::parse(&[0u8; 128]).is_err());
    let mut bytes = common::build_pe(&[]);
    bytes[0x41] = 0xff; // break "PE\0\0"
    assert!(PeImage::parse(&bytes).is_err());
}

#[test]
fn trailing_data_is_part_of_the_digest() {
    let base = common::build_pe(&[b"data"]);
    let mut trailed = base.clone();
    trailed.extend_from_slice(&[0xEE; 16]);

    let digest_base = PeImage::parse(&base)
        .unwrap()
        .authenticode_digests(DigestAlgorithm::Sha256)
        .unwrap();
    let digest_trailed = PeImage::parse(&trailed)
        .unwrap()
        .authenticode_digests(DigestAlgorithm::Sha256)
        .unwrap();
    assert_ne!(
        digest_base.selected_digest(),
        digest_trailed.selected_digest()
    );
}
