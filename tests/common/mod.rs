//! Shared fixtures: an in-memory software token that implements the
//! provider capability interface, a throwaway RSA signing identity, and a
//! tiny synthetic PE32+ image builder.

// Not every test binary exercises every fixture.
#![allow(dead_code)]

use std::str::FromStr;
use std::time::Duration;

use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::EncodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::Encode;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::Validity;

use efisign::alg::DigestAlgorithm;
use efisign::error::{Error, Result};
use efisign::provider::{CertificateEntry, KeyHandle, KeyProvider, Pin, TokenHandle};

pub const TOKEN_NAME: &str = "NSS Certificate DB";
pub const CERT_NICKNAME: &str = "Red Hat Test CA";

/// A token living entirely in memory: one RSA key, one self-signed
/// certificate, optional PIN.
pub struct SoftToken {
    name: String,
    pin: Option<String>,
    unlocked: bool,
    nickname: String,
    key: RsaPrivateKey,
    certificate_der: Vec<u8>,
}

impl SoftToken {
    pub fn new(pin: Option<&str>) -> Self {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 2048).expect("keygen");
        let certificate_der = self_signed_certificate(&key);
        SoftToken {
            name: TOKEN_NAME.to_string(),
            pin: pin.map(str::to_string),
            unlocked: false,
            nickname: CERT_NICKNAME.to_string(),
            key,
            certificate_der,
        }
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.key.to_public_key()
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }
}

fn self_signed_certificate(key: &RsaPrivateKey) -> Vec<u8> {
    let signing_key = SigningKey::<Sha256>::new(key.clone());
    let subject = Name::from_str("CN=Signing Test CA,O=efisign").expect("subject");
    let spki_der = key
        .to_public_key()
        .to_public_key_der()
        .expect("public key DER");
    let spki = SubjectPublicKeyInfoOwned::try_from(spki_der.as_bytes()).expect("spki");
    let builder = CertificateBuilder::new(
        Profile::Root,
        SerialNumber::new(&[0x01, 0x4e, 0x57]).expect("serial"),
        Validity::from_now(Duration::from_secs(3600)).expect("validity"),
        subject,
        spki,
        &signing_key,
    )
    .expect("builder");
    let certificate = builder
        .build::<rsa::pkcs1v15::Signature>()
        .expect("certificate");
    certificate.to_der().expect("certificate DER")
}

impl KeyProvider for SoftToken {
    fn list_tokens(&mut self) -> Result<Vec<TokenHandle>> {
        Ok(vec![TokenHandle {
            id: 1,
            name: self.name.clone(),
        }])
    }

    fn authenticate(&mut self, token: &TokenHandle, pin: &Pin) -> Result<()> {
        if token.name != self.name {
            return Err(Error::NotFound(format!("token \"{}\"", token.name)));
        }
        let accepted = match &self.pin {
            None => pin.is_empty(),
            Some(expected) => expected == pin.as_str(),
        };
        if accepted {
            self.unlocked = true;
            Ok(())
        } else {
            Err(Error::AuthFailed(self.name.clone()))
        }
    }

    fn find_certificate(
        &mut self,
        token: &TokenHandle,
        nickname: &str,
        needs_private_key: bool,
    ) -> Result<CertificateEntry> {
        if token.name != self.name {
            return Err(Error::NotFound(format!("token \"{}\"", token.name)));
        }
        if nickname != self.nickname {
            return Err(Error::NotFound(format!("certificate \"{nickname}\"")));
        }
        // Private objects stay invisible while a PIN-protected token is
        // locked, like a real PKCS#11 token.
        if needs_private_key && self.pin.is_some() && !self.unlocked {
            return Err(Error::NotFound(format!(
                "private key for \"{nickname}\""
            )));
        }
        Ok(CertificateEntry {
            certificate_der: self.certificate_der.clone(),
            key: needs_private_key.then(|| KeyHandle {
                token: self.name.clone(),
                object: 1,
            }),
        })
    }

    fn sign(
        &mut self,
        _key: &KeyHandle,
        digest_alg: DigestAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>> {
        let padding = match digest_alg {
            DigestAlgorithm::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
            #[cfg(feature = "sha1-digest")]
            DigestAlgorithm::Sha1 => Pkcs1v15Sign::new::<sha1::Sha1>(),
        };
        self.key
            .sign(padding, digest)
            .map_err(|e| Error::Crypto(e.to_string()))
    }

    fn signature_len(&mut self, _key: &KeyHandle) -> Result<usize> {
        use rsa::traits::PublicKeyParts;
        Ok(self.key.size())
    }
}

// --- synthetic PE images ---------------------------------------------------

const DOS_SIZE: usize = 0x40;
const OPT_HEADER_OFFSET: usize = DOS_SIZE + 4 + 20;
pub const SIZE_OF_HEADERS: usize = 0x200;
const FILE_ALIGNMENT: u32 = 0x200;

/// Build a minimal but well-formed PE32+ image with the given section
/// payloads, each padded to the file alignment.
pub fn build_pe(sections: &[&[u8]]) -> Vec<u8> {
    build_pe_with_magic(0x20b, sections)
}

/// The same image with a PE32 optional header (magic `0x10B`, 32-bit
/// standard and windows fields).
pub fn build_pe32(sections: &[&[u8]]) -> Vec<u8> {
    build_pe_with_magic(0x10b, sections)
}

fn build_pe_with_magic(magic: u16, sections: &[&[u8]]) -> Vec<u8> {
    let is_64 = magic == 0x20b;
    // standard fields + windows fields + 16 data directories
    let size_of_optional_header: u16 = if is_64 {
        24 + 88 + 16 * 8
    } else {
        28 + 68 + 16 * 8
    };
    let mut image = vec![0u8; SIZE_OF_HEADERS];

    // DOS header: magic + e_lfanew
    image[0] = 0x4d;
    image[1] = 0x5a;
    image[0x3c..0x40].copy_from_slice(&(DOS_SIZE as u32).to_le_bytes());

    // PE signature
    image[0x40..0x44].copy_from_slice(&0x0000_4550u32.to_le_bytes());

    // COFF header
    let coff = 0x44;
    let machine: u16 = if is_64 { 0x8664 } else { 0x14c };
    image[coff..coff + 2].copy_from_slice(&machine.to_le_bytes());
    image[coff + 2..coff + 4].copy_from_slice(&(sections.len() as u16).to_le_bytes());
    image[coff + 16..coff + 18].copy_from_slice(&size_of_optional_header.to_le_bytes());
    image[coff + 18..coff + 20].copy_from_slice(&0x0022u16.to_le_bytes());

    // Optional header
    let opt = OPT_HEADER_OFFSET;
    image[opt..opt + 2].copy_from_slice(&magic.to_le_bytes());
    let windows = opt + if is_64 { 24 } else { 28 };
    // (section alignment, file alignment) sit one u32 earlier in the 32-bit
    // layout because image_base shrinks to a u32
    let align_at = windows + if is_64 { 8 } else { 4 };
    image[align_at..align_at + 4].copy_from_slice(&0x1000u32.to_le_bytes());
    image[align_at + 4..align_at + 8].copy_from_slice(&FILE_ALIGNMENT.to_le_bytes());
    let headers_at = windows + if is_64 { 36 } else { 32 };
    image[headers_at..headers_at + 4].copy_from_slice(&(SIZE_OF_HEADERS as u32).to_le_bytes());
    let nrva_at = windows + if is_64 { 84 } else { 64 };
    image[nrva_at..nrva_at + 4].copy_from_slice(&16u32.to_le_bytes());

    // Section table + section data
    let mut table = opt + size_of_optional_header as usize;
    let mut raw_offset = SIZE_OF_HEADERS as u32;
    let mut rva = 0x1000u32;
    for (index, payload) in sections.iter().enumerate() {
        let raw_size = (payload.len() as u32).div_ceil(FILE_ALIGNMENT) * FILE_ALIGNMENT;
        let mut name = [0u8; 8];
        name[..5].copy_from_slice(b".sect");
        name[5] = b'0' + index as u8;
        image[table..table + 8].copy_from_slice(&name);
        image[table + 8..table + 12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        image[table + 12..table + 16].copy_from_slice(&rva.to_le_bytes());
        image[table + 16..table + 20].copy_from_slice(&raw_size.to_le_bytes());
        image[table + 20..table + 24].copy_from_slice(&raw_offset.to_le_bytes());

        let mut data = payload.to_vec();
        data.resize(raw_size as usize, 0);
        assert_eq!(image.len(), raw_offset as usize);
        image.extend_from_slice(&data);

        table += 40;
        raw_offset += raw_size;
        rva += raw_size.max(0x1000);
    }

    image
}
