//! The production key provider: a PKCS#11 module driven through `cryptoki`.
//!
//! One read-only session is kept per token; `C_Login` state rides on the
//! session, so a token unlocked once stays unlocked for the provider's
//! lifetime, which is exactly the contract the daemon's registry assumes.

use std::collections::HashMap;
use std::path::Path;

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::RvError;
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use der::Encode;
use log::{debug, info};

use crate::alg::DigestAlgorithm;
use crate::cms::pkcs7::DigestInfo;
use crate::error;
use crate::provider::{CertificateEntry, KeyHandle, KeyProvider, Pin, TokenHandle};

fn crypto_err(context: &str, err: cryptoki::error::Error) -> error::Error {
    error::Error::Crypto(format!("{context}: {err}"))
}

pub struct Pkcs11Provider {
    ctx: Pkcs11,
    /// token label -> open (possibly authenticated) session
    sessions: HashMap<String, Session>,
    /// provider-scoped key ids handed out through [`KeyHandle`]
    objects: HashMap<u64, ObjectHandle>,
    next_object_id: u64,
}

impl Pkcs11Provider {
    /// Load and initialize a PKCS#11 module, e.g. the softhsm or OpenSC
    /// shared object.
    pub fn new(module: &Path) -> error::Result<Self> {
        let ctx = Pkcs11::new(module).map_err(|e| crypto_err("could not load PKCS#11 module", e))?;
        ctx.initialize(CInitializeArgs::OsThreads)
            .map_err(|e| crypto_err("could not initialize PKCS#11 module", e))?;
        Ok(Pkcs11Provider {
            ctx,
            sessions: HashMap::new(),
            objects: HashMap::new(),
            next_object_id: 1,
        })
    }

    fn slot_for(&self, name: &str) -> error::Result<Slot> {
        let slots = self
            .ctx
            .get_slots_with_token()
            .map_err(|e| crypto_err("could not list tokens", e))?;
        for slot in slots {
            let info = self
                .ctx
                .get_token_info(slot)
                .map_err(|e| crypto_err("could not read token info", e))?;
            if info.label().trim_end() == name {
                return Ok(slot);
            }
        }
        Err(error::Error::NotFound(format!("token \"{name}\"")))
    }

    fn session_for(&mut self, name: &str) -> error::Result<&Session> {
        if !self.sessions.contains_key(name) {
            let slot = self.slot_for(name)?;
            let session = self
                .ctx
                .open_ro_session(slot)
                .map_err(|e| crypto_err("could not open token session", e))?;
            self.sessions.insert(name.to_string(), session);
        }
        Ok(&self.sessions[name])
    }

    fn key_object(&self, key: &KeyHandle) -> error::Result<ObjectHandle> {
        self.objects.get(&key.object).copied().ok_or_else(|| {
            error::Error::NotFound(format!("key handle {} on token \"{}\"", key.object, key.token))
        })
    }
}

impl KeyProvider for Pkcs11Provider {
    fn list_tokens(&mut self) -> error::Result<Vec<TokenHandle>> {
        let slots = self
            .ctx
            .get_slots_with_token()
            .map_err(|e| crypto_err("could not list tokens", e))?;
        let mut tokens = Vec::with_capacity(slots.len());
        for slot in slots {
            let info = self
                .ctx
                .get_token_info(slot)
                .map_err(|e| crypto_err("could not read token info", e))?;
            tokens.push(TokenHandle {
                id: slot.id(),
                name: info.label().trim_end().to_string(),
            });
        }
        Ok(tokens)
    }

    fn authenticate(&mut self, token: &TokenHandle, pin: &Pin) -> error::Result<()> {
        let name = token.name.clone();
        let session = self.session_for(&name)?;
        let auth_pin;
        let pin_arg = if pin.is_empty() {
            None
        } else {
            auth_pin = AuthPin::new(pin.as_str().to_string());
            Some(&auth_pin)
        };
        match session.login(UserType::User, pin_arg) {
            Ok(()) => {
                info!("authentication succeeded for token \"{name}\"");
                Ok(())
            }
            // already unlocked: authenticate is idempotent
            Err(cryptoki::error::Error::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => Ok(()),
            Err(cryptoki::error::Error::Pkcs11(RvError::PinIncorrect, _))
            | Err(cryptoki::error::Error::Pkcs11(RvError::PinInvalid, _))
            | Err(cryptoki::error::Error::Pkcs11(RvError::PinLenRange, _)) => {
                Err(error::Error::AuthFailed(name))
            }
            Err(e) => Err(crypto_err("login failed", e)),
        }
    }

    fn find_certificate(
        &mut self,
        token: &TokenHandle,
        nickname: &str,
        needs_private_key: bool,
    ) -> error::Result<CertificateEntry> {
        let name = token.name.clone();
        let session = self.session_for(&name)?;
        let template = [
            Attribute::Class(ObjectClass::CERTIFICATE),
            Attribute::Label(nickname.as_bytes().to_vec()),
        ];
        let candidates = session
            .find_objects(&template)
            .map_err(|e| crypto_err("certificate search failed", e))?;
        debug!(
            "token \"{name}\": {} certificate(s) labelled \"{nickname}\"",
            candidates.len()
        );

        let mut resolved: Option<(Vec<u8>, Option<ObjectHandle>)> = None;
        for candidate in candidates {
            let attrs = session
                .get_attributes(candidate, &[AttributeType::Value, AttributeType::Id])
                .map_err(|e| crypto_err("could not read certificate attributes", e))?;
            let mut cert_der = None;
            let mut id = None;
            for attr in attrs {
                match attr {
                    Attribute::Value(v) => cert_der = Some(v),
                    Attribute::Id(v) => id = Some(v),
                    _ => (),
                }
            }
            let Some(cert_der) = cert_der else { continue };

            let key = if needs_private_key {
                let mut key_template = vec![Attribute::Class(ObjectClass::PRIVATE_KEY)];
                match id {
                    Some(id) => key_template.push(Attribute::Id(id)),
                    None => key_template.push(Attribute::Label(nickname.as_bytes().to_vec())),
                }
                let keys = session
                    .find_objects(&key_template)
                    .map_err(|e| crypto_err("private key search failed", e))?;
                match keys.first() {
                    Some(key) => Some(*key),
                    // certificate without its key does not qualify
                    None => continue,
                }
            } else {
                None
            };

            if resolved.is_some() {
                return Err(error::Error::Ambiguous(nickname.to_string()));
            }
            resolved = Some((cert_der, key));
        }

        let (certificate_der, key_object) = resolved
            .ok_or_else(|| error::Error::NotFound(format!("certificate \"{nickname}\"")))?;
        let key = key_object.map(|object| {
            let id = self.next_object_id;
            self.next_object_id += 1;
            self.objects.insert(id, object);
            KeyHandle {
                token: name.clone(),
                object: id,
            }
        });
        Ok(CertificateEntry {
            certificate_der,
            key,
        })
    }

    fn sign(
        &mut self,
        key: &KeyHandle,
        digest_alg: DigestAlgorithm,
        digest: &[u8],
    ) -> error::Result<Vec<u8>> {
        let object = self.key_object(key)?;
        let digest_info = DigestInfo::new(digest_alg, digest)?.to_der()?;
        let token = key.token.clone();
        let session = self.session_for(&token)?;
        session
            .sign(&Mechanism::RsaPkcs, object, &digest_info)
            .map_err(|e| crypto_err("token signing operation failed", e))
    }

    fn signature_len(&mut self, key: &KeyHandle) -> error::Result<usize> {
        let object = self.key_object(key)?;
        let token = key.token.clone();
        let session = self.session_for(&token)?;
        let attrs = session
            .get_attributes(object, &[AttributeType::ModulusBits, AttributeType::Modulus])
            .map_err(|e| crypto_err("could not read key attributes", e))?;
        for attr in attrs {
            match attr {
                Attribute::ModulusBits(bits) => {
                    let bits: u64 = bits.into();
                    return Ok(bits as usize / 8);
                }
                Attribute::Modulus(modulus) => return Ok(modulus.len()),
                _ => (),
            }
        }
        Err(error::Error::Crypto(
            "key exposes neither modulus nor modulus length".into(),
        ))
    }
}
