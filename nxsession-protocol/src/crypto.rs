//! Session encryption.
//!
//! The peer opens the exchange with `CMD_REQUEST_SESSION_KEY`, carrying its
//! X25519 public key and a bitmask of supported ciphers. The client answers
//! with `CMD_SESSION_KEY`: a fresh ChaCha20-Poly1305 key and IV, each wrapped
//! under a key-encryption key derived from an ephemeral X25519 agreement.
//!
//! Once installed, every outgoing frame (except those flagged
//! `DONT_ENCRYPT`) travels inside a `CMD_ENCRYPTED_MESSAGE` envelope whose
//! binary payload is `[nonce 12][ciphertext+tag]`. The session IV is bound
//! to every frame as associated data.

use crate::codes::*;
use crate::error::{ProtocolError, ResultCode};
use crate::frame::{Frame, FrameFlags};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const IV_LEN: usize = 12;
const KEY_WRAP_LABEL: &[u8] = b"nxsession key wrap";

/// Symmetric state of an encrypted session.
pub struct EncryptionContext {
    cipher: ChaCha20Poly1305,
    iv: [u8; IV_LEN],
}

impl std::fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionContext")
            .field("cipher", &"chacha20-poly1305")
            .finish()
    }
}

impl EncryptionContext {
    fn new(key: &[u8; KEY_LEN], iv: [u8; IV_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
            iv,
        }
    }

    /// Handles a `CMD_REQUEST_SESSION_KEY` frame from the peer.
    ///
    /// Returns the new context and the `CMD_SESSION_KEY` reply to send. The
    /// reply itself must go out unencrypted.
    pub fn negotiate(request: &Frame) -> Result<(Self, Frame), ProtocolError> {
        let supported = request.get_u32(VID_SUPPORTED_ENCRYPTION).unwrap_or(0);
        if supported & SUPPORT_CHACHA20_POLY1305 == 0 {
            return Err(ProtocolError::Encryption(format!(
                "no common cipher (peer offers {:#x})",
                supported
            )));
        }
        let peer_public = public_key_from(request)?;

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&peer_public);
        let kek = derive_kek(shared.as_bytes(), &ephemeral_public, &peer_public);

        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut iv);

        let wrapped_key = wrap(&kek, &key)?;
        let wrapped_iv = wrap(&kek, &iv)?;

        let mut reply = Frame::with_id(CMD_SESSION_KEY, request.id)
            .with_field(VID_RCC, ResultCode::Success.as_u32())
            .with_field(VID_CIPHER, CIPHER_CHACHA20_POLY1305)
            .with_field(VID_KEY_LENGTH, KEY_LEN as u16)
            .with_field(VID_IV_LENGTH, IV_LEN as u16)
            .with_field(VID_SESSION_KEY, wrapped_key)
            .with_field(VID_SESSION_IV, wrapped_iv)
            .with_field(VID_PUBLIC_KEY, ephemeral_public.as_bytes().to_vec());
        reply.flags.set(FrameFlags::DONT_ENCRYPT, true);

        Ok((Self::new(&key, iv), reply))
    }

    /// Builds the unencrypted reply sent when negotiation fails.
    pub fn failure_reply(request: &Frame, rcc: ResultCode) -> Frame {
        let mut reply =
            Frame::with_id(CMD_SESSION_KEY, request.id).with_field(VID_RCC, rcc.as_u32());
        reply.flags.set(FrameFlags::DONT_ENCRYPT, true);
        reply
    }

    /// Encrypts an encoded frame; output is `[nonce][ciphertext]`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &self.iv,
                },
            )
            .map_err(|_| ProtocolError::Encryption("encrypt failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts an envelope payload produced by [`EncryptionContext::encrypt`].
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        if data.len() < NONCE_LEN {
            return Err(ProtocolError::Encryption("envelope too short".into()));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: &self.iv,
                },
            )
            .map_err(|_| ProtocolError::Encryption("authentication tag mismatch".into()))
    }
}

/// Long-term key pair of the serving side of the exchange.
pub struct PeerKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl PeerKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Builds the `CMD_REQUEST_SESSION_KEY` frame that starts the exchange.
    pub fn key_request(&self, id: u32) -> Frame {
        let mut frame = Frame::with_id(CMD_REQUEST_SESSION_KEY, id)
            .with_field(VID_PUBLIC_KEY, self.public.as_bytes().to_vec())
            .with_field(VID_SUPPORTED_ENCRYPTION, SUPPORT_CHACHA20_POLY1305);
        frame.flags.set(FrameFlags::DONT_ENCRYPT, true);
        frame
    }

    /// Unwraps the session key from a `CMD_SESSION_KEY` reply.
    pub fn accept(&self, reply: &Frame) -> Result<EncryptionContext, ProtocolError> {
        let rcc = ResultCode::from_u32(reply.get_u32(VID_RCC).unwrap_or(0));
        if !rcc.is_success() {
            return Err(ProtocolError::Encryption(format!(
                "session key rejected: {}",
                rcc
            )));
        }
        let client_public = public_key_from(reply)?;
        let shared = self.secret.diffie_hellman(&client_public);
        let kek = derive_kek(shared.as_bytes(), &client_public, &self.public);

        let wrapped_key = reply
            .get_bytes(VID_SESSION_KEY)
            .ok_or(ProtocolError::MissingField(VID_SESSION_KEY))?;
        let wrapped_iv = reply
            .get_bytes(VID_SESSION_IV)
            .ok_or(ProtocolError::MissingField(VID_SESSION_IV))?;

        let key: [u8; KEY_LEN] = unwrap_key(&kek, &wrapped_key)?
            .try_into()
            .map_err(|_| ProtocolError::Encryption("bad session key length".into()))?;
        let iv: [u8; IV_LEN] = unwrap_key(&kek, &wrapped_iv)?
            .try_into()
            .map_err(|_| ProtocolError::Encryption("bad session IV length".into()))?;

        Ok(EncryptionContext::new(&key, iv))
    }
}

fn public_key_from(frame: &Frame) -> Result<PublicKey, ProtocolError> {
    let raw = frame
        .get_bytes(VID_PUBLIC_KEY)
        .ok_or(ProtocolError::MissingField(VID_PUBLIC_KEY))?;
    let bytes: [u8; 32] = raw
        .as_ref()
        .try_into()
        .map_err(|_| ProtocolError::Encryption("public key must be 32 bytes".into()))?;
    Ok(PublicKey::from(bytes))
}

fn derive_kek(shared: &[u8], client: &PublicKey, server: &PublicKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(KEY_WRAP_LABEL);
    hasher.update(shared);
    hasher.update(client.as_bytes());
    hasher.update(server.as_bytes());
    hasher.finalize().into()
}

fn wrap(kek: &[u8; 32], material: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let cipher = ChaCha20Poly1305::new(kek.into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), material)
        .map_err(|_| ProtocolError::Encryption("key wrap failed".into()))?;
    let mut out = nonce_bytes.to_vec();
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn unwrap_key(kek: &[u8; 32], wrapped: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if wrapped.len() < NONCE_LEN {
        return Err(ProtocolError::Encryption("wrapped key too short".into()));
    }
    let (nonce_bytes, sealed) = wrapped.split_at(NONCE_LEN);
    ChaCha20Poly1305::new(kek.into())
        .decrypt(Nonce::from_slice(nonce_bytes), sealed)
        .map_err(|_| ProtocolError::Encryption("key unwrap failed".into()))
}
