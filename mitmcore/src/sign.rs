use crate::tlv::{Tag, TlvNode};
use log::{debug, info};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::Signer;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Signature carrier tag appended after modification.
pub const TAG_SIGNATURE: Tag = Tag::of(0x9F45);

/// Hard ceiling matching the largest value the relay clients accept.
pub const MAX_SIGNATURE_LEN: usize = 256;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("private key {path} unreadable: {reason}")]
    KeyUnreadable { path: String, reason: String },

    #[error("signature is {0} bytes, limit is {MAX_SIGNATURE_LEN}")]
    SignatureOverlength(usize),

    #[error("signing failed: {0}")]
    Backend(#[from] openssl::error::ErrorStack),
}

/// RSA private key loaded once at startup (or on an admin key-path change)
/// and shared by reference for the process lifetime.
pub struct SigningKey {
    pkey: PKey<Private>,
    bits: u32,
}

impl SigningKey {
    pub fn load(path: &Path) -> Result<SigningKey, SignError> {
        let pem = fs::read(path).map_err(|err| SignError::KeyUnreadable {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;

        let rsa = Rsa::private_key_from_pem(&pem).map_err(|err| SignError::KeyUnreadable {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;

        let bits = rsa.size() * 8;
        let pkey = PKey::from_rsa(rsa)?;

        info!("loaded {}-bit RSA signing key from {}", bits, path.display());

        Ok(SigningKey { pkey, bits })
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// RSA-SHA256 with PKCS#1 v1.5 padding over the modified byte sequence.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SignError> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.pkey)?;
        signer.update(data)?;
        let signature = signer.sign_to_vec()?;

        if signature.len() > MAX_SIGNATURE_LEN {
            return Err(SignError::SignatureOverlength(signature.len()));
        }

        debug!("signed {} bytes, signature {} bytes", data.len(), signature.len());
        Ok(signature)
    }

    /// The 9F45 node carrying the signature over `data`.
    pub fn signature_node(&self, data: &[u8]) -> Result<TlvNode, SignError> {
        Ok(TlvNode::primitive(TAG_SIGNATURE, self.sign(data)?))
    }
}
