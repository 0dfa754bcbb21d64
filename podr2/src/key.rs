//! TEE tagging public key.

use num_bigint::BigUint;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::{Podr2Error, Result};

/// RSA public key the TEEs tag fragments with, as registered on chain.
#[derive(Debug, Clone)]
pub struct RsaKey {
    n: BigUint,
    public: RsaPublicKey,
}

impl RsaKey {
    /// Parse a PKCS#1 DER encoded public key.
    pub fn from_pkcs1_der(der: &[u8]) -> Result<Self> {
        let public = RsaPublicKey::from_pkcs1_der(der)
            .map_err(|e| Podr2Error::InvalidKey(e.to_string()))?;
        Ok(Self::wrap(public))
    }

    pub fn from_components(n: &BigUint, e: &BigUint) -> Result<Self> {
        let public = RsaPublicKey::new(
            rsa::BigUint::from_bytes_be(&n.to_bytes_be()),
            rsa::BigUint::from_bytes_be(&e.to_bytes_be()),
        )
        .map_err(|e| Podr2Error::InvalidKey(e.to_string()))?;
        Ok(Self::wrap(public))
    }

    fn wrap(public: RsaPublicKey) -> Self {
        Self {
            n: BigUint::from_bytes_be(&public.n().to_bytes_be()),
            public,
        }
    }

    /// Modulus `N`.
    pub fn modulus(&self) -> &BigUint {
        &self.n
    }

    /// Check the TEE's attestation over a tag.
    ///
    /// The signed digest is `SHA256(SHA256(custom_data ‖ name ‖ u ‖ phi_hash))`.
    /// A signature that does not verify yields `Ok(false)`; undecodable hex
    /// is an error.
    pub fn verify_attest(
        &self,
        name: &str,
        u: &str,
        phi_hash: &str,
        attest: &str,
        custom_data: &str,
    ) -> Result<bool> {
        let hashed = attest_digest(name, u, phi_hash, custom_data)?;
        let signature = hex::decode(attest).map_err(|source| Podr2Error::InvalidHex {
            field: "attest",
            source,
        })?;
        Ok(self
            .public
            .verify(Pkcs1v15Sign::new::<Sha256>(), &hashed, &signature)
            .is_ok())
    }
}

/// Digest the TEE signs when attesting a tag.
pub fn attest_digest(name: &str, u: &str, phi_hash: &str, custom_data: &str) -> Result<[u8; 32]> {
    let phi_hash = hex::decode(phi_hash).map_err(|source| Podr2Error::InvalidHex {
        field: "phi_hash",
        source,
    })?;
    let mut hasher = Sha256::new();
    hasher.update(custom_data.as_bytes());
    hasher.update(name.as_bytes());
    hasher.update(u.as_bytes());
    hasher.update(&phi_hash);
    let inner = hasher.finalize();
    Ok(Sha256::digest(inner).into())
}
