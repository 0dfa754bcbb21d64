//! TEE side of the tag scheme, for tests.
//!
//! The key uses the Mersenne primes `2^521 - 1` and `2^607 - 1`, so it is
//! deterministic and cheap to build. It is public knowledge and must never
//! tag real data.

use num_bigint::BigUint;
use num_traits::One;
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::traits::PublicKeyParts;
use sha2::{Digest, Sha256};

use crate::key::attest_digest;
use crate::proof::QElement;
use crate::tag::{T, Tag};
use crate::RsaKey;

/// DER prefix of a SHA-256 DigestInfo (RFC 8017, section 9.2).
const SHA256_DIGEST_INFO: [u8; 19] = [
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];

pub struct TestTee {
    n: BigUint,
    e: BigUint,
    d: BigUint,
}

impl Default for TestTee {
    fn default() -> Self {
        Self::new()
    }
}

impl TestTee {
    pub fn new() -> Self {
        let one = BigUint::one();
        let p = (&one << 521usize) - &one;
        let q = (&one << 607usize) - &one;
        let phi = (&p - &one) * (&q - &one);
        let e = BigUint::from(65_537u32);
        let d = e
            .modinv(&phi)
            .expect("65537 is coprime with the Mersenne totient");
        Self { n: p * q, e, d }
    }

    pub fn public_key(&self) -> RsaKey {
        RsaKey::from_components(&self.n, &self.e).expect("test key components are valid")
    }

    /// PKCS#1 DER encoding of the public key, as the chain stores it.
    pub fn public_key_der(&self) -> Vec<u8> {
        let public = rsa::RsaPublicKey::new(
            rsa::BigUint::from_bytes_be(&self.n.to_bytes_be()),
            rsa::BigUint::from_bytes_be(&self.e.to_bytes_be()),
        )
        .expect("test key components are valid");
        debug_assert_eq!(public.size(), self.modulus_len());
        public
            .to_pkcs1_der()
            .expect("test key encodes")
            .as_bytes()
            .to_vec()
    }

    fn modulus_len(&self) -> usize {
        (self.n.bits() as usize).div_ceil(8)
    }

    /// RSASSA-PKCS1-v1_5 signature over a SHA-256 digest.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Vec<u8> {
        let k = self.modulus_len();
        let t_len = SHA256_DIGEST_INFO.len() + digest.len();
        let mut em = vec![0xffu8; k];
        em[0] = 0x00;
        em[1] = 0x01;
        em[k - t_len - 1] = 0x00;
        em[k - t_len..k - digest.len()].copy_from_slice(&SHA256_DIGEST_INFO);
        em[k - digest.len()..].copy_from_slice(digest);

        let s = BigUint::from_bytes_be(&em).modpow(&self.d, &self.n);
        let raw = s.to_bytes_be();
        let mut out = vec![0u8; k - raw.len()];
        out.extend_from_slice(&raw);
        out
    }

    /// Hex attestation over a tag, as a TEE returns it.
    pub fn attest(&self, name: &str, u: &str, phi_hash: &str, custom_data: &str) -> String {
        let digest =
            attest_digest(name, u, phi_hash, custom_data).expect("phi_hash is hex encoded");
        hex::encode(self.sign_digest(&digest))
    }

    fn hash_index(&self, name: &str, index: usize) -> BigUint {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update((index as u64).to_be_bytes());
        BigUint::from_bytes_be(&hasher.finalize()) % &self.n
    }

    fn base_u(&self, name: &str) -> BigUint {
        let digest = Sha256::digest([name.as_bytes(), b"/u"].concat());
        BigUint::from_bytes_be(&digest) % &self.n
    }

    /// Tag a fragment split into `blocks`.
    pub fn gen_tag(&self, name: &str, blocks: &[Vec<u8>]) -> Tag {
        let u = self.base_u(name);
        let phi: Vec<String> = blocks
            .iter()
            .enumerate()
            .map(|(i, block)| {
                let m = BigUint::from_bytes_be(block);
                let base = (self.hash_index(name, i) * u.modpow(&m, &self.n)) % &self.n;
                base.modpow(&self.d, &self.n).to_str_radix(10)
            })
            .collect();
        let phi_hash = Tag::compute_phi_hash(&phi);
        let u = u.to_str_radix(10);
        let attest = self.attest(name, &u, &phi_hash, "");
        Tag {
            t: T {
                name: name.to_string(),
                u,
                phi,
            },
            phi_hash,
            attest,
        }
    }

    /// Check an aggregate response over several fragments.
    ///
    /// `σ^e = ∏_f ( ∏_q H(name_f ‖ i)^v · u_f^μ_f ) mod N`
    pub fn verify_aggregate(
        &self,
        challenge: &[QElement],
        names: &[String],
        us: &[String],
        mus: &[String],
        sigma: &str,
    ) -> bool {
        if names.len() != us.len() || names.len() != mus.len() {
            return false;
        }
        let parse = |s: &str| BigUint::parse_bytes(s.as_bytes(), 10);
        let Some(sigma) = parse(sigma) else {
            return false;
        };

        let mut rhs = BigUint::one();
        for ((name, u), mu) in names.iter().zip(us).zip(mus) {
            let (Some(u), Some(mu)) = (parse(u), parse(mu)) else {
                return false;
            };
            for q in challenge {
                let Some(v) = parse(&q.v) else {
                    return false;
                };
                if q.i < 0 {
                    return false;
                }
                rhs = (rhs * self.hash_index(name, q.i as usize).modpow(&v, &self.n)) % &self.n;
            }
            rhs = (rhs * u.modpow(&mu, &self.n)) % &self.n;
        }
        sigma.modpow(&self.e, &self.n) == rhs
    }
}
