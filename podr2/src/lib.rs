//! PoDR2 homomorphic tags for service-file challenges.
//!
//! A TEE tags every fragment the miner stores: the fragment is split into
//! `n` blocks `m_i` and each block gets an RSA authenticator
//! `φ_i = (H(name‖i) · u^m_i)^d mod N`. Answering a challenge `{(i, v_i)}`
//! needs only the blocks and their tags:
//!
//! ```text
//! μ = Σ v_i · m_i        σ = ∏ φ_i^v_i mod N
//! ```
//!
//! σ values of different fragments multiply together, so one aggregate σ
//! covers every fragment of a challenge. The miner never holds `d`; it
//! only checks the TEE's attestation over each tag with the public key.

pub mod error;
pub mod key;
pub mod proof;
pub mod tag;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use error::{Podr2Error, Result};
pub use key::RsaKey;
pub use proof::{QElement, ServiceProof, challenge_elements, split_by_n, split_file_by_n};
pub use tag::{T, Tag, TagFile};
