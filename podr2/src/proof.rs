//! Challenge responses and sigma aggregation.

use std::path::Path;

use num_bigint::BigUint;
use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};

use crate::{Podr2Error, Result, RsaKey};

/// One challenged block: index `i` and decimal coefficient `v`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QElement {
    pub i: i64,
    pub v: String,
}

/// Response of one fragment to a challenge, as decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceProof {
    pub mu: String,
    pub sigma: String,
}

fn parse_decimal(field: &'static str, value: &str) -> Result<BigUint> {
    BigUint::parse_bytes(value.as_bytes(), 10).ok_or_else(|| Podr2Error::MalformedNumber {
        field,
        value: value.to_string(),
    })
}

/// Build the challenge elements from the chain's index and random lists.
pub fn challenge_elements(indices: &[u32], randoms: &[Vec<u8>]) -> Result<Vec<QElement>> {
    if indices.len() != randoms.len() {
        return Err(Podr2Error::LengthMismatch(format!(
            "{} indices, {} randoms",
            indices.len(),
            randoms.len()
        )));
    }
    Ok(indices
        .iter()
        .zip(randoms)
        .map(|(i, random)| QElement {
            i: i64::from(*i),
            v: BigUint::from_bytes_be(random).to_str_radix(10),
        })
        .collect())
}

impl RsaKey {
    /// Compute `μ = Σ v_i·m_i` and `σ = ∏ φ_i^v_i mod N` for one fragment.
    ///
    /// Fails closed on any malformed coefficient or tag value, and on a
    /// challenge index outside the fragment.
    pub fn gen_proof(
        &self,
        challenge: &[QElement],
        phi: &[String],
        matrix: &[Vec<u8>],
    ) -> Result<ServiceProof> {
        let n = self.modulus();
        let mut mu = BigUint::zero();
        let mut sigma = BigUint::one();

        for q in challenge {
            let blocks = phi.len().min(matrix.len());
            if q.i < 0 || q.i as usize >= blocks {
                return Err(Podr2Error::BlockOutOfRange { index: q.i, blocks });
            }
            let index = q.i as usize;
            let v = parse_decimal("v", &q.v)?;
            let m = BigUint::from_bytes_be(&matrix[index]);
            let phi_i = parse_decimal("phi", &phi[index])?;

            mu += &m * &v;
            sigma = (sigma * phi_i.modpow(&v, n)) % n;
        }

        Ok(ServiceProof {
            mu: mu.to_str_radix(10),
            sigma: sigma.to_str_radix(10),
        })
    }

    /// Aggregate `σ` of several fragments answering the same challenge,
    /// from their tags alone.
    ///
    /// Equal to folding each fragment's [`gen_proof`](Self::gen_proof) sigma
    /// through [`aggr_append_proof`](Self::aggr_append_proof).
    pub fn aggr_gen_proof<P: AsRef<[String]>>(&self, challenge: &[QElement], phis: &[P]) -> Result<String> {
        let n = self.modulus();
        let coefficients = challenge
            .iter()
            .map(|q| parse_decimal("v", &q.v))
            .collect::<Result<Vec<_>>>()?;

        let mut sigma = BigUint::one();
        for phi in phis {
            let phi = phi.as_ref();
            for (q, v) in challenge.iter().zip(&coefficients) {
                if q.i < 0 || q.i as usize >= phi.len() {
                    return Err(Podr2Error::BlockOutOfRange {
                        index: q.i,
                        blocks: phi.len(),
                    });
                }
                let phi_i = parse_decimal("phi", &phi[q.i as usize])?;
                sigma = (sigma * phi_i.modpow(v, n)) % n;
            }
        }
        Ok(sigma.to_str_radix(10))
    }

    /// Fold `sigma` into the running aggregate; an empty aggregate counts as 1.
    pub fn aggr_append_proof(&self, aggregate: &str, sigma: &str) -> Result<String> {
        let current = if aggregate.is_empty() {
            BigUint::one()
        } else {
            parse_decimal("aggregate sigma", aggregate)?
        };
        let sigma = parse_decimal("sigma", sigma)?;
        Ok(((current * sigma) % self.modulus()).to_str_radix(10))
    }
}

/// Split data into `n` equal blocks.
pub fn split_by_n(data: &[u8], n: usize) -> Result<Vec<Vec<u8>>> {
    if n == 0 || data.len() % n != 0 {
        return Err(Podr2Error::Indivisible { len: data.len(), n });
    }
    let size = data.len() / n;
    if size == 0 {
        return Ok(vec![Vec::new(); n]);
    }
    Ok(data.chunks(size).map(<[u8]>::to_vec).collect())
}

/// Read a fragment and split it into `n` equal blocks.
pub fn split_file_by_n(path: &Path, n: usize) -> Result<Vec<Vec<u8>>> {
    let data = std::fs::read(path)?;
    split_by_n(&data, n)
}
