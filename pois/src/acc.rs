//! RSA accumulator over idle-file elements.
//!
//! Elements are accumulated in three levels. A level-0 group holds `E`
//! consecutive elements, a level-1 group holds `E` consecutive level-0
//! accumulators, and the top accumulator covers every level-1 accumulator.
//! A member proves inclusion with a witness chain that climbs the levels:
//!
//! ```text
//! node0 { elem: element,   wit: w0 }  w0^h(element) = acc0
//! node1 { elem: acc0,      wit: w1 }  w1^h(acc0)    = acc1
//! node2 { elem: acc1,      wit: w2 }  w2^h(acc1)    = top
//! ```
//!
//! The accumulator of an empty set is the generator `G`.

use std::collections::BTreeMap;

use common::{ACCUMULATOR_LEN, PoisKey};
use num_bigint::BigUint;
use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};

use crate::hash::{Digest, sha256_concat};
use crate::{PoisError, Result};

/// RSA accumulator public parameters `(N, G)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccKey {
    pub n: BigUint,
    pub g: BigUint,
}

impl AccKey {
    pub fn new(n: BigUint, g: BigUint) -> Result<Self> {
        if n <= BigUint::from(3u32) {
            return Err(PoisError::InvalidParams("modulus too small".to_string()));
        }
        if g <= BigUint::one() || g >= n {
            return Err(PoisError::InvalidParams(
                "generator must lie in (1, N)".to_string(),
            ));
        }
        Ok(Self { n, g })
    }

    pub fn from_bytes(n: &[u8], g: &[u8]) -> Result<Self> {
        Self::new(BigUint::from_bytes_be(n), BigUint::from_bytes_be(g))
    }

    pub fn from_chain(key: &PoisKey) -> Result<Self> {
        Self::from_bytes(&key.n, &key.g)
    }

    pub fn to_chain(&self) -> PoisKey {
        PoisKey {
            g: self.g.to_bytes_be(),
            n: self.n.to_bytes_be(),
        }
    }

    /// Serialized accumulator of the empty set.
    pub fn empty_acc(&self) -> Vec<u8> {
        to_acc_bytes(&self.g)
    }

    /// Small insecure modulus for tests.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn test_key() -> Self {
        let p = BigUint::from(1_000_000_007u64);
        let q = BigUint::from(998_244_353u64);
        Self {
            n: p * q,
            g: BigUint::from(3u32),
        }
    }
}

/// Prime-ish exponent of an accumulated value: SHA-256 with the low bit set.
pub fn exponent(value: &[u8]) -> BigUint {
    BigUint::from_bytes_be(&sha256_concat(&[value])) | BigUint::one()
}

/// Fixed-width big-endian encoding of an accumulator value.
pub fn to_acc_bytes(value: &BigUint) -> Vec<u8> {
    let raw = value.to_bytes_be();
    if raw.len() >= ACCUMULATOR_LEN {
        return raw;
    }
    let mut out = vec![0u8; ACCUMULATOR_LEN - raw.len()];
    out.extend_from_slice(&raw);
    out
}

/// Whether two serialized accumulator values denote the same number.
pub fn same_acc(a: &[u8], b: &[u8]) -> bool {
    BigUint::from_bytes_be(a) == BigUint::from_bytes_be(b)
}

/// `base^(∏ exps) mod N`.
pub fn accumulate(key: &AccKey, base: &BigUint, exps: &[BigUint]) -> BigUint {
    exps.iter()
        .fold(base.clone(), |acc, e| acc.modpow(e, &key.n))
}

/// Witness of every exponent: `out[i] = g^(∏_{j≠i} exps[j])`.
///
/// Splits the set in halves and raises each half's base by the other half,
/// so the whole group costs O(n log n) exponentiations instead of O(n²).
pub fn root_factor(key: &AccKey, g: &BigUint, exps: &[BigUint]) -> Vec<BigUint> {
    match exps.len() {
        0 => Vec::new(),
        1 => vec![g.clone()],
        len => {
            let (left, right) = exps.split_at(len / 2);
            let g_left = accumulate(key, g, right);
            let g_right = accumulate(key, g, left);
            let mut out = root_factor(key, &g_left, left);
            out.extend(root_factor(key, &g_right, right));
            out
        }
    }
}

/// One link of a nested accumulator witness chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccWitnessNode {
    pub elem: Vec<u8>,
    pub wit: Vec<u8>,
    pub acc: Option<Box<AccWitnessNode>>,
}

impl AccWitnessNode {
    pub fn depth(&self) -> usize {
        1 + self.acc.as_ref().map_or(0, |next| next.depth())
    }

    /// Walk the chain and check that its last link lands on `acc`.
    pub fn verify(&self, key: &AccKey, acc: &[u8]) -> bool {
        let mut node = self;
        loop {
            let wit = BigUint::from_bytes_be(&node.wit);
            if wit.is_zero() || wit >= key.n {
                return false;
            }
            let value = wit.modpow(&exponent(&node.elem), &key.n);
            match &node.acc {
                Some(next) => {
                    if value != BigUint::from_bytes_be(&next.elem) {
                        return false;
                    }
                    node = next;
                }
                None => return value == BigUint::from_bytes_be(acc),
            }
        }
    }
}

/// The three accumulator levels over a window of elements.
#[derive(Clone, Debug)]
pub struct AccTree {
    key: AccKey,
    elems_num: i64,
    elements: BTreeMap<i64, Digest>,
    level0: BTreeMap<i64, BigUint>,
    level1: BTreeMap<i64, BigUint>,
    top: BigUint,
}

impl AccTree {
    pub fn new(key: AccKey, elems_num: i64) -> Self {
        let top = key.g.clone();
        Self {
            key,
            elems_num: elems_num.max(1),
            elements: BTreeMap::new(),
            level0: BTreeMap::new(),
            level1: BTreeMap::new(),
            top,
        }
    }

    /// Build a tree over `(index, element)` pairs, indices starting at 1.
    pub fn build(
        key: AccKey,
        elems_num: i64,
        elements: impl IntoIterator<Item = (i64, Digest)>,
    ) -> Self {
        let mut tree = Self::new(key, elems_num);
        tree.elements.extend(elements);
        let groups: Vec<i64> = tree
            .elements
            .keys()
            .map(|index| tree.group_of(*index))
            .collect();
        let mut last = None;
        for g0 in groups {
            if last != Some(g0) {
                tree.recompute_group0(g0);
                last = Some(g0);
            }
        }
        let uppers: Vec<i64> = tree.level0.keys().map(|g0| g0 / tree.elems_num).collect();
        let mut last = None;
        for g1 in uppers {
            if last != Some(g1) {
                tree.recompute_group1(g1);
                last = Some(g1);
            }
        }
        tree.recompute_top();
        tree
    }

    pub fn key(&self) -> &AccKey {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn element(&self, index: i64) -> Option<&Digest> {
        self.elements.get(&index)
    }

    /// Serialized top accumulator.
    pub fn accumulator(&self) -> Vec<u8> {
        to_acc_bytes(&self.top)
    }

    /// Level-0 group holding element `index`.
    pub fn group_of(&self, index: i64) -> i64 {
        (index - 1).max(0) / self.elems_num
    }

    /// Serialized level-0 accumulator of group `g0`.
    pub fn group_acc(&self, g0: i64) -> Option<Vec<u8>> {
        self.level0.get(&g0).map(to_acc_bytes)
    }

    /// Accumulate a batch of new elements, all within one level-0 group.
    pub fn insert_group(&mut self, elements: &[(i64, Digest)]) -> Result<()> {
        let Some((first, _)) = elements.first() else {
            return Ok(());
        };
        let g0 = self.group_of(*first);
        if elements.iter().any(|(index, _)| self.group_of(*index) != g0) {
            return Err(PoisError::InvalidParams(
                "inserted elements span several groups".to_string(),
            ));
        }
        self.elements.extend(elements.iter().copied());
        self.refresh(g0);
        Ok(())
    }

    /// Drop every element with index `<= upto`.
    pub fn remove_through(&mut self, upto: i64) {
        let removed: Vec<i64> = self.elements.range(..=upto).map(|(i, _)| *i).collect();
        let mut touched: Vec<i64> = removed.iter().map(|i| self.group_of(*i)).collect();
        touched.dedup();
        for index in removed {
            self.elements.remove(&index);
        }
        for g0 in touched {
            self.recompute_group0(g0);
            self.recompute_group1(g0 / self.elems_num);
        }
        self.recompute_top();
    }

    /// Witness chain from the level-0 accumulator of `g0` to the top.
    pub fn upper_chain(&self, g0: i64) -> Result<AccWitnessNode> {
        let acc0 = self.level0.get(&g0).ok_or(PoisError::ElementMissing(g0))?;
        let g1 = g0 / self.elems_num;
        let acc1 = self.level1.get(&g1).ok_or(PoisError::ElementMissing(g0))?;

        let (siblings1, pos1) = Self::position(&self.level0, self.level1_range(g1), g0);
        let wit1 = self.single_witness(&siblings1, pos1);
        let (siblings2, pos2) = Self::position(&self.level1, i64::MIN..i64::MAX, g1);
        let wit2 = self.single_witness(&siblings2, pos2);

        Ok(AccWitnessNode {
            elem: to_acc_bytes(acc0),
            wit: to_acc_bytes(&wit1),
            acc: Some(Box::new(AccWitnessNode {
                elem: to_acc_bytes(acc1),
                wit: to_acc_bytes(&wit2),
                acc: None,
            })),
        })
    }

    /// Full witness chains of elements `[left, right)`, all in one level-0 group.
    pub fn group_chains(&self, left: i64, right: i64) -> Result<Vec<AccWitnessNode>> {
        if left >= right {
            return Ok(Vec::new());
        }
        let g0 = self.group_of(left);
        if self.group_of(right - 1) != g0 {
            return Err(PoisError::InvalidChallenge(format!(
                "range [{left}, {right}) crosses a group boundary"
            )));
        }
        let upper = self.upper_chain(g0)?;

        let members: Vec<(i64, Digest)> = self
            .elements
            .range(self.level0_range(g0))
            .map(|(i, e)| (*i, *e))
            .collect();
        let exps: Vec<BigUint> = members.iter().map(|(_, e)| exponent(e)).collect();
        let witnesses = root_factor(&self.key, &self.key.g, &exps);

        (left..right)
            .map(|index| {
                let pos = members
                    .iter()
                    .position(|(i, _)| *i == index)
                    .ok_or(PoisError::ElementMissing(index))?;
                Ok(AccWitnessNode {
                    elem: members[pos].1.to_vec(),
                    wit: to_acc_bytes(&witnesses[pos]),
                    acc: Some(Box::new(upper.clone())),
                })
            })
            .collect()
    }

    fn level0_range(&self, g0: i64) -> std::ops::Range<i64> {
        g0 * self.elems_num + 1..(g0 + 1) * self.elems_num + 1
    }

    fn level1_range(&self, g1: i64) -> std::ops::Range<i64> {
        g1 * self.elems_num..(g1 + 1) * self.elems_num
    }

    fn position(
        level: &BTreeMap<i64, BigUint>,
        range: std::ops::Range<i64>,
        target: i64,
    ) -> (Vec<BigUint>, usize) {
        let mut pos = 0;
        let exps: Vec<BigUint> = level
            .range(range)
            .enumerate()
            .map(|(n, (key, value))| {
                if *key == target {
                    pos = n;
                }
                exponent(&to_acc_bytes(value))
            })
            .collect();
        (exps, pos)
    }

    fn single_witness(&self, exps: &[BigUint], pos: usize) -> BigUint {
        let others: Vec<BigUint> = exps
            .iter()
            .enumerate()
            .filter(|(n, _)| *n != pos)
            .map(|(_, e)| e.clone())
            .collect();
        accumulate(&self.key, &self.key.g, &others)
    }

    fn refresh(&mut self, g0: i64) {
        self.recompute_group0(g0);
        self.recompute_group1(g0 / self.elems_num);
        self.recompute_top();
    }

    fn recompute_group0(&mut self, g0: i64) {
        let exps: Vec<BigUint> = self
            .elements
            .range(self.level0_range(g0))
            .map(|(_, e)| exponent(e))
            .collect();
        if exps.is_empty() {
            self.level0.remove(&g0);
        } else {
            let acc = accumulate(&self.key, &self.key.g, &exps);
            self.level0.insert(g0, acc);
        }
    }

    fn recompute_group1(&mut self, g1: i64) {
        let exps: Vec<BigUint> = self
            .level0
            .range(self.level1_range(g1))
            .map(|(_, acc)| exponent(&to_acc_bytes(acc)))
            .collect();
        if exps.is_empty() {
            self.level1.remove(&g1);
        } else {
            let acc = accumulate(&self.key, &self.key.g, &exps);
            self.level1.insert(g1, acc);
        }
    }

    fn recompute_top(&mut self) {
        let exps: Vec<BigUint> = self
            .level1
            .values()
            .map(|acc| exponent(&to_acc_bytes(acc)))
            .collect();
        self.top = accumulate(&self.key, &self.key.g, &exps);
    }
}
