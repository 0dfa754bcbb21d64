//! CESS storage miner node.
//!
//! The miner proves two kinds of storage to the chain:
//! - **Idle space**: files generated locally and folded into an RSA
//!   accumulator through TEE-verified commitments, later replaced by user data
//! - **Service space**: user file fragments proven with homomorphic tags
//!
//! Each protocol is a long-lived worker restarted by the [`supervisor`].
//! Workers share a [`context::MinerContext`] holding the chain and TEE
//! clients, the accumulator prover and the on-disk proof records.

pub mod chain;
pub mod config;
pub mod constants;
pub mod context;
pub mod error;
pub mod helpers;
pub mod protocols;
pub mod registry;
pub mod retry;
pub mod state;
pub mod supervisor;
pub mod tee;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;
