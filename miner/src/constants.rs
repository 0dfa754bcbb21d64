//! Constants for the miner's proof protocols.

/// Fragments verified by a TEE in one batch request
pub const MAX_SINGLE_VERIFICATION: usize = 5000;

/// Log files per status line while tagging a large file
pub const TAG_PROGRESS_EVERY: usize = 64;
