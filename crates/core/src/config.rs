//! Tunables for the branch lane allocator.
//!
//! Passed explicitly to [`DisasmFile::load_src`](crate::DisasmFile::load_src);
//! there is no process-wide settings table.

use serde::{Deserialize, Serialize};

/// Default line span above which a branch is clipped.
pub const DEFAULT_MAX_BRANCH_SHOW_DIST: usize = 1000;

/// Branch lane allocation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchConfig {
    /// Branches spanning more lines than this are clipped: drawn by the
    /// viewer but never given a lane.
    pub max_branch_show_dist: usize,
}

impl BranchConfig {
    pub fn with_max_branch_show_dist(max_branch_show_dist: usize) -> Self {
        BranchConfig { max_branch_show_dist }
    }
}

impl Default for BranchConfig {
    fn default() -> Self {
        BranchConfig { max_branch_show_dist: DEFAULT_MAX_BRANCH_SHOW_DIST }
    }
}
