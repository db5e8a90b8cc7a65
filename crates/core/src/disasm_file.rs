//! A loaded disassembly listing together with its branch lanes.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span};

use crate::branches::{BranchLanes, BranchRoot, PassingBranches};
use crate::config::BranchConfig;
use crate::console::Console;
use crate::line_index::{LineAddr, LineIndex};

/// Disassembly listing state owned by a disassembly view.
///
/// Built in one pass by [`load_src`](Self::load_src) and immutable until the
/// next full reload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisasmFile {
    index: LineIndex,
    branches: BranchLanes,
    /// Settings the lanes were allocated with
    config: BranchConfig,
}

impl DisasmFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_src(text: impl Into<String>, console: &dyn Console, config: &BranchConfig) -> Self {
        let mut file = Self::new();
        file.load_src(text, console, config);
        file
    }

    /// Replace the listing and rebuild the line index and branch lanes.
    pub fn load_src(&mut self, text: impl Into<String>, console: &dyn Console, config: &BranchConfig) {
        let _span = debug_span!("load_src").entered();
        let total = Instant::now();

        let t = Instant::now();
        self.index = LineIndex::new(text);
        debug!(
            lines = self.index.len(),
            labels = self.index.labels().len(),
            us = t.elapsed().as_micros() as u64,
            "line index built"
        );

        self.branches = BranchLanes::build(&self.index, console, config);
        self.config = *config;

        debug!(us = total.elapsed().as_micros() as u64, "disassembly loaded");
    }

    pub fn index(&self) -> &LineIndex {
        &self.index
    }

    pub fn branches(&self) -> &BranchLanes {
        &self.branches
    }

    pub fn config(&self) -> &BranchConfig {
        &self.config
    }

    pub fn content(&self) -> &str {
        self.index.content()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn line(&self, ind: usize) -> &str {
        self.index.line(ind)
    }

    pub fn addr(&self, ind: usize) -> LineAddr {
        self.index.addr(ind)
    }

    pub fn line_ind_from_addr(&self, addr: u16) -> Option<usize> {
        self.index.line_ind_from_addr(addr)
    }

    pub fn prev_actual_addr(&self, line: usize) -> Option<u16> {
        self.index.prev_actual_addr(line)
    }

    pub fn next_actual_addr(&self, line: usize) -> Option<u16> {
        self.index.next_actual_addr(line)
    }

    pub fn branch_roots(&self) -> &[BranchRoot] {
        self.branches.roots()
    }

    pub fn passing_branches(&self) -> &[PassingBranches] {
        self.branches.runs()
    }

    pub fn max_branch_display_depth(&self) -> u32 {
        self.branches.max_branch_display_depth()
    }

    /// Roots to draw for the visible lines `[line_start, line_end]`.
    pub fn visible_roots(&self, line_start: usize, line_end: usize) -> impl Iterator<Item = &BranchRoot> {
        self.branches
            .roots_in_range(line_start, line_end)
            .into_iter()
            .map(move |i| &self.branches.roots()[i])
    }

    /// Verify the invariants of a file that was deserialized rather than built.
    pub(crate) fn check_consistency(&self) -> Result<(), String> {
        let index = &self.index;
        if *index != LineIndex::new(index.content()) {
            return Err("line index does not match the content".into());
        }
        self.branches.check_consistency(index.len(), self.config.max_branch_show_dist)
    }
}
