//! Branch lane allocation for the disassembly view.
//!
//! Every instruction line whose jump target resolves to another line of the
//! same listing gets a [`BranchRoot`]. The viewer draws each root as an arrow
//! in a gutter left of the text, and two arrows whose line ranges overlap must
//! not share a gutter column (lane).
//!
//! The build runs in three phases:
//!
//! 1. **Root discovery**: decode each program line through [`Console`].
//! 2. **Interval compression**: the set of roots spanning each line is
//!    run-length encoded into [`PassingBranches`] runs, so "all roots crossing
//!    lines a..b" costs one step per distinct run instead of one per line.
//! 3. **Lane assignment**: greedy depth-first coloring. A root takes the
//!    smallest lane not used by any overlapping root; overlapping roots that
//!    are still unresolved are resolved first, and roots already on the
//!    current path ([`BranchDepth::InProgress`]) are ignored, which breaks
//!    cycles. Roots sharing a destination line never conflict.
//!
//! Roots spanning more than [`BranchConfig::max_branch_show_dist`] lines are
//! [`BranchDepth::Clipped`] and take no part in lane accounting.

use std::collections::BTreeSet;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::BranchConfig;
use crate::console::Console;
use crate::line_index::LineIndex;

/// Lane state of a branch root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchDepth {
    Unvisited,
    /// On the current assignment path
    InProgress,
    /// Longer than the configured maximum, has no lane
    Clipped,
    Lane(u32),
}

impl BranchDepth {
    pub fn lane(self) -> Option<u32> {
        match self {
            BranchDepth::Lane(d) => Some(d),
            _ => None,
        }
    }

    /// True once allocation has settled this root.
    pub fn is_terminal(self) -> bool {
        matches!(self, BranchDepth::Lane(_) | BranchDepth::Clipped)
    }
}

/// One jump/branch/call from a line to another line of the listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRoot {
    /// Address of the jumping instruction
    pub start: u16,
    /// Target address
    pub dest: u16,
    pub start_line: usize,
    pub dest_line: usize,
    pub display_depth: BranchDepth,
}

impl BranchRoot {
    pub fn first_line(&self) -> usize {
        self.start_line.min(self.dest_line)
    }

    pub fn last_line(&self) -> usize {
        self.start_line.max(self.dest_line)
    }

    /// Number of lines between origin and target.
    pub fn span(&self) -> usize {
        self.start_line.abs_diff(self.dest_line)
    }

    pub fn is_backward(&self) -> bool {
        self.dest_line < self.start_line
    }

    pub fn covers(&self, line: usize) -> bool {
        (self.first_line()..=self.last_line()).contains(&line)
    }

    pub fn overlaps(&self, other: &BranchRoot) -> bool {
        self.first_line() <= other.last_line() && other.first_line() <= self.last_line()
    }
}

/// Growable bit set of lane indices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneSet {
    words: Vec<u64>,
}

impl LaneSet {
    pub fn insert(&mut self, lane: u32) {
        let (w, b) = (lane as usize / 64, lane % 64);
        if w >= self.words.len() {
            self.words.resize(w + 1, 0);
        }
        self.words[w] |= 1 << b;
    }

    pub fn contains(&self, lane: u32) -> bool {
        let (w, b) = (lane as usize / 64, lane % 64);
        self.words.get(w).map_or(false, |word| word & (1 << b) != 0)
    }

    /// Smallest lane not in the set.
    pub fn first_free(&self) -> u32 {
        for (w, word) in self.words.iter().enumerate() {
            if *word != u64::MAX {
                return w as u32 * 64 + word.trailing_ones();
            }
        }
        self.words.len() as u32 * 64
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(w, word)| {
            (0..64u32).filter(move |b| word & (1 << b) != 0).map(move |b| w as u32 * 64 + b)
        })
    }
}

/// Run of consecutive lines crossed by exactly the same roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassingBranches {
    /// Root indices, ascending
    pub passing: Vec<usize>,
    pub start_line: usize,
    /// Lanes held by the non-clipped roots of this run
    pub occupied: LaneSet,
}

/// Branch roots of a listing plus their lane assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchLanes {
    roots: Vec<BranchRoot>,
    /// line → root originating on it
    branch_root_inds: Vec<Option<usize>>,
    runs: Vec<PassingBranches>,
    /// line → run containing it
    passing_branches_inds: Vec<usize>,
    max_branch_display_depth: u32,
}

/// Suspended assignment of one root: where its scan over the overlapping
/// runs stopped and which lanes it has seen so far.
struct Frame {
    root: usize,
    run: usize,
    member: usize,
    used: LaneSet,
}

impl BranchLanes {
    /// Discover, compress and allocate the branches of `index`.
    pub fn build(index: &LineIndex, console: &dyn Console, config: &BranchConfig) -> Self {
        let t = Instant::now();
        let roots = discover_roots(index, console);
        debug!(roots = roots.len(), us = t.elapsed().as_micros() as u64, "branch roots discovered");

        Self::from_roots(index.len(), roots, config)
    }

    /// Compress and allocate an already discovered root set.
    ///
    /// Panics if a root references a line outside `line_count` or two roots
    /// start on the same line.
    pub fn from_roots(line_count: usize, mut roots: Vec<BranchRoot>, config: &BranchConfig) -> Self {
        let mut branch_root_inds = vec![None; line_count];
        for (i, root) in roots.iter_mut().enumerate() {
            assert!(root.last_line() < line_count, "branch root outside the listing");
            let slot = &mut branch_root_inds[root.start_line];
            assert!(slot.is_none(), "two branch roots start on line {}", root.start_line);
            *slot = Some(i);
            root.display_depth = BranchDepth::Unvisited;
        }

        let t = Instant::now();
        let (runs, passing_branches_inds) = compress(line_count, &roots);
        debug!(runs = runs.len(), us = t.elapsed().as_micros() as u64, "passing branches compressed");

        let mut lanes = BranchLanes {
            roots,
            branch_root_inds,
            runs,
            passing_branches_inds,
            max_branch_display_depth: 0,
        };

        let t = Instant::now();
        lanes.allocate(config.max_branch_show_dist);
        debug!(
            max_depth = lanes.max_branch_display_depth,
            us = t.elapsed().as_micros() as u64,
            "branch lanes allocated"
        );
        lanes
    }

    fn allocate(&mut self, max_dist: usize) {
        for root in 0..self.roots.len() {
            self.assign(root, max_dist);
        }

        for root in &self.roots {
            assert!(
                root.display_depth.is_terminal(),
                "branch root on line {} left unresolved: {:?}",
                root.start_line,
                root.display_depth
            );
        }

        self.max_branch_display_depth =
            self.roots.iter().filter_map(|r| r.display_depth.lane()).max().unwrap_or(0);

        for run in &mut self.runs {
            for &i in &run.passing {
                if let Some(lane) = self.roots[i].display_depth.lane() {
                    run.occupied.insert(lane);
                }
            }
        }
    }

    /// Start assigning `root`: clip it or mark it in progress.
    fn enter(&mut self, root: usize, max_dist: usize) -> Option<Frame> {
        let r = &mut self.roots[root];
        if r.span() > max_dist {
            r.display_depth = BranchDepth::Clipped;
            return None;
        }
        r.display_depth = BranchDepth::InProgress;
        Some(Frame {
            root,
            run: self.passing_branches_inds[r.first_line()],
            member: 0,
            used: LaneSet::default(),
        })
    }

    /// Depth-first lane assignment starting at `root`, driven by an explicit
    /// stack so long overlap chains cannot exhaust the thread stack.
    fn assign(&mut self, root: usize, max_dist: usize) {
        if self.roots[root].display_depth != BranchDepth::Unvisited {
            return;
        }
        let mut stack: Vec<Frame> = self.enter(root, max_dist).into_iter().collect();

        while let Some(frame) = stack.last_mut() {
            let this = &self.roots[frame.root];
            let last_run = self.passing_branches_inds[this.last_line()];

            let mut descend = None;
            while frame.run <= last_run {
                let passing = &self.runs[frame.run].passing;
                let Some(&other) = passing.get(frame.member) else {
                    frame.run += 1;
                    frame.member = 0;
                    continue;
                };
                if other != frame.root && self.roots[other].dest_line != this.dest_line {
                    match self.roots[other].display_depth {
                        BranchDepth::Unvisited => {
                            descend = Some(other);
                            break;
                        }
                        BranchDepth::Lane(d) => frame.used.insert(d),
                        BranchDepth::InProgress | BranchDepth::Clipped => {}
                    }
                }
                frame.member += 1;
            }

            match descend {
                Some(other) => {
                    // A clipped child returns no frame; the scan resumes on it
                    // and skips it.
                    if let Some(child) = self.enter(other, max_dist) {
                        stack.push(child);
                    }
                }
                None => {
                    let lane = frame.used.first_free();
                    let done = frame.root;
                    stack.pop();
                    self.roots[done].display_depth = BranchDepth::Lane(lane);
                }
            }
        }
    }

    pub fn roots(&self) -> &[BranchRoot] {
        &self.roots
    }

    /// Root originating on `line`.
    pub fn root_at_line(&self, line: usize) -> Option<&BranchRoot> {
        self.branch_root_inds.get(line).copied().flatten().map(|i| &self.roots[i])
    }

    pub fn branch_root_inds(&self) -> &[Option<usize>] {
        &self.branch_root_inds
    }

    pub fn runs(&self) -> &[PassingBranches] {
        &self.runs
    }

    pub fn passing_branches_inds(&self) -> &[usize] {
        &self.passing_branches_inds
    }

    /// Run containing `line`.
    pub fn run_at_line(&self, line: usize) -> Option<&PassingBranches> {
        self.passing_branches_inds.get(line).map(|&r| &self.runs[r])
    }

    /// Largest lane in use (0 if there are none).
    pub fn max_branch_display_depth(&self) -> u32 {
        self.max_branch_display_depth
    }

    /// Indices of the roots crossing any line of `[line_start, line_end]`,
    /// ascending, each once.
    pub fn roots_in_range(&self, line_start: usize, line_end: usize) -> Vec<usize> {
        let Some(last) = self.passing_branches_inds.len().checked_sub(1) else {
            return Vec::new();
        };
        if line_start > line_end || line_start > last {
            return Vec::new();
        }
        let first_run = self.passing_branches_inds[line_start];
        let last_run = self.passing_branches_inds[line_end.min(last)];
        let found: BTreeSet<usize> = self.runs[first_run..=last_run]
            .iter()
            .flat_map(|run| run.passing.iter().copied())
            .collect();
        found.into_iter().collect()
    }

    /// Consistency check for data that did not come out of [`build`](Self::build).
    ///
    /// Recomputes the runs from the roots and re-verifies every lane, so a
    /// table that passes cannot make a query index out of bounds or draw two
    /// overlapping arrows in one column.
    pub(crate) fn check_consistency(&self, line_count: usize, max_dist: usize) -> Result<(), String> {
        if self.branch_root_inds.len() != line_count || self.passing_branches_inds.len() != line_count {
            return Err("branch tables do not match the line count".into());
        }
        for (i, root) in self.roots.iter().enumerate() {
            if root.last_line() >= line_count {
                return Err(format!("branch root {} outside the listing", i));
            }
            if !root.display_depth.is_terminal() {
                return Err(format!("branch root {} has no lane", i));
            }
            if (root.span() > max_dist) != (root.display_depth == BranchDepth::Clipped) {
                return Err(format!("branch root {} clipped against the wrong limit", i));
            }
            if self.branch_root_inds[root.start_line] != Some(i) {
                return Err(format!("branch root {} missing from the line table", i));
            }
        }
        for (line, slot) in self.branch_root_inds.iter().enumerate() {
            if let Some(i) = *slot {
                if self.roots.get(i).map(|r| r.start_line) != Some(line) {
                    return Err(format!("line {} names the wrong branch root", line));
                }
            }
        }

        let (runs, inds) = compress(line_count, &self.roots);
        let same_runs = runs.len() == self.runs.len()
            && runs
                .iter()
                .zip(&self.runs)
                .all(|(a, b)| a.passing == b.passing && a.start_line == b.start_line);
        if !same_runs || inds != self.passing_branches_inds {
            return Err("passing branch runs do not match the roots".into());
        }

        let mut max_depth = 0;
        for (n, run) in self.runs.iter().enumerate() {
            let mut occupied = LaneSet::default();
            let mut seen: Vec<(u32, usize)> = Vec::new();
            for root in run.passing.iter().map(|&i| &self.roots[i]) {
                let Some(lane) = root.display_depth.lane() else { continue };
                if seen.iter().any(|&(l, dest)| l == lane && dest != root.dest_line) {
                    return Err(format!("overlapping branch roots share lane {} in run {}", lane, n));
                }
                seen.push((lane, root.dest_line));
                occupied.insert(lane);
                max_depth = max_depth.max(lane);
            }
            if occupied != run.occupied {
                return Err(format!("lane set of run {} does not match its roots", n));
            }
        }
        if max_depth != self.max_branch_display_depth {
            return Err("maximum display depth does not match the lanes".into());
        }
        Ok(())
    }
}

/// Step 1: one root per program line whose target is a line of this listing.
fn discover_roots(index: &LineIndex, console: &dyn Console) -> Vec<BranchRoot> {
    let mut roots = Vec::new();
    for line in 0..index.len() {
        let Some(start) = index.addr(line).actual() else { continue };
        if start % 2 != 0 {
            trace!(line, start, "misaligned instruction line");
            continue;
        }
        let Some((word, word2)) = index.instruction_words(line) else { continue };
        let Some(target) = console.decode_jump_target(word, word2, start / 2) else { continue };

        let Some(dest) = target.checked_mul(2).and_then(|d| u16::try_from(d).ok()) else {
            trace!(line, target, "jump target outside the 16-bit address space");
            continue;
        };
        let Some(dest_line) = index.line_ind_from_addr_exact(dest) else {
            trace!(line, dest, "jump target not in listing");
            continue;
        };

        roots.push(BranchRoot {
            start,
            dest,
            start_line: line,
            dest_line,
            display_depth: BranchDepth::Unvisited,
        });
    }
    roots
}

/// Step 2: run-length encode "roots covering line" over all lines.
fn compress(line_count: usize, roots: &[BranchRoot]) -> (Vec<PassingBranches>, Vec<usize>) {
    // (line, enters, root); exits sort before entries on the same line
    let mut events: Vec<(usize, bool, usize)> = Vec::with_capacity(roots.len() * 2);
    for (i, root) in roots.iter().enumerate() {
        events.push((root.first_line(), true, i));
        events.push((root.last_line() + 1, false, i));
    }
    events.sort_unstable();

    let mut active = BTreeSet::new();
    let mut runs: Vec<PassingBranches> = Vec::new();
    let mut inds = Vec::with_capacity(line_count);
    let mut events = events.into_iter().peekable();

    for line in 0..line_count {
        let mut changed = false;
        while let Some((_, enters, root)) = events.next_if(|&(at, _, _)| at == line) {
            if enters {
                active.insert(root);
            } else {
                active.remove(&root);
            }
            changed = true;
        }

        let same = match runs.last() {
            Some(run) => !changed || run.passing.iter().eq(active.iter()),
            None => false,
        };
        if !same {
            runs.push(PassingBranches {
                passing: active.iter().copied().collect(),
                start_line: line,
                occupied: LaneSet::default(),
            });
        }
        inds.push(runs.len() - 1);
    }

    (runs, inds)
}
