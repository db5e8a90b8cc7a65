//! # arduboy-disasm
//!
//! Disassembly listing model behind the Arduboy emulator's disassembly view.
//!
//! A listing (`avr-objdump -d` output for an ATmega32u4 / ATmega328P image)
//! is indexed line by line so the view can jump from a PC to its line in
//! O(log n), and every jump, branch and call whose target is in the listing
//! gets a gutter lane so arrows that overlap never share a column.
//!
//! ## Architecture
//!
//! - [`line_index`]: line splitting, address classification, address → line search
//! - [`branches`]: branch roots, run-length compressed passing sets, lane allocation
//! - [`DisasmFile`]: owns both and rebuilds them on every load
//! - [`console`]: the [`Console`] capability (jump-target decoding) and its AVR implementation
//! - [`config`]: [`BranchConfig`] tunables
//! - [`cache`]: compressed on-disk snapshot of an analyzed listing
//!
//! ## Example
//!
//! ```
//! use arduboy_disasm::{AvrCore, BranchConfig, DisasmFile};
//!
//! let listing = "00000000 <main>:\n       0:\tff cf       \trjmp\t.-2\n";
//! let file = DisasmFile::from_src(listing, &AvrCore::default(), &BranchConfig::default());
//! assert_eq!(file.line_ind_from_addr(0), Some(1));
//! assert_eq!(file.branch_roots().len(), 1);
//! ```

pub mod branches;
pub mod cache;
pub mod config;
pub mod console;
pub mod disasm_file;
pub mod error;
pub mod line_index;

pub use branches::{BranchDepth, BranchLanes, BranchRoot, LaneSet, PassingBranches};
pub use config::{BranchConfig, DEFAULT_MAX_BRANCH_SHOW_DIST};
pub use console::{AvrCore, Console, CpuType};
pub use disasm_file::DisasmFile;
pub use error::{Error, Result};
pub use line_index::{LineAddr, LineIndex};
