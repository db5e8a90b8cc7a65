//! ASCII branch gutter printed left of each listing line.
//!
//! One column per lane with lane 0 rightmost (closest to the code), then a
//! marker column: `>` where a branch lands, `-` where one leaves, `~` where
//! a branch too long to draw leaves.

use arduboy_disasm::{BranchDepth, DisasmFile};

/// Columns needed to draw every lane of `file`, marker excluded.
pub fn width(file: &DisasmFile) -> usize {
    file.max_branch_display_depth() as usize + 1
}

pub fn render(file: &DisasmFile, line: usize, width: usize) -> String {
    let lanes = file.branches();
    let roots = lanes.roots();

    let mut cols = vec![' '; width];
    let mut corner: Option<usize> = None;
    let mut marker = ' ';

    if let Some(run) = lanes.run_at_line(line) {
        for root in run.passing.iter().map(|&i| &roots[i]) {
            let Some(lane) = root.display_depth.lane() else { continue };
            let Some(col) = width.checked_sub(lane as usize + 1) else { continue };

            if line == root.start_line || line == root.dest_line {
                cols[col] = '+';
                corner = Some(corner.map_or(col, |c| c.min(col)));
                if line == root.dest_line {
                    marker = '>';
                }
            } else if cols[col] == ' ' {
                cols[col] = '|';
            }
        }
    }

    // Horizontal toward the code from the outermost corner
    if let Some(from) = corner {
        for c in &mut cols[from + 1..] {
            if *c == ' ' {
                *c = '-';
            }
        }
    }

    if marker == ' ' {
        if let Some(root) = lanes.root_at_line(line) {
            marker = if root.display_depth == BranchDepth::Clipped { '~' } else { '-' };
        }
    }

    cols.push(marker);
    cols.into_iter().collect()
}
