//! Line-addressed view of a textual disassembly listing.
//!
//! Listings follow the `avr-objdump -d` layout:
//!
//! ```text
//! 00000068 <__ctors_end>:
//!       68:	11 24       	eor	r1, r1
//!       6a:	1f be       	out	0x3f, r1	; 63
//!       6c:	0c 94 50 00 	jmp	0xa0	; 0xa0 <main>
//! ```
//!
//! Every line is tagged with its program address, or with one of two
//! sentinels: [`LineAddr::SymbolLabel`] for label-only lines (their address
//! goes into the label map) and [`LineAddr::NotAnAddr`] for everything else.
//! Real addresses are expected to be non-decreasing down the file, which is
//! what makes [`LineIndex::line_ind_from_addr`] a binary search.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Width of the address column.
const ADDR_FIELD_LEN: usize = 8;
/// Offset of the tab that opens the instruction bytes field.
const BYTES_FIELD_OFFSET: usize = ADDR_FIELD_LEN + 1;

/// Address tag of one listing line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineAddr {
    /// Line mapped to a program address (byte address).
    Addr(u16),
    /// Pure text or malformed line.
    NotAnAddr,
    /// Label-only line such as `00000068 <__ctors_end>:`.
    SymbolLabel,
}

impl LineAddr {
    /// The real address, if this is not a sentinel.
    pub fn actual(self) -> Option<u16> {
        match self {
            LineAddr::Addr(a) => Some(a),
            _ => None,
        }
    }

    pub fn is_actual(self) -> bool {
        matches!(self, LineAddr::Addr(_))
    }
}

/// Result of classifying a single line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    Addr(u16),
    NotAnAddr,
    /// Label line and the address it names.
    SymbolLabel(u16),
}

impl LineClass {
    fn line_addr(self) -> LineAddr {
        match self {
            LineClass::Addr(a) => LineAddr::Addr(a),
            LineClass::NotAnAddr => LineAddr::NotAnAddr,
            LineClass::SymbolLabel(_) => LineAddr::SymbolLabel,
        }
    }
}

/// Every char is a hex digit or a space, and the last one is not a space.
fn is_hex_space_str(s: &[u8]) -> bool {
    s.last().map_or(false, |&c| c != b' ')
        && s.iter().all(|c| c.is_ascii_hexdigit() || *c == b' ')
}

fn parse_addr_field(field: &[u8]) -> Option<u16> {
    let s = std::str::from_utf8(field).ok()?.trim_start();
    let v = u32::from_str_radix(s, 16).ok()?;
    u16::try_from(v).ok()
}

/// Classify one listing line (without its line terminator).
///
/// Malformed lines are never an error, they are simply `NotAnAddr`.
pub fn classify_line(line: &str) -> LineClass {
    let b = line.as_bytes();
    if b.len() <= ADDR_FIELD_LEN || !is_hex_space_str(&b[..ADDR_FIELD_LEN]) {
        return LineClass::NotAnAddr;
    }
    let field = &b[..ADDR_FIELD_LEN];
    match b[ADDR_FIELD_LEN] {
        b':' => parse_addr_field(field).map_or(LineClass::NotAnAddr, LineClass::Addr),
        b' ' if b.get(BYTES_FIELD_OFFSET) != Some(&b'\t') => {
            parse_addr_field(field).map_or(LineClass::NotAnAddr, LineClass::SymbolLabel)
        }
        _ => LineClass::NotAnAddr,
    }
}

/// Parse the bytes field of an instruction line into one or two
/// little-endian words. Word 2 is 0 for 16-bit instructions.
fn parse_instruction_bytes(field: &str) -> Option<(u16, u16)> {
    let mut bytes = [0u8; 4];
    let mut n = 0;
    for tok in field.split_ascii_whitespace() {
        if n == bytes.len() || tok.len() != 2 {
            return None;
        }
        bytes[n] = u8::from_str_radix(tok, 16).ok()?;
        n += 1;
    }
    let w0 = u16::from_le_bytes([bytes[0], bytes[1]]);
    match n {
        2 => Some((w0, 0)),
        4 => Some((w0, u16::from_le_bytes([bytes[2], bytes[3]]))),
        _ => None,
    }
}

/// Instruction words of a line that encodes machine code.
///
/// Data lines (`.word`, `.byte`, ...) and lines without a mnemonic are not
/// program lines.
fn program_words(line: &str) -> Option<(u16, u16)> {
    let mut fields = line.get(BYTES_FIELD_OFFSET..)?.strip_prefix('\t')?.split('\t');
    let words = parse_instruction_bytes(fields.next()?)?;
    let mnemonic = fields.next()?.trim();
    if mnemonic.is_empty() || mnemonic.starts_with('.') {
        return None;
    }
    Some(words)
}

fn trim_line_end(raw: &str) -> &str {
    let line = raw.strip_suffix('\n').unwrap_or(raw);
    line.strip_suffix('\r').unwrap_or(line)
}

/// Parsed, per-line addressable disassembly text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineIndex {
    content: String,
    /// Byte offset of each line start
    lines: Vec<usize>,
    addrs: Vec<LineAddr>,
    is_line_program: Vec<bool>,
    /// Label address → first line naming it
    labels: BTreeMap<u16, usize>,
    /// Real addresses are non-decreasing
    addrs_ordered: bool,
}

impl LineIndex {
    /// Split `text` on line feeds and classify every line.
    pub fn new(text: impl Into<String>) -> Self {
        let content = text.into();
        let mut lines = Vec::new();
        let mut addrs = Vec::new();
        let mut is_line_program = Vec::new();
        let mut labels = BTreeMap::new();

        let mut offset = 0;
        for raw in content.split_inclusive('\n') {
            let line = trim_line_end(raw);
            let class = classify_line(line);
            if let LineClass::SymbolLabel(addr) = class {
                labels.entry(addr).or_insert(lines.len());
            }
            lines.push(offset);
            addrs.push(class.line_addr());
            is_line_program.push(class.line_addr().is_actual() && program_words(line).is_some());
            offset += raw.len();
        }

        assert!(
            lines.len() == addrs.len() && addrs.len() == is_line_program.len(),
            "line index arrays out of step"
        );

        let out_of_order = first_out_of_order(&addrs);
        if let Some(line) = out_of_order {
            tracing::warn!(
                line,
                "listing addresses are not monotonic; address lookups fall back to linear scans"
            );
        }

        LineIndex {
            content,
            lines,
            addrs,
            is_line_program,
            labels,
            addrs_ordered: out_of_order.is_none(),
        }
    }

    /// Replace the content and rebuild the index.
    pub fn load(&mut self, text: impl Into<String>) {
        *self = LineIndex::new(text);
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Byte offset of each line start within [`content`](Self::content).
    pub fn line_offsets(&self) -> &[usize] {
        &self.lines
    }

    /// Text of line `ind` without its terminator.
    pub fn line(&self, ind: usize) -> &str {
        let start = self.lines[ind];
        let end = self.lines.get(ind + 1).copied().unwrap_or(self.content.len());
        trim_line_end(&self.content[start..end])
    }

    pub fn addr(&self, ind: usize) -> LineAddr {
        self.addrs[ind]
    }

    pub fn addrs(&self) -> &[LineAddr] {
        &self.addrs
    }

    pub fn is_program(&self, ind: usize) -> bool {
        self.is_line_program[ind]
    }

    /// Instruction word(s) encoded on a program line.
    pub fn instruction_words(&self, ind: usize) -> Option<(u16, u16)> {
        if !self.is_line_program[ind] {
            return None;
        }
        program_words(self.line(ind))
    }

    pub fn labels(&self) -> &BTreeMap<u16, usize> {
        &self.labels
    }

    /// Line of the label naming `addr`.
    pub fn label_line(&self, addr: u16) -> Option<usize> {
        self.labels.get(&addr).copied()
    }

    /// Symbol name of a label line (`00000068 <__ctors_end>:` → `__ctors_end`).
    pub fn label_name(&self, ind: usize) -> Option<&str> {
        if self.addrs[ind] != LineAddr::SymbolLabel {
            return None;
        }
        let line = self.line(ind);
        let open = line.find('<')?;
        let close = line.rfind('>')?;
        line.get(open + 1..close)
    }

    /// False when the listing's real addresses go backwards somewhere.
    pub fn is_address_order_valid(&self) -> bool {
        self.addrs_ordered
    }

    /// First real-address line whose address is `>= addr`.
    ///
    /// Returns `None` if `addr` is past the last real address or the file has
    /// no real addresses.
    pub fn line_ind_from_addr(&self, addr: u16) -> Option<usize> {
        if !self.addrs_ordered {
            return self.addrs.iter().position(|a| a.actual().map_or(false, |a| a >= addr));
        }

        let mut lo = 0;
        let mut hi = self.addrs.len();
        let mut found = None;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let Some((probe, probe_addr)) = self.nearest_actual_within(mid, lo, hi) else {
                break;
            };
            if probe_addr < addr {
                lo = probe + 1;
            } else {
                found = Some(probe);
                hi = probe;
            }
        }
        found
    }

    /// Line holding exactly `addr`.
    pub fn line_ind_from_addr_exact(&self, addr: u16) -> Option<usize> {
        let target = LineAddr::Addr(addr);
        if !self.addrs_ordered {
            return self.addrs.iter().position(|&a| a == target);
        }
        self.line_ind_from_addr(addr).filter(|&ind| self.addrs[ind] == target)
    }

    /// Probe `mid`, `mid+1`, `mid-1`, `mid+2`, ... for a real-address line
    /// inside `[lo, hi)`.
    fn nearest_actual_within(&self, mid: usize, lo: usize, hi: usize) -> Option<(usize, u16)> {
        let mut dist = 0;
        loop {
            let fwd = mid + dist;
            let back = mid.checked_sub(dist).filter(|&i| i >= lo);
            if fwd >= hi && back.is_none() {
                return None;
            }
            if fwd < hi {
                if let Some(a) = self.addrs[fwd].actual() {
                    return Some((fwd, a));
                }
            }
            if let Some(back) = back.filter(|_| dist > 0) {
                if let Some(a) = self.addrs[back].actual() {
                    return Some((back, a));
                }
            }
            dist += 1;
        }
    }

    /// Nearest real address at or before `line`, else the nearest after it.
    pub fn prev_actual_addr(&self, line: usize) -> Option<u16> {
        let line = line.min(self.len().checked_sub(1)?);
        self.addrs[..=line]
            .iter()
            .rev()
            .find_map(|a| a.actual())
            .or_else(|| self.addrs[line..].iter().find_map(|a| a.actual()))
    }

    /// Nearest real address at or after `line`, else the nearest before it.
    pub fn next_actual_addr(&self, line: usize) -> Option<u16> {
        let line = line.min(self.len().checked_sub(1)?);
        self.addrs[line..]
            .iter()
            .find_map(|a| a.actual())
            .or_else(|| self.addrs[..=line].iter().rev().find_map(|a| a.actual()))
    }
}

impl Default for LineIndex {
    fn default() -> Self {
        LineIndex::new(String::new())
    }
}

fn first_out_of_order(addrs: &[LineAddr]) -> Option<usize> {
    let mut last = None;
    for (ind, a) in addrs.iter().enumerate() {
        if let Some(a) = a.actual() {
            if last.map_or(false, |l| a < l) {
                return Some(ind);
            }
            last = Some(a);
        }
    }
    None
}
