//! Emulation-core capabilities consumed by the listing analysis.
//!
//! The branch lane allocator needs exactly two things from the engine a
//! listing belongs to: where a control-transfer instruction goes, and how many
//! program-counter steps the flash holds. [`Console`] is that contract and
//! [`AvrCore`] implements it for the ATmega32u4 (Arduboy) and ATmega328P
//! (Gamebuino Classic).
//!
//! Program counters are AVR word addresses (byte address / 2).

use serde::{Deserialize, Serialize};

/// Flash memory size: 32 KB.
///
/// The ATmega32u4 and the ATmega328P have the same program space, so relative
/// jumps wrap identically on both; [`CpuType`] only tags cache files.
pub const FLASH_SIZE: usize = 32 * 1024;

/// Target CPU type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuType {
    /// ATmega32u4 (Arduboy, Leonardo)
    Atmega32u4,
    /// ATmega328P (Gamebuino Classic, Arduino Uno)
    Atmega328p,
}

impl CpuType {
    pub fn name(self) -> &'static str {
        match self {
            CpuType::Atmega32u4 => "ATmega32u4",
            CpuType::Atmega328p => "ATmega328P",
        }
    }

    /// Byte tag used in file headers.
    pub fn to_byte(self) -> u8 {
        match self {
            CpuType::Atmega32u4 => 0,
            CpuType::Atmega328p => 1,
        }
    }

    pub fn from_byte(b: u8) -> Option<CpuType> {
        match b {
            0 => Some(CpuType::Atmega32u4),
            1 => Some(CpuType::Atmega328p),
            _ => None,
        }
    }
}

/// Capabilities the listing analysis needs from an emulation core.
pub trait Console {
    /// Target PC of the instruction `word` (followed by `word2`) at `pc`,
    /// or `None` if it is not a jump, branch or call with a static target.
    fn decode_jump_target(&self, word: u16, word2: u16, pc: u16) -> Option<u32>;

    /// Number of valid program-counter steps.
    fn program_size_in_steps(&self) -> usize;
}

/// Control transfer with a statically known target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Rjmp { k: i16 },
    Rcall { k: i16 },
    Jmp { k: u32 },
    Call { k: u32 },
    /// Branch if SREG bit `s` is set
    Brbs { s: u8, k: i8 },
    /// Branch if SREG bit `s` is cleared
    Brbc { s: u8, k: i8 },
}

/// Decode a control transfer from an instruction word (with the next word
/// for 32-bit JMP/CALL). Returns `None` for every other instruction.
pub fn decode_transfer(word: u16, next_word: u16) -> Option<Transfer> {
    // JMP: 1001 010k kkkk 110k kkkk kkkk kkkk kkkk
    // CALL: 1001 010k kkkk 111k kkkk kkkk kkkk kkkk
    if word & 0xFE0C == 0x940C {
        let hi = ((word as u32 >> 3) & 0x3E) | (word as u32 & 1);
        let k = (hi << 16) | next_word as u32;
        return Some(if word & 0x0002 == 0 {
            Transfer::Jmp { k }
        } else {
            Transfer::Call { k }
        });
    }

    match word & 0xF000 {
        // RJMP: 1100 kkkk kkkk kkkk
        0xC000 => return Some(Transfer::Rjmp { k: sign_extend_12(word & 0x0FFF) }),
        // RCALL: 1101 kkkk kkkk kkkk
        0xD000 => return Some(Transfer::Rcall { k: sign_extend_12(word & 0x0FFF) }),
        _ => {}
    }

    // BRBS: 1111 00kk kkkk ksss / BRBC: 1111 01kk kkkk ksss
    let s = (word & 7) as u8;
    let k = sign_extend_7((word >> 3) & 0x7F);
    match word & 0xFC00 {
        0xF000 => Some(Transfer::Brbs { s, k }),
        0xF400 => Some(Transfer::Brbc { s, k }),
        _ => None,
    }
}

/// Sign-extend 12-bit value to i16
#[inline(always)]
fn sign_extend_12(val: u16) -> i16 {
    ((val << 4) as i16) >> 4
}

/// Sign-extend 7-bit value to i8
#[inline(always)]
fn sign_extend_7(val: u16) -> i8 {
    ((val << 1) as u8 as i8) >> 1
}

/// Auto-detect CPU type from flash contents by examining the interrupt vector table.
///
/// ATmega328P has 26 vectors (byte addresses 0x00..0x64) while ATmega32u4 has
/// 43 (0x00..0xA8). If most of the 32u4-only slots hold JMP/RJMP the image
/// targets the 32u4.
pub fn detect_cpu_type(flash: &[u8]) -> CpuType {
    let Some(vectors) = flash.get(0x68..0xAC) else {
        return CpuType::Atmega328p;
    };

    let slots = vectors.chunks_exact(4);
    let checked = slots.len();
    let jumps = slots
        .filter(|slot| {
            let w = u16::from_le_bytes([slot[0], slot[1]]);
            (w & 0xFE0E) == 0x940C || (w & 0xF000) == 0xC000
        })
        .count();

    if jumps * 10 >= checked * 6 {
        CpuType::Atmega32u4
    } else {
        CpuType::Atmega328p
    }
}

/// Jump-target decoding for the AVR parts the emulator supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvrCore {
    cpu_type: CpuType,
}

impl AvrCore {
    pub fn new(cpu_type: CpuType) -> Self {
        AvrCore { cpu_type }
    }

    /// Pick the CPU type from a flash image's vector table.
    pub fn from_flash(flash: &[u8]) -> Self {
        Self::new(detect_cpu_type(flash))
    }

    pub fn cpu_type(&self) -> CpuType {
        self.cpu_type
    }

    /// Relative targets wrap around the program space like the hardware PC.
    fn relative(&self, pc: u16, k: i32) -> u32 {
        let steps = self.program_size_in_steps() as i64;
        (pc as i64 + 1 + k as i64).rem_euclid(steps) as u32
    }
}

impl Default for AvrCore {
    fn default() -> Self {
        Self::new(CpuType::Atmega32u4)
    }
}

impl Console for AvrCore {
    fn decode_jump_target(&self, word: u16, word2: u16, pc: u16) -> Option<u32> {
        let target = match decode_transfer(word, word2)? {
            Transfer::Rjmp { k } | Transfer::Rcall { k } => self.relative(pc, k as i32),
            Transfer::Brbs { k, .. } | Transfer::Brbc { k, .. } => self.relative(pc, k as i32),
            Transfer::Jmp { k } | Transfer::Call { k } => k,
        };
        Some(target)
    }

    fn program_size_in_steps(&self) -> usize {
        FLASH_SIZE / 2
    }
}
