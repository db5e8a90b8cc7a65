//! End-to-end: objdump listing → line index → branch lanes, decoded with the
//! real AVR jump decoder.

use arduboy_disasm::{cache, AvrCore, BranchConfig, BranchDepth, CpuType, DisasmFile, LineAddr};

use pretty_assertions::assert_eq;

const BLINK: &str = concat!(
    "\n",
    "blink.elf:     file format elf32-avr\n",
    "\n",
    "\n",
    "Disassembly of section .text:\n",
    "\n",
    "00000000 <__vectors>:\n",
    "       0:\t0c 94 0a 00 \tjmp\t0x14\t; 0x14 <__ctors_end>\n",
    "       4:\t0c 94 1e 00 \tjmp\t0x3c\t; 0x3c <__bad_interrupt>\n",
    "       8:\t0c 94 1e 00 \tjmp\t0x3c\t; 0x3c <__bad_interrupt>\n",
    "       c:\t0c 94 1e 00 \tjmp\t0x3c\t; 0x3c <__bad_interrupt>\n",
    "      10:\t0c 94 1e 00 \tjmp\t0x3c\t; 0x3c <__bad_interrupt>\n",
    "\n",
    "00000014 <__ctors_end>:\n",
    "      14:\t11 24       \teor\tr1, r1\n",
    "      16:\t1f be       \tout\t0x3f, r1\t; 63\n",
    "      18:\tcf ef       \tldi\tr28, 0xFF\t; 255\n",
    "      1a:\t0e 94 13 00 \tcall\t0x26\t; 0x26 <main>\n",
    "      1e:\t0c 94 20 00 \tjmp\t0x40\t; 0x40 <_exit>\n",
    "      22:\t00 00       \tnop\n",
    "      24:\t00 00       \tnop\n",
    "\n",
    "00000026 <main>:\n",
    "      26:\t80 e0       \tldi\tr24, 0x00\t; 0\n",
    "      28:\t90 e0       \tldi\tr25, 0x00\t; 0\n",
    "      2a:\t01 96       \tadiw\tr24, 0x01\t; 1\n",
    "      2c:\t8a 30       \tcpi\tr24, 0x0A\t; 10\n",
    "      2e:\te9 f7       \tbrne\t.-6      \t; 0x2a <main+0x4>\n",
    "      30:\t02 c0       \trjmp\t.+4      \t; 0x36 <main+0x10>\n",
    "      32:\t00 00       \tnop\n",
    "      34:\tfa cf       \trjmp\t.-12     \t; 0x2a <main+0x4>\n",
    "      36:\tf7 cf       \trjmp\t.-18     \t; 0x26 <main>\n",
    "\t...\n",
    "\n",
    "0000003c <__bad_interrupt>:\n",
    "      3c:\t0c 94 00 00 \tjmp\t0\t; 0x0 <__vectors>\n",
    "\n",
    "00000040 <_exit>:\n",
    "      40:\tf8 94       \tcli\n",
    "\n",
    "00000042 <__stop_program>:\n",
    "      42:\tff cf       \trjmp\t.-2      \t; 0x42 <__stop_program>\n",
);

fn load(config: &BranchConfig) -> DisasmFile {
    DisasmFile::from_src(BLINK, &AvrCore::new(CpuType::Atmega32u4), config)
}

fn assert_no_conflicts(file: &DisasmFile) {
    let roots = file.branch_roots();
    for (i, a) in roots.iter().enumerate() {
        assert!(a.display_depth.is_terminal(), "{:?}", a);
        for b in &roots[i + 1..] {
            if a.overlaps(b) && a.dest_line != b.dest_line {
                if let (Some(da), Some(db)) = (a.display_depth.lane(), b.display_depth.lane()) {
                    assert_ne!(da, db, "{:?} and {:?} share a lane", a, b);
                }
            }
        }
    }
}

#[test]
fn line_classes() {
    let file = load(&BranchConfig::default());
    assert_eq!(file.len(), 42);

    let labels: Vec<_> = file.index().labels().iter().map(|(&a, &l)| (a, l)).collect();
    assert_eq!(labels, vec![(0x00, 6), (0x14, 13), (0x26, 22), (0x3c, 34), (0x40, 37), (0x42, 40)]);
    assert_eq!(file.index().label_name(40), Some("__stop_program"));

    assert_eq!(file.addr(1), LineAddr::NotAnAddr);
    assert_eq!(file.addr(32), LineAddr::NotAnAddr);
    assert_eq!(file.addr(31), LineAddr::Addr(0x36));
    assert!(file.index().is_program(31));
    assert!(file.index().is_address_order_valid());
}

#[test]
fn every_address_round_trips() {
    let file = load(&BranchConfig::default());
    for line in 0..file.len() {
        if let LineAddr::Addr(a) = file.addr(line) {
            assert_eq!(file.line_ind_from_addr(a), Some(line), "addr {:#x}", a);
        }
    }
    // Hole left by "..." resolves to the next real line
    assert_eq!(file.line_ind_from_addr(0x38), Some(35));
    assert_eq!(file.line_ind_from_addr(0x44), None);
    assert_eq!(file.prev_actual_addr(33), Some(0x36));
    assert_eq!(file.next_actual_addr(33), Some(0x3c));
}

#[test]
fn branch_roots() {
    let file = load(&BranchConfig::default());
    let found: Vec<_> = file
        .branch_roots()
        .iter()
        .map(|r| (r.start, r.dest, r.start_line, r.dest_line))
        .collect();
    assert_eq!(
        found,
        vec![
            (0x00, 0x14, 7, 14),
            (0x04, 0x3c, 8, 35),
            (0x08, 0x3c, 9, 35),
            (0x0c, 0x3c, 10, 35),
            (0x10, 0x3c, 11, 35),
            (0x1a, 0x26, 17, 23),
            (0x1e, 0x40, 18, 38),
            (0x2e, 0x2a, 27, 25),
            (0x30, 0x36, 28, 31),
            (0x34, 0x2a, 30, 25),
            (0x36, 0x26, 31, 23),
            (0x3c, 0x00, 35, 7),
            (0x42, 0x42, 41, 41),
        ]
    );
    assert_no_conflicts(&file);
    assert!(file.branch_roots().iter().all(|r| r.display_depth != BranchDepth::Clipped));
}

#[test]
fn long_branches_are_clipped() {
    let file = load(&BranchConfig::with_max_branch_show_dist(20));
    let clipped: Vec<_> = file
        .branch_roots()
        .iter()
        .filter(|r| r.display_depth == BranchDepth::Clipped)
        .map(|r| r.start_line)
        .collect();
    assert_eq!(clipped, vec![8, 9, 10, 11, 35]);
    assert_no_conflicts(&file);
}

#[test]
fn rebuild_is_reproducible() {
    let a = load(&BranchConfig::default());
    let mut b = DisasmFile::new();
    b.load_src(BLINK, &AvrCore::default(), &BranchConfig::default());
    assert_eq!(a, b);
}

#[test]
fn cache_file_round_trip() {
    let file = load(&BranchConfig::default());
    let path = std::env::temp_dir().join(format!("arduboy-disasm-{}.abdl", std::process::id()));

    cache::save_to_file(&file, CpuType::Atmega32u4, &path).unwrap();
    let loaded = cache::load_from_file(&path, CpuType::Atmega32u4);
    std::fs::remove_file(&path).unwrap();

    assert_eq!(loaded.unwrap(), file);
}
