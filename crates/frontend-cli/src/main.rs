//! `abdisasm`: print an `avr-objdump -d` listing of an Arduboy game with
//! branch arrows drawn in a gutter, and look up addresses in it.
//!
//! ```text
//! abdisasm game.lss                       # whole listing
//! abdisasm game.lss --range 100:160       # lines 100..160
//! abdisasm game.lss --addr 0x1a4 --addr 2f0
//! abdisasm game.lss --cache game.abdl -v  # reuse a previous analysis
//! ```
//!
//! Line numbers are 0-based everywhere, lookups and ranges alike.

mod gutter;

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use tracing::{info, warn};
use tracing_chrome::{ChromeLayerBuilder, FlushGuard};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use arduboy_disasm::{
    cache, AvrCore, BranchConfig, BranchDepth, CpuType, DisasmFile, LineAddr,
    DEFAULT_MAX_BRANCH_SHOW_DIST,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Cpu {
    #[value(name = "32u4")]
    Atmega32u4,
    #[value(name = "328p")]
    Atmega328p,
}

impl From<Cpu> for CpuType {
    fn from(cpu: Cpu) -> Self {
        match cpu {
            Cpu::Atmega32u4 => CpuType::Atmega32u4,
            Cpu::Atmega328p => CpuType::Atmega328p,
        }
    }
}

/// Half-open line range `START:END`; either side may be omitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LineRange {
    start: usize,
    end: usize,
}

impl FromStr for LineRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s.split_once(':').ok_or_else(|| format!("expected START:END, got '{}'", s))?;
        let parse = |v: &str, default: usize| {
            if v.is_empty() {
                Ok(default)
            } else {
                v.parse::<usize>().map_err(|e| format!("invalid line '{}': {}", v, e))
            }
        };
        let range = LineRange { start: parse(start, 0)?, end: parse(end, usize::MAX)? };
        if range.start > range.end {
            return Err(format!("range start {} is after its end {}", range.start, range.end));
        }
        Ok(range)
    }
}

fn parse_addr(s: &str) -> Result<u16, String> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid address '{}': {}", s, e))
}

#[derive(Parser)]
#[command(version, about = "Show an Arduboy disassembly listing with branch lanes")]
struct Cli {
    #[clap(help = "Listing produced by avr-objdump -d (.lss)")]
    listing: PathBuf,

    #[clap(long, default_value_t = DEFAULT_MAX_BRANCH_SHOW_DIST)]
    #[clap(help = "Longest branch, in lines, that still gets a lane")]
    max_branch_dist: usize,

    #[clap(long, value_enum, default_value = "32u4")]
    #[clap(help = "Target MCU, recorded in the analysis cache")]
    cpu: Cpu,

    #[clap(long = "addr", value_parser = parse_addr)]
    #[clap(help = "Look up a byte address (hex), may be repeated")]
    addrs: Vec<u16>,

    #[clap(long)]
    #[clap(help = "Only print lines START:END")]
    range: Option<LineRange>,

    #[clap(long)]
    #[clap(help = "Analysis cache to reuse, written when missing or stale")]
    cache: Option<PathBuf>,

    #[clap(short, long, action = ArgAction::Count)]
    #[clap(help = "More log output (-v info, -vv debug, -vvv trace)")]
    verbose: u8,

    #[clap(long)]
    #[clap(help = "Enable chrome tracing")]
    #[clap(long_help = "Enable chrome tracing which on program exit will generate
a json file to be opened with a chrome tracing compatible
viewer.")]
    trace: bool,
}

/// Log to stderr, filtered by `RUST_LOG` or else by the verbosity flag.
///
/// Keep the returned guard alive for the whole run when tracing is on.
fn init_logging(verbose: u8, trace: bool) -> Option<FlushGuard> {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr));

    if trace {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        registry.with(chrome_layer).init();
        Some(guard)
    } else {
        registry.init();
        None
    }
}

/// Reuse the cached analysis when it was built from the same text and
/// settings, otherwise analyze and refresh the cache.
fn load_or_build(text: String, core: &AvrCore, config: &BranchConfig, cache_path: Option<&Path>) -> Result<DisasmFile> {
    let Some(path) = cache_path else {
        return Ok(DisasmFile::from_src(text, core, config));
    };

    if path.exists() {
        match cache::load_from_file(path, core.cpu_type()) {
            Ok(file) if file.content() == text && file.config() == config => {
                info!(path = %path.display(), "using analysis cache");
                return Ok(file);
            }
            Ok(_) => info!(path = %path.display(), "analysis cache is stale"),
            Err(e) => warn!(path = %path.display(), error = %e, "ignoring analysis cache"),
        }
    }

    let file = DisasmFile::from_src(text, core, config);
    cache::save_to_file(&file, core.cpu_type(), path)
        .with_context(|| format!("failed to write analysis cache {}", path.display()))?;
    Ok(file)
}

fn fmt_addr(addr: Option<u16>) -> String {
    addr.map_or_else(|| "-".to_string(), |a| format!("{:#06x}", a))
}

fn print_listing(out: &mut impl Write, file: &DisasmFile, range: LineRange) -> io::Result<()> {
    let width = gutter::width(file);
    for line in range.start..range.end.min(file.len()) {
        writeln!(out, "{} {}", gutter::render(file, line, width), file.line(line))?;
    }
    Ok(())
}

fn print_lookups(out: &mut impl Write, file: &DisasmFile, addrs: &[u16]) -> io::Result<()> {
    for &addr in addrs {
        let Some(line) = file.line_ind_from_addr(addr) else {
            writeln!(out, "{:#06x}: past the end of the listing", addr)?;
            continue;
        };
        let found = file.addr(line);
        let exact = if found == LineAddr::Addr(addr) { "" } else { " (next)" };
        let prev = line.checked_sub(1).and_then(|l| file.prev_actual_addr(l)).filter(|&a| a < addr);
        let next = file
            .next_actual_addr(line + 1)
            .filter(|&a| found.actual().map_or(false, |f| a > f));
        writeln!(
            out,
            "{:#06x}: line {}{}  prev {}  next {}\n    {}",
            addr,
            line,
            exact,
            fmt_addr(prev),
            fmt_addr(next),
            file.line(line).trim()
        )?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _trace_guard = init_logging(cli.verbose, cli.trace);

    let text = fs::read_to_string(&cli.listing)
        .with_context(|| format!("failed to read listing {}", cli.listing.display()))?;

    let core = AvrCore::new(cli.cpu.into());
    let config = BranchConfig::with_max_branch_show_dist(cli.max_branch_dist);
    let file = load_or_build(text, &core, &config, cli.cache.as_deref())?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    // Address lookups alone skip the listing unless a range is asked for
    if cli.addrs.is_empty() || cli.range.is_some() {
        let range = cli.range.unwrap_or(LineRange { start: 0, end: usize::MAX });
        print_listing(&mut out, &file, range)?;
    }
    print_lookups(&mut out, &file, &cli.addrs)?;
    out.flush()?;

    let roots = file.branch_roots();
    let clipped = roots.iter().filter(|r| r.display_depth == BranchDepth::Clipped).count();
    eprintln!(
        "{} lines, {} labels, {} branch roots ({} clipped), {} runs, max depth {}",
        file.len(),
        file.index().labels().len(),
        roots.len(),
        clipped,
        file.passing_branches().len(),
        file.max_branch_display_depth()
    );
    if !file.index().is_address_order_valid() {
        eprintln!("warning: addresses are not in ascending order, lookups use a linear scan");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn listing() -> String {
        concat!(
            "00000000 <main>:\n",
            "       0:\t00 00       \tnop\n",
            "       2:\tfe cf       \trjmp\t.-4\n",
            "       6:\t08 95       \tret\n",
        )
        .to_string()
    }

    #[test]
    fn test_parse_range() {
        assert_eq!("3:9".parse::<LineRange>(), Ok(LineRange { start: 3, end: 9 }));
        assert_eq!(":9".parse::<LineRange>(), Ok(LineRange { start: 0, end: 9 }));
        assert_eq!("3:".parse::<LineRange>(), Ok(LineRange { start: 3, end: usize::MAX }));
        assert!("9:3".parse::<LineRange>().is_err());
        assert!("12".parse::<LineRange>().is_err());
    }

    #[test]
    fn test_parse_addr() {
        assert_eq!(parse_addr("0x1a4"), Ok(0x1a4));
        assert_eq!(parse_addr("2F0"), Ok(0x2f0));
        assert!(parse_addr("10000").is_err());
        assert!(parse_addr("xyz").is_err());
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from([
            "abdisasm", "game.lss", "--cpu", "328p", "--addr", "0x10", "--addr", "20", "--range", "0:5", "-vv",
        ]);
        assert_eq!(cli.cpu, Cpu::Atmega328p);
        assert_eq!(cli.addrs, vec![0x10, 0x20]);
        assert_eq!(cli.range, Some(LineRange { start: 0, end: 5 }));
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.max_branch_dist, DEFAULT_MAX_BRANCH_SHOW_DIST);
    }

    #[test]
    fn test_print_listing() {
        let file = DisasmFile::from_src(listing(), &AvrCore::default(), &BranchConfig::default());
        let mut out = Vec::new();
        print_listing(&mut out, &file, LineRange { start: 1, end: 3 }).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            format!("+> {}\n+- {}\n", file.line(1), file.line(2))
        );
    }

    #[test]
    fn test_print_lookups() {
        let file = DisasmFile::from_src(listing(), &AvrCore::default(), &BranchConfig::default());
        let mut out = Vec::new();
        print_lookups(&mut out, &file, &[0x4, 0x20]).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "0x0004: line 3 (next)  prev 0x0002  next -\n    6:\t08 95       \tret\n\
             0x0020: past the end of the listing\n"
        );

        // Lookup line numbers are the ones --range takes
        let mut shown = Vec::new();
        print_listing(&mut shown, &file, LineRange { start: 3, end: 4 }).unwrap();
        assert!(String::from_utf8(shown).unwrap().trim_end().ends_with(file.line(3)));
    }

    #[test]
    fn test_cache_is_reused_and_refreshed() {
        let path = std::env::temp_dir().join(format!("abdisasm-test-{}.abdl", std::process::id()));
        let core = AvrCore::default();
        let config = BranchConfig::default();

        let built = load_or_build(listing(), &core, &config, Some(&path)).unwrap();
        assert!(path.exists());
        let reused = load_or_build(listing(), &core, &config, Some(&path)).unwrap();
        assert_eq!(reused, built);

        let other = BranchConfig::with_max_branch_show_dist(0);
        let rebuilt = load_or_build(listing(), &core, &other, Some(&path)).unwrap();
        assert_eq!(rebuilt.config(), &other);

        fs::remove_file(&path).unwrap();
    }
}
