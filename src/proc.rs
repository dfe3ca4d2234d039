use std::fmt;
use std::fs;

use combine::error::ParseError;
use combine::parser::char::{char, hex_digit};
use combine::Parser;
use combine::{choice, many1, Stream};

use libc;

use crate::errors::{Error, Result};

/// One mapped region of the process, `[start, end)` with a
/// `libc::PROT_*` bitmask.
#[derive(Clone, Copy, PartialEq)]
pub struct MemRegion {
    pub start: u64,
    pub end: u64,
    pub prot: i32,
}

impl MemRegion {
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }
}

impl fmt::Debug for MemRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let flag = |bit: i32, c: char| if self.prot & bit != 0 { c } else { '-' };
        write!(
            f,
            "{:x}-{:x} {}{}{}",
            self.start,
            self.end,
            flag(libc::PROT_READ, 'r'),
            flag(libc::PROT_WRITE, 'w'),
            flag(libc::PROT_EXEC, 'x')
        )
    }
}

fn hex_value<I>() -> impl Parser<Input = I, Output = u64>
where
    I: Stream<Item = char>,
    // Necessary due to rust-lang/rust#24159
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    many1::<String, _>(hex_digit()).map(|s| u64::from_str_radix(&s, 16).unwrap())
}

fn prot<I>() -> impl Parser<Input = I, Output = i32>
where
    I: Stream<Item = char>,
    // Necessary due to rust-lang/rust#24159
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    (
        char(' '),
        choice([char('-'), char('r')]),
        choice([char('-'), char('w')]),
        choice([char('-'), char('x')]),
        choice([char('-'), char('s'), char('p')]),
    )
        .map(|(_, r, w, x, _)| {
            let mut prot: i32 = 0;
            if r == 'r' {
                prot |= libc::PROT_READ;
            }
            if w == 'w' {
                prot |= libc::PROT_WRITE;
            }
            if x == 'x' {
                prot |= libc::PROT_EXEC;
            }
            prot
        })
}

fn parser<I>() -> impl Parser<Input = I, Output = MemRegion>
where
    I: Stream<Item = char>,
    // Necessary due to rust-lang/rust#24159
    I::Error: ParseError<I::Item, I::Range, I::Position>,
{
    (hex_value(), char('-'), hex_value(), prot()).map(|(start, _, end, prot)| {
        MemRegion { start, end, prot }
    })
}

fn parse_maps_line(line: &str) -> Result<MemRegion> {
    match parser().easy_parse(line) {
        Ok((region, _rest)) => Ok(region),
        Err(parse_error) => Err(Error::InvalidArgument(format!(
            "maps line parse error: {}",
            parse_error
        ))),
    }
}

/// Point-in-time view of `/proc/self/maps`.
///
/// The patcher keeps one view per registration; the only protection
/// changes made after the snapshot are its own temporary widenings, so
/// staleness is acceptable.
pub struct MemoryMapView {
    regions: Vec<MemRegion>,
}

impl MemoryMapView {
    pub fn snapshot() -> Result<Self> {
        let contents = fs::read_to_string("/proc/self/maps")?;
        Ok(Self::from_maps(&contents))
    }

    /// Lines that fail to parse are skipped.
    fn from_maps(contents: &str) -> Self {
        MemoryMapView {
            regions: contents
                .lines()
                .filter_map(|line| parse_maps_line(line).ok())
                .collect(),
        }
    }

    /// Protection of the first region containing `addr`, `None` when
    /// the address is not covered by the snapshot.
    pub fn protection_at(&self, addr: usize) -> Option<i32> {
        let addr = addr as u64;
        self.regions
            .iter()
            .find(|region| region.contains(addr))
            .map(|region| region.prot)
    }

    pub fn regions(&self) -> &[MemRegion] {
        &self.regions
    }
}

#[test]
fn can_snapshot_self_maps() -> Result<()> {
    let view = MemoryMapView::snapshot()?;
    assert!(!view.regions().is_empty());
    Ok(())
}

#[test]
fn own_code_is_executable_and_not_writable() -> Result<()> {
    let view = MemoryMapView::snapshot()?;
    let addr = parse_maps_line as usize;
    let prot = view.protection_at(addr).expect("code page must be mapped");
    assert_ne!(prot & libc::PROT_EXEC, 0);
    assert_eq!(prot & libc::PROT_WRITE, 0);
    Ok(())
}

#[test]
fn malformed_lines_are_skipped() {
    let view = MemoryMapView::from_maps(
        "1000-2000 r-xp 00000000 08:01 42 /bin/probe\n\
         not a maps line\n\
         3000-4000 rw-p 00000000 08:01 42\n",
    );
    assert_eq!(view.regions().len(), 2);
    assert_eq!(view.protection_at(0x1500), Some(libc::PROT_READ | libc::PROT_EXEC));
    assert_eq!(view.protection_at(0x3000), Some(libc::PROT_READ | libc::PROT_WRITE));
    assert_eq!(view.protection_at(0x2500), None);
}

#[test]
fn agrees_with_procfs() {
    let view = MemoryMapView::snapshot().unwrap();
    let maps = procfs::process::Process::myself()
        .and_then(|p| p.maps())
        .unwrap();
    let addr = parse_maps_line as usize as u64;
    assert!(maps
        .iter()
        .any(|m| m.address.0 <= addr && addr < m.address.1));
    assert!(view.protection_at(addr as usize).is_some());
}
