//! The per-module index of FDEs by PC range.
//!
//! Built once when a module is loaded by scanning its `.eh_frame` and
//! `.debug_frame` sections. Broken entries are dropped one by one; a broken
//! length field ends the scan of that section since we no longer know where
//! the next entry starts. Either way the rest of the module stays usable.
//!
//! Ranges are not expected to overlap, but nothing stops a producer from
//! emitting overlapping FDEs. When they do, the FDE inserted last wins:
//! `.debug_frame` is scanned after `.eh_frame`, and within a section later
//! entries win over earlier ones. Across modules, the module added to the
//! [`CfiTable`] last wins.

#[cfg(test)]
mod tests;

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::vec::Vec;

use super::parse::{
    parse_cie, parse_entry_header, parse_fde, Cie, Endian, Fde, Layout, PointerBases, Section, SectionKind,
};
use crate::error::{Error, Result};

/// A loaded object file, as far as CFI is concerned.
#[derive(Debug, Clone, Copy)]
pub struct Module<'a> {
    pub name: &'a str,
    pub layout: Layout,
    /// Difference between the run-time and the link-time addresses.
    pub bias: u64,
    pub eh_frame: Option<Section<'a>>,
    pub debug_frame: Option<Section<'a>>,
}

#[derive(Debug)]
struct IndexEntry<'a> {
    /// Biased start and end of the FDE.
    low: u64,
    high: u64,
    /// Insertion order, for overlap resolution.
    seq: usize,
    fde: Fde<'a>,
    cie: usize,
    kind: SectionKind,
    endian: Endian,
    bases: PointerBases,
}

/// An FDE found by PC, with everything needed to interpret it.
#[derive(Debug, Clone, Copy)]
pub struct CfiEntry<'i, 'a> {
    pub cie: &'i Cie<'a>,
    pub fde: &'i Fde<'a>,
    pub kind: SectionKind,
    /// Added to every address in the FDE to get a run-time address.
    pub bias: u64,
    pub(crate) endian: Endian,
    pub(crate) bases: PointerBases,
}

impl CfiEntry<'_, '_> {
    /// Run-time address of the first instruction the FDE covers.
    pub fn start(&self) -> u64 {
        self.fde.initial_location.wrapping_add(self.bias)
    }

    pub fn end(&self) -> u64 {
        self.fde.end().wrapping_add(self.bias)
    }
}

#[derive(Debug)]
pub struct CfiIndex<'a> {
    name: &'a str,
    cies: Vec<Cie<'a>>,
    /// Sorted by `(low, seq)`.
    entries: Vec<IndexEntry<'a>>,
    /// `max_end[i]` is the largest `high` among `entries[..=i]`.
    max_end: Vec<u64>,
    dropped: usize,
}

impl<'a> CfiIndex<'a> {
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Number of indexed FDEs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of CIEs and FDEs that were dropped as malformed.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// The FDE covering `pc`, with its CIE.
    pub fn find(&self, pc: u64) -> Option<CfiEntry<'_, 'a>> {
        // Everything from `end` on starts after `pc`.
        let end = self.entries.partition_point(|entry| entry.low <= pc);
        let mut best: Option<&IndexEntry<'a>> = None;
        for i in (0..end).rev() {
            // No entry at or before `i` reaches `pc`.
            if self.max_end[i] <= pc {
                break;
            }
            let entry = &self.entries[i];
            if pc < entry.high && best.map_or(true, |best| entry.seq > best.seq) {
                best = Some(entry);
            }
        }

        let entry = best?;
        trace!(
            "pc {pc:#x} in FDE at {:#x} [{:#x}, {:#x})",
            entry.fde.offset,
            entry.low,
            entry.high
        );
        Some(CfiEntry {
            cie: &self.cies[entry.cie],
            fde: &entry.fde,
            kind: entry.kind,
            bias: entry.low.wrapping_sub(entry.fde.initial_location),
            endian: entry.endian,
            bases: entry.bases,
        })
    }

    pub fn contains(&self, pc: u64) -> bool {
        self.find(pc).is_some()
    }
}

struct Builder<'a> {
    module: Module<'a>,
    cies: Vec<Cie<'a>>,
    entries: Vec<IndexEntry<'a>>,
    dropped: usize,
}

impl<'a> Builder<'a> {
    fn scan(&mut self, section: Section<'a>) {
        let layout = self.module.layout;
        // CIE offset -> index into `cies`, `None` if it was malformed.
        let mut cie_at: BTreeMap<u64, Option<usize>> = BTreeMap::new();
        let mut offset = 0;

        loop {
            let header = match parse_entry_header(&section, layout.endian, offset) {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        "{}: giving up on {:?} at {offset:#x}: {err}",
                        self.module.name, section.kind
                    );
                    self.dropped += 1;
                    break;
                }
            };
            offset = header.next;

            if header.is_cie(section.kind) {
                self.cie(&section, &mut cie_at, header.offset);
                continue;
            }

            let result = header
                .cie_offset(section.kind)
                .and_then(|cie_offset| {
                    self.cie(&section, &mut cie_at, cie_offset).ok_or_else(|| {
                        Error::malformed_fde(format!(
                            "no usable CIE at {cie_offset:#x}"
                        ))
                    })
                })
                .and_then(|cie| {
                    let fde = parse_fde(&header, &self.cies[cie], &section, &layout)?;
                    Ok((cie, fde))
                });

            match result {
                Ok((_, fde)) if fde.address_range == 0 => {
                    trace!("skipping empty FDE at {:#x}", fde.offset);
                }
                Ok((cie, fde)) => self.push(section, cie, fde),
                Err(err) => {
                    warn!(
                        "{}: dropping FDE at {:#x} in {:?}: {err}",
                        self.module.name, header.offset, section.kind
                    );
                    self.dropped += 1;
                }
            }
        }
    }

    /// Parses (once) the CIE at `offset`.
    fn cie(
        &mut self,
        section: &Section<'a>,
        cie_at: &mut BTreeMap<u64, Option<usize>>,
        offset: u64,
    ) -> Option<usize> {
        if let Some(known) = cie_at.get(&offset) {
            return *known;
        }
        let result: Result<Cie<'a>> = parse_entry_header(section, self.module.layout.endian, offset)
            .and_then(|header| {
                header.ok_or_else(|| {
                    Error::malformed_cie(format!("no entry at {offset:#x}"))
                })
            })
            .and_then(|header| parse_cie(&header, section, &self.module.layout));

        let idx = match result {
            Ok(cie) => {
                self.cies.push(cie);
                Some(self.cies.len() - 1)
            }
            Err(err) => {
                warn!(
                    "{}: dropping CIE at {offset:#x} in {:?}: {err}",
                    self.module.name, section.kind
                );
                self.dropped += 1;
                None
            }
        };
        cie_at.insert(offset, idx);
        idx
    }

    fn push(&mut self, section: Section<'a>, cie: usize, fde: Fde<'a>) {
        let mut bases = PointerBases::new(&section, &self.module.layout);
        bases.func = Some(fde.initial_location);
        let low = fde.initial_location.wrapping_add(self.module.bias);
        let high = low.saturating_add(fde.address_range);
        self.entries.push(IndexEntry {
            low,
            high,
            seq: self.entries.len(),
            fde,
            cie,
            kind: section.kind,
            endian: self.module.layout.endian,
            bases,
        });
    }

    fn finish(mut self) -> CfiIndex<'a> {
        self.entries.sort_by_key(|entry| (entry.low, entry.seq));
        let mut max_end = Vec::with_capacity(self.entries.len());
        let mut running = 0;
        for entry in &self.entries {
            running = running.max(entry.high);
            max_end.push(running);
        }
        CfiIndex {
            name: self.module.name,
            cies: self.cies,
            entries: self.entries,
            max_end,
            dropped: self.dropped,
        }
    }
}

/// Scans the CFI sections of `module` and indexes its FDEs.
#[instrument(skip(module), fields(module = module.name))]
pub fn build_cfi_index<'a>(module: &Module<'a>) -> CfiIndex<'a> {
    let mut builder = Builder {
        module: *module,
        cies: Vec::new(),
        entries: Vec::new(),
        dropped: 0,
    };
    for section in [module.eh_frame, module.debug_frame].into_iter().flatten() {
        builder.scan(section);
    }
    let index = builder.finish();
    debug!(
        "indexed {} FDEs ({} CIEs, {} entries dropped)",
        index.len(),
        index.cies.len(),
        index.dropped
    );
    index
}

/// The CFI of every loaded module.
#[derive(Debug, Default)]
pub struct CfiTable<'a> {
    modules: Vec<CfiIndex<'a>>,
}

impl<'a> CfiTable<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, index: CfiIndex<'a>) {
        self.modules.push(index);
    }

    /// Indexes `module` and adds it.
    pub fn load(&mut self, module: &Module<'a>) -> &CfiIndex<'a> {
        self.modules.push(build_cfi_index(module));
        &self.modules[self.modules.len() - 1]
    }

    /// Forgets the module called `name`.
    pub fn unload(&mut self, name: &str) -> Option<CfiIndex<'a>> {
        let pos = self.modules.iter().rposition(|index| index.name == name)?;
        Some(self.modules.remove(pos))
    }

    pub fn modules(&self) -> impl Iterator<Item = &CfiIndex<'a>> {
        self.modules.iter()
    }

    /// The FDE covering `pc`, searching the most recently added modules
    /// first.
    pub fn find(&self, pc: u64) -> Option<CfiEntry<'_, 'a>> {
        self.modules.iter().rev().find_map(|index| index.find(pc))
    }
}
