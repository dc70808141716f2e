//! A tiny CFI assembler for tests. Little endian, 8 byte addresses.
#![allow(non_upper_case_globals)]

use alloc::vec::Vec;

use super::parse::{Endian, Layout, Section, SectionKind};
use super::index::Module;

pub(crate) const DW_EH_PE_absptr: u8 = 0x00;
pub(crate) const DW_EH_PE_udata4: u8 = 0x03;
pub(crate) const DW_EH_PE_pcrel_sdata4: u8 = 0x1b;

pub(crate) fn uleb(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub(crate) fn sleb(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CieSpec<'i> {
    pub version: u8,
    /// Only `z`, `R` and `S` are understood here.
    pub augmentation: &'static str,
    pub fde_encoding: u8,
    pub code_alignment_factor: u64,
    pub data_alignment_factor: i64,
    pub return_address_register: u64,
    pub instructions: &'i [u8],
}

impl Default for CieSpec<'_> {
    fn default() -> Self {
        Self {
            version: 1,
            augmentation: "",
            fde_encoding: DW_EH_PE_absptr,
            code_alignment_factor: 1,
            data_alignment_factor: -8,
            return_address_register: 16,
            instructions: &[],
        }
    }
}

struct CieInfo {
    offset: u64,
    has_z: bool,
    fde_encoding: u8,
}

pub(crate) struct CfiBuilder {
    kind: SectionKind,
    address: u64,
    data: Vec<u8>,
    cies: Vec<CieInfo>,
}

impl CfiBuilder {
    pub(crate) fn new(kind: SectionKind, address: u64) -> Self {
        Self {
            kind,
            address,
            data: Vec::new(),
            cies: Vec::new(),
        }
    }

    fn offset(&self) -> u64 {
        self.data.len() as u64
    }

    /// Writes the length, then patches it once `body` has been appended.
    fn entry(&mut self, body: impl FnOnce(&mut Self)) -> u64 {
        let start = self.data.len();
        self.data.extend_from_slice(&[0; 4]);
        body(self);
        while (self.data.len() - start) % 8 != 0 {
            // DW_CFA_nop
            self.data.push(0);
        }
        let length = (self.data.len() - start - 4) as u32;
        self.data[start..start + 4].copy_from_slice(&length.to_le_bytes());
        start as u64
    }

    pub(crate) fn cie(&mut self, spec: &CieSpec<'_>) -> u64 {
        let kind = self.kind;
        let offset = self.entry(|b| {
            let id: u32 = match kind {
                SectionKind::DebugFrame => u32::MAX,
                SectionKind::EhFrame => 0,
            };
            b.data.extend_from_slice(&id.to_le_bytes());
            b.data.push(spec.version);
            b.data.extend_from_slice(spec.augmentation.as_bytes());
            b.data.push(0);
            if spec.version == 4 {
                b.data.extend_from_slice(&[8, 0]);
            }
            uleb(&mut b.data, spec.code_alignment_factor);
            sleb(&mut b.data, spec.data_alignment_factor);
            if spec.version == 1 {
                b.data.push(spec.return_address_register as u8);
            } else {
                uleb(&mut b.data, spec.return_address_register);
            }
            if spec.augmentation.starts_with('z') {
                let mut aug = Vec::new();
                for code in spec.augmentation.bytes().skip(1) {
                    if code == b'R' {
                        aug.push(spec.fde_encoding);
                    }
                }
                uleb(&mut b.data, aug.len() as u64);
                b.data.extend_from_slice(&aug);
            }
            b.data.extend_from_slice(spec.instructions);
        });
        self.cies.push(CieInfo {
            offset,
            has_z: spec.augmentation.starts_with('z'),
            fde_encoding: if spec.augmentation.contains('R') {
                spec.fde_encoding
            } else {
                DW_EH_PE_absptr
            },
        });
        offset
    }

    pub(crate) fn fde(&mut self, cie: u64, start: u64, len: u64, instructions: &[u8]) -> u64 {
        let info = self
            .cies
            .iter()
            .find(|info| info.offset == cie)
            .map(|info| (info.has_z, info.fde_encoding))
            .expect("fde() needs a CIE written by this builder");
        let (has_z, encoding) = info;
        let (kind, address) = (self.kind, self.address);

        self.entry(|b| {
            let id_offset = b.offset();
            let id = match kind {
                SectionKind::DebugFrame => cie as u32,
                SectionKind::EhFrame => (id_offset - cie) as u32,
            };
            b.data.extend_from_slice(&id.to_le_bytes());
            match encoding {
                DW_EH_PE_absptr => {
                    b.data.extend_from_slice(&start.to_le_bytes());
                    b.data.extend_from_slice(&len.to_le_bytes());
                }
                DW_EH_PE_udata4 => {
                    b.data.extend_from_slice(&(start as u32).to_le_bytes());
                    b.data.extend_from_slice(&(len as u32).to_le_bytes());
                }
                DW_EH_PE_pcrel_sdata4 => {
                    let field = address + b.offset();
                    let rel = start.wrapping_sub(field) as i64 as i32;
                    b.data.extend_from_slice(&rel.to_le_bytes());
                    b.data.extend_from_slice(&(len as u32).to_le_bytes());
                }
                other => panic!("unsupported FDE encoding {other:#x}"),
            }
            if has_z {
                uleb(&mut b.data, 0);
            }
            b.data.extend_from_slice(instructions);
        })
    }

    /// The section bytes; `.eh_frame` gets its zero terminator.
    pub(crate) fn finish(mut self) -> Vec<u8> {
        if self.kind == SectionKind::EhFrame {
            self.data.extend_from_slice(&[0; 4]);
        }
        self.data
    }
}

pub(crate) fn layout() -> Layout {
    Layout {
        endian: Endian::Little,
        address_size: 8,
        text_base: None,
        data_base: None,
    }
}

pub(crate) fn module<'a>(
    name: &'a str,
    eh_frame: Option<(&'a [u8], u64)>,
    debug_frame: Option<&'a [u8]>,
) -> Module<'a> {
    Module {
        name,
        layout: layout(),
        bias: 0,
        eh_frame: eh_frame.map(|(data, address)| Section {
            kind: SectionKind::EhFrame,
            data,
            address,
        }),
        debug_frame: debug_frame.map(|data| Section {
            kind: SectionKind::DebugFrame,
            data,
            address: 0,
        }),
    }
}
