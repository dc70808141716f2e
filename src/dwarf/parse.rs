//! Implements parsing of DWARF call frame information entries.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §6.4 Call Frame Information,
//! and the LSB for the `.eh_frame` flavour:
//! <https://refspecs.linuxbase.org/LSB_5.0.0/LSB-Core-generic/LSB-Core-generic/ehframechpt.html>
//!
//! A CFI section is a sequence of entries, each either a Common Information
//! Entry (CIE) or a Frame Description Entry (FDE). Every entry starts with a
//! length and an id field; the id tells CIEs and FDEs apart and, for FDEs,
//! points at the CIE they belong to. `.debug_frame` and `.eh_frame` disagree
//! on how that id is encoded, which is why everything here knows which
//! [`SectionKind`] it is reading.
//!
//! Everything is bounds checked. CFI comes straight out of the inferior's
//! binaries and the debugger must survive whatever garbage is in there.
#![allow(non_upper_case_globals)]

#[cfg(test)]
mod tests;

use alloc::format;
use core::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// `.debug_frame`, as described by the DWARF standard.
    DebugFrame,
    /// `.eh_frame`, the GNU flavour used for exception handling.
    EhFrame,
}

/// A CFI section as mapped in the module.
#[derive(Debug, Clone, Copy)]
pub struct Section<'a> {
    pub kind: SectionKind,
    pub data: &'a [u8],
    /// The section's address, used for `DW_EH_PE_pcrel` pointers.
    pub address: u64,
}

/// Per-module facts needed to decode addresses inside CFI entries.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub endian: Endian,
    pub address_size: u8,
    /// Base for `DW_EH_PE_textrel` pointers.
    pub text_base: Option<u64>,
    /// Base for `DW_EH_PE_datarel` pointers (usually the GOT).
    pub data_base: Option<u64>,
}

/// A bounds-checked reader over a slice of a CFI section that remembers
/// where in the section it is.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    offset: u64,
    endian: Endian,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(data: &'a [u8], offset: u64, endian: Endian) -> Self {
        Self {
            data,
            offset,
            endian,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset of the next byte within the section.
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn endian(&self) -> Endian {
        self.endian
    }

    pub(crate) fn rest(&self) -> &'a [u8] {
        self.data
    }

    pub(crate) fn read_bytes(&mut self, amount: usize) -> Result<&'a [u8]> {
        if self.data.len() < amount {
            return Err(Error::malformed_fde(format!(
                "index out of bounds, tried to read {amount} bytes from {}",
                self.data.len()
            )));
        }
        let (result, rest) = self.data.split_at(amount);
        self.data = rest;
        self.offset += amount as u64;
        Ok(result)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_array()?;
        Ok(match self.endian {
            Endian::Little => u16::from_le_bytes(b),
            Endian::Big => u16::from_be_bytes(b),
        })
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_array()?;
        Ok(match self.endian {
            Endian::Little => u32::from_le_bytes(b),
            Endian::Big => u32::from_be_bytes(b),
        })
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        let b = self.read_array()?;
        Ok(match self.endian {
            Endian::Little => u64::from_le_bytes(b),
            Endian::Big => u64::from_be_bytes(b),
        })
    }

    pub(crate) fn read_address(&mut self, size: u8) -> Result<u64> {
        match size {
            2 => self.read_u16().map(u64::from),
            4 => self.read_u32().map(u64::from),
            8 => self.read_u64(),
            _ => Err(Error::malformed_cie(format!("unsupported address size {size}"))),
        }
    }

    pub(crate) fn read_uleb128(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= u64::from(byte & 0x7f) << shift;
            } else if byte & 0x7f != 0 {
                return Err(Error::malformed_fde("ULEB128 overflows 64 bits"));
            }
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
    }

    pub(crate) fn read_sleb128(&mut self) -> Result<i64> {
        let mut result: i64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= i64::from(byte & 0x7f) << shift;
            } else if byte & 0x7f != 0 && byte & 0x7f != 0x7f {
                return Err(Error::malformed_fde("SLEB128 overflows 64 bits"));
            }
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1 << shift;
                }
                return Ok(result);
            }
        }
    }

    /// A null-terminated UTF-8 string.
    pub(crate) fn read_utf8_cstr(&mut self) -> Result<&'a str> {
        let len = self
            .data
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::malformed_cie("no null terminator found for string"))?;
        let bytes = self.read_bytes(len + 1)?;
        core::str::from_utf8(&bytes[..len])
            .map_err(|e| Error::malformed_cie(format!("invalid utf8: {e:?}")))
    }

    /// A `DW_FORM_block`: ULEB128 length followed by that many bytes.
    pub(crate) fn read_block(&mut self) -> Result<&'a [u8]> {
        let len = self.read_uleb128()?;
        let len = usize::try_from(len).map_err(|_| Error::malformed_fde("block too large"))?;
        self.read_bytes(len)
    }

    fn align_to(&mut self, align: u8) -> Result<()> {
        let align = u64::from(align);
        if align == 0 {
            return Err(Error::malformed_fde("alignment to a zero address size"));
        }
        let misalignment = self.offset % align;
        if misalignment != 0 {
            self.read_bytes((align - misalignment) as usize)?;
        }
        Ok(())
    }
}

/// A `DW_EH_PE_*` pointer encoding byte.
#[derive(PartialEq, Eq, Clone, Copy)]
#[repr(transparent)]
pub struct Encoding(pub u8);

impl Encoding {
    pub const ABSPTR: Encoding = Encoding(0x00);
    pub const OMIT: Encoding = Encoding(0xff);
    const INDIRECT: u8 = 0x80;

    fn format(self) -> Result<ValueFormat> {
        Ok(match self.0 & 0x0f {
            0x00 => ValueFormat::DW_EH_PE_absptr,
            0x01 => ValueFormat::DW_EH_PE_uleb128,
            0x02 => ValueFormat::DW_EH_PE_udata2,
            0x03 => ValueFormat::DW_EH_PE_udata4,
            0x04 => ValueFormat::DW_EH_PE_udata8,
            0x09 => ValueFormat::DW_EH_PE_sleb128,
            0x0A => ValueFormat::DW_EH_PE_sdata2,
            0x0B => ValueFormat::DW_EH_PE_sdata4,
            0x0C => ValueFormat::DW_EH_PE_sdata8,
            v => return Err(Error::malformed_fde(format!("invalid pointer format {v:#x}"))),
        })
    }

    fn application(self) -> Result<ValueApplication> {
        Ok(match self.0 & 0x70 {
            0x00 => ValueApplication::DW_EH_PE_absptr,
            0x10 => ValueApplication::DW_EH_PE_pcrel,
            0x20 => ValueApplication::DW_EH_PE_textrel,
            0x30 => ValueApplication::DW_EH_PE_datarel,
            0x40 => ValueApplication::DW_EH_PE_funcrel,
            0x50 => ValueApplication::DW_EH_PE_aligned,
            v => {
                return Err(Error::malformed_fde(format!(
                    "invalid pointer application {v:#x}"
                )))
            }
        })
    }

    /// The same value format, applied absolutely. Used for FDE address
    /// ranges, which are lengths rather than pointers.
    fn format_only(self) -> Encoding {
        Encoding(self.0 & 0x0f)
    }

    /// The decoded value is the address of a slot holding the pointer.
    pub fn is_indirect(self) -> bool {
        self != Encoding::OMIT && self.0 & Self::INDIRECT != 0
    }

    /// The encoding without `DW_EH_PE_indirect`, for pointers we keep but
    /// never follow.
    fn direct(self) -> Encoding {
        if self.is_indirect() {
            Encoding(self.0 & !Self::INDIRECT)
        } else {
            self
        }
    }
}

impl fmt::Debug for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Encoding::OMIT {
            return write!(f, "DW_EH_PE_omit");
        }
        match (self.application(), self.format()) {
            (Ok(app), Ok(format)) => write!(f, "{app:?} | {format:?}"),
            _ => write!(f, "Encoding({:#x})", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
#[allow(non_camel_case_types)]
enum ValueFormat {
    /// A pointer-sized unsigned value.
    DW_EH_PE_absptr,
    DW_EH_PE_uleb128,
    DW_EH_PE_udata2,
    DW_EH_PE_udata4,
    DW_EH_PE_udata8,
    DW_EH_PE_sleb128,
    DW_EH_PE_sdata2,
    DW_EH_PE_sdata4,
    DW_EH_PE_sdata8,
}

#[derive(Debug, Clone, Copy)]
#[allow(non_camel_case_types)]
enum ValueApplication {
    DW_EH_PE_absptr,
    /// Value is relative to the address of the encoded value itself.
    DW_EH_PE_pcrel,
    /// Value is relative to the beginning of the .text section.
    DW_EH_PE_textrel,
    /// Value is relative to the beginning of the .got or .eh_frame_hdr
    /// section.
    DW_EH_PE_datarel,
    /// Value is relative to the beginning of the function.
    DW_EH_PE_funcrel,
    /// Value is aligned to an address unit sized boundary.
    DW_EH_PE_aligned,
}

/// Where relative pointers are relative to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PointerBases {
    pub(crate) section_address: u64,
    pub(crate) text: Option<u64>,
    pub(crate) data: Option<u64>,
    pub(crate) func: Option<u64>,
}

impl PointerBases {
    pub(crate) fn new(section: &Section<'_>, layout: &Layout) -> Self {
        Self {
            section_address: section.address,
            text: layout.text_base,
            data: layout.data_base,
            func: None,
        }
    }
}

/// Reads a pointer with the given encoding. `None` for `DW_EH_PE_omit`.
pub(crate) fn read_encoded(
    cursor: &mut Cursor<'_>,
    encoding: Encoding,
    address_size: u8,
    bases: &PointerBases,
) -> Result<Option<u64>> {
    if encoding == Encoding::OMIT {
        return Ok(None);
    }
    if encoding.is_indirect() {
        return Err(Error::malformed_fde("DW_EH_PE_indirect pointers are not supported"));
    }

    let application = encoding.application()?;
    if let ValueApplication::DW_EH_PE_aligned = application {
        cursor.align_to(address_size)?;
    }
    let field_address = bases.section_address.wrapping_add(cursor.offset());

    let value = match encoding.format()? {
        ValueFormat::DW_EH_PE_absptr => cursor.read_address(address_size)?,
        ValueFormat::DW_EH_PE_uleb128 => cursor.read_uleb128()?,
        ValueFormat::DW_EH_PE_udata2 => u64::from(cursor.read_u16()?),
        ValueFormat::DW_EH_PE_udata4 => u64::from(cursor.read_u32()?),
        ValueFormat::DW_EH_PE_udata8 => cursor.read_u64()?,
        ValueFormat::DW_EH_PE_sleb128 => cursor.read_sleb128()? as u64,
        ValueFormat::DW_EH_PE_sdata2 => cursor.read_u16()? as i16 as i64 as u64,
        ValueFormat::DW_EH_PE_sdata4 => cursor.read_u32()? as i32 as i64 as u64,
        ValueFormat::DW_EH_PE_sdata8 => cursor.read_u64()?,
    };

    let base = match application {
        ValueApplication::DW_EH_PE_absptr | ValueApplication::DW_EH_PE_aligned => 0,
        ValueApplication::DW_EH_PE_pcrel => field_address,
        ValueApplication::DW_EH_PE_textrel => bases
            .text
            .ok_or_else(|| Error::malformed_fde("DW_EH_PE_textrel without a text base"))?,
        ValueApplication::DW_EH_PE_datarel => bases
            .data
            .ok_or_else(|| Error::malformed_fde("DW_EH_PE_datarel without a data base"))?,
        ValueApplication::DW_EH_PE_funcrel => bases
            .func
            .ok_or_else(|| Error::malformed_fde("DW_EH_PE_funcrel outside of an FDE"))?,
    };

    let value = base.wrapping_add(value);
    Ok(Some(if address_size < 8 {
        value & ((1u64 << (u32::from(address_size) * 8)) - 1)
    } else {
        value
    }))
}

/// Augmentation data of a CIE with a `z` augmentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AugmentationData {
    /// `L`: encoding of the LSDA pointer in each FDE's augmentation data.
    pub lsda_encoding: Option<Encoding>,
    /// `R`: encoding of the FDE's address fields.
    pub fde_encoding: Option<Encoding>,
    /// `P`: address of the personality routine. Kept, never called.
    pub personality: Option<u64>,
    /// `personality` is the address of a slot holding the routine's address
    /// (`DW_EH_PE_indirect`), not the routine itself.
    pub personality_indirect: bool,
    /// `S`: the FDEs of this CIE describe signal trampolines.
    pub signal_frame: bool,
}

/// Common Information Entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cie<'a> {
    /// Offset of the CIE in its section.
    pub offset: u64,
    pub version: u8,
    /// A null-terminated UTF-8 string that identifies the augmentation to this
    /// CIE or to the FDEs that use it.
    pub augmentation_string: &'a str,
    pub augmentation: Option<AugmentationData>,
    /// Address size of the target, from the CIE (v4) or the module.
    pub address_size: u8,
    /// A constant that is factored out of all advance location instructions.
    /// The resulting value is (operand * code_alignment_factor).
    pub code_alignment_factor: u64,
    /// A constant that is factored out of certain offset instructions.
    /// The resulting value is (operand * data_alignment_factor).
    pub data_alignment_factor: i64,
    /// The column of the rule table that represents the return address of the
    /// function. Note that this column might not correspond to an actual
    /// machine register. Unadjusted.
    pub return_address_register: u64,
    /// A sequence of rules that are interpreted to create the initial setting
    /// of each column in the table.
    pub initial_instructions: &'a [u8],
    /// Section offset of the first initial instruction.
    pub initial_instructions_offset: u64,
}

impl Cie<'_> {
    /// The encoding of the FDE address fields.
    pub fn fde_encoding(&self) -> Encoding {
        self.augmentation
            .and_then(|aug| aug.fde_encoding)
            .unwrap_or(Encoding::ABSPTR)
    }

    pub fn is_signal_frame(&self) -> bool {
        self.augmentation.is_some_and(|aug| aug.signal_frame)
    }
}

/// Frame Description Entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fde<'a> {
    /// Offset of the FDE in its section.
    pub offset: u64,
    /// Offset of the CIE this FDE belongs to.
    pub cie_offset: u64,
    /// The address of the first location associated with this table entry.
    pub initial_location: u64,
    /// The number of bytes of program instructions described by this entry.
    pub address_range: u64,
    /// Language specific data area, from the FDE's augmentation data.
    pub lsda: Option<u64>,
    /// A sequence of table defining instructions.
    pub instructions: &'a [u8],
    /// Section offset of the first instruction.
    pub instructions_offset: u64,
}

impl Fde<'_> {
    pub fn end(&self) -> u64 {
        self.initial_location.wrapping_add(self.address_range)
    }

    pub fn contains(&self, pc: u64) -> bool {
        self.initial_location <= pc && pc < self.end()
    }
}

/// The length/id prelude shared by CIEs and FDEs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryHeader<'a> {
    pub(crate) offset: u64,
    /// For a CIE the CIE id, for an FDE the raw CIE pointer.
    pub(crate) id: u64,
    /// Section offset of the id field, the base of `.eh_frame` CIE pointers.
    pub(crate) id_offset: u64,
    pub(crate) is_dwarf64: bool,
    /// Everything after the id field.
    pub(crate) body: Cursor<'a>,
    /// Where the next entry starts.
    pub(crate) next: u64,
}

impl EntryHeader<'_> {
    pub(crate) fn is_cie(&self, kind: SectionKind) -> bool {
        match kind {
            SectionKind::EhFrame => self.id == 0,
            SectionKind::DebugFrame if self.is_dwarf64 => self.id == u64::MAX,
            SectionKind::DebugFrame => self.id == u64::from(u32::MAX),
        }
    }

    /// Offset of the CIE an FDE points at.
    pub(crate) fn cie_offset(&self, kind: SectionKind) -> Result<u64> {
        match kind {
            SectionKind::DebugFrame => Ok(self.id),
            SectionKind::EhFrame => self.id_offset.checked_sub(self.id).ok_or_else(|| {
                Error::malformed_fde(format!("CIE pointer {:#x} points before the section", self.id))
            }),
        }
    }
}

/// Reads the entry header at `offset`. `Ok(None)` at the end of the section
/// or at an `.eh_frame` zero terminator.
pub(crate) fn parse_entry_header<'a>(
    section: &Section<'a>,
    endian: Endian,
    offset: u64,
) -> Result<Option<EntryHeader<'a>>> {
    let start = usize::try_from(offset)
        .ok()
        .filter(|&start| start <= section.data.len())
        .ok_or_else(|| Error::malformed_fde(format!("entry offset {offset:#x} out of bounds")))?;
    let mut cursor = Cursor::new(&section.data[start..], offset, endian);
    if cursor.is_empty() {
        return Ok(None);
    }

    let mut length = u64::from(cursor.read_u32()?);
    let is_dwarf64 = length == u64::from(u32::MAX);
    if is_dwarf64 {
        length = cursor.read_u64()?;
    }
    if length == 0 {
        trace!("zero terminator at {offset:#x}");
        return Ok(None);
    }

    let length = usize::try_from(length)
        .ok()
        .filter(|&len| len <= cursor.rest().len())
        .ok_or_else(|| {
            Error::malformed_fde(format!(
                "entry at {offset:#x} has length {length:#x} running past the section end"
            ))
        })?;
    let content_offset = cursor.offset();
    let mut body = Cursor::new(cursor.read_bytes(length)?, content_offset, endian);
    let next = cursor.offset();

    let id_offset = body.offset();
    let id = match (is_dwarf64, section.kind) {
        (true, SectionKind::DebugFrame) => body.read_u64()?,
        _ => u64::from(body.read_u32()?),
    };

    Ok(Some(EntryHeader {
        offset,
        id,
        id_offset,
        is_dwarf64,
        body,
        next,
    }))
}

#[instrument(level = "trace", skip(header, section, layout), fields(offset = header.offset))]
pub(crate) fn parse_cie<'a>(
    header: &EntryHeader<'a>,
    section: &Section<'a>,
    layout: &Layout,
) -> Result<Cie<'a>> {
    if !header.is_cie(section.kind) {
        return Err(Error::malformed_cie(format!(
            "entry at {:#x} is not a CIE",
            header.offset
        )));
    }

    let mut body = header.body;
    let data = &mut body;
    let version = data.read_u8()?;
    let version_ok = match section.kind {
        SectionKind::EhFrame => matches!(version, 1 | 3),
        SectionKind::DebugFrame => matches!(version, 1 | 3 | 4),
    };
    if !version_ok {
        return Err(Error::malformed_cie(format!("unsupported CIE version {version}")));
    }

    let augmentation_string = data.read_utf8_cstr()?;

    // Old GCC: an address sized pointer to exception handling data follows
    // the augmentation string.
    if augmentation_string.starts_with("eh") {
        data.read_bytes(usize::from(layout.address_size))?;
    }

    let mut address_size = layout.address_size;
    if version == 4 {
        address_size = data.read_u8()?;
        if !matches!(address_size, 2 | 4 | 8) {
            return Err(Error::malformed_cie(format!(
                "unsupported address size {address_size}"
            )));
        }
        let segment_size = data.read_u8()?;
        if segment_size != 0 {
            return Err(Error::malformed_cie(format!(
                "segment selectors are not supported (size {segment_size})"
            )));
        }
    }

    let code_alignment_factor = data.read_uleb128()?;
    if code_alignment_factor == 0 {
        return Err(Error::malformed_cie("code alignment factor is zero"));
    }
    let data_alignment_factor = data.read_sleb128()?;
    if data_alignment_factor == 0 {
        return Err(Error::malformed_cie("data alignment factor is zero"));
    }
    let return_address_register = if version == 1 {
        u64::from(data.read_u8()?)
    } else {
        data.read_uleb128()?
    };

    let augmentation = if augmentation_string.starts_with('z') {
        let aug_data = data.read_block()?;
        let bases = PointerBases::new(section, layout);
        let aug_offset = data.offset() - aug_data.len() as u64;
        let mut aug_cursor = Cursor::new(aug_data, aug_offset, data.endian);
        Some(parse_augmentation_data(
            augmentation_string,
            &mut aug_cursor,
            address_size,
            &bases,
        )?)
    } else if augmentation_string.is_empty() || augmentation_string.starts_with("eh") {
        None
    } else {
        // Without `z` there is no length to skip what we don't understand.
        return Err(Error::malformed_cie(format!(
            "unknown augmentation {augmentation_string:?}"
        )));
    };

    let cie = Cie {
        offset: header.offset,
        version,
        augmentation_string,
        augmentation,
        address_size,
        code_alignment_factor,
        data_alignment_factor,
        return_address_register,
        initial_instructions: data.rest(),
        initial_instructions_offset: data.offset(),
    };

    trace!("{cie:?}");
    Ok(cie)
}

fn parse_augmentation_data(
    string: &str,
    data: &mut Cursor<'_>,
    address_size: u8,
    bases: &PointerBases,
) -> Result<AugmentationData> {
    trace!("aug data {:?} | {:x?}", string, data.rest());

    let mut aug_data = AugmentationData::default();

    for code in string.bytes().skip(1) {
        match code {
            // A 1 byte pointer encoding for the LSDA pointer found in every
            // FDE's augmentation data.
            b'L' => aug_data.lsda_encoding = Some(Encoding(data.read_u8()?)),
            // A pointer encoding followed by the personality routine's
            // address in that encoding.
            b'P' => {
                let encoding = Encoding(data.read_u8()?);
                aug_data.personality_indirect = encoding.is_indirect();
                aug_data.personality = read_encoded(data, encoding.direct(), address_size, bases)?;
            }
            // A 1 byte pointer encoding for the address fields of the FDE.
            b'R' => aug_data.fde_encoding = Some(Encoding(data.read_u8()?)),
            // No data, the FDEs describe signal trampolines.
            b'S' => aug_data.signal_frame = true,
            _ => {
                // The `z` length lets us ignore the rest safely.
                debug!("unknown augmentation {:?} in {string:?}, skipping the rest", code as char);
                break;
            }
        }
    }

    Ok(aug_data)
}

#[instrument(level = "trace", skip_all, fields(offset = header.offset, cie = cie.offset))]
pub(crate) fn parse_fde<'a>(
    header: &EntryHeader<'a>,
    cie: &Cie<'_>,
    section: &Section<'a>,
    layout: &Layout,
) -> Result<Fde<'a>> {
    let mut body = header.body;
    let data = &mut body;
    let mut bases = PointerBases::new(section, layout);
    let encoding = cie.fde_encoding();

    let initial_location = read_encoded(data, encoding, cie.address_size, &bases)?
        .ok_or_else(|| Error::malformed_fde("FDE initial location is omitted"))?;
    let address_range = read_encoded(data, encoding.format_only(), cie.address_size, &bases)?
        .ok_or_else(|| Error::malformed_fde("FDE address range is omitted"))?;
    bases.func = Some(initial_location);

    let mut lsda = None;
    if let Some(aug) = cie.augmentation {
        let aug_data = data.read_block()?;
        let aug_offset = data.offset() - aug_data.len() as u64;
        if let Some(lsda_encoding) = aug.lsda_encoding {
            let mut aug_cursor = Cursor::new(aug_data, aug_offset, data.endian);
            lsda = read_encoded(&mut aug_cursor, lsda_encoding.direct(), cie.address_size, &bases)?;
        }
    }

    let fde = Fde {
        offset: header.offset,
        cie_offset: cie.offset,
        initial_location,
        address_range,
        lsda,
        instructions: data.rest(),
        instructions_offset: data.offset(),
    };
    trace!("{fde:?}");
    Ok(fde)
}
