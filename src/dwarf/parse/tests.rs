use similar_asserts::assert_eq;

use super::*;
use crate::dwarf::testutil::layout;
use crate::error::ErrorKind;

fn section(kind: SectionKind, data: &[u8], address: u64) -> Section<'_> {
    Section {
        kind,
        data,
        address,
    }
}

fn header_at<'a>(section: &Section<'a>, offset: u64) -> EntryHeader<'a> {
    parse_entry_header(section, Endian::Little, offset)
        .unwrap()
        .expect("no entry")
}

#[test]
fn parse_simple_cie() {
    #[rustfmt::skip]
    let data = [
        0x14, 0, 0, 0,
        0, 0, 0, 0, 1,
        0x7a, 0x52, 0, 1,
        0x78, 0x10, 1,
        0x1b, 0xc, 7, 8,
        0x90, 1, 0, 0,
    ];
    let section = section(SectionKind::EhFrame, &data, 0);
    let header = header_at(&section, 0);
    assert!(header.is_cie(SectionKind::EhFrame));

    let cie = parse_cie(&header, &section, &layout()).unwrap();

    assert_eq!(
        cie,
        Cie {
            offset: 0,
            version: 1,
            augmentation_string: "zR",
            augmentation: Some(AugmentationData {
                fde_encoding: Some(Encoding(0x1b)),
                ..Default::default()
            }),
            address_size: 8,
            code_alignment_factor: 1,
            data_alignment_factor: -8,
            return_address_register: 16,
            initial_instructions: &[0xc, 7, 8, 0x90, 1, 0, 0],
            initial_instructions_offset: 17,
        }
    );

    // llvm-dwarfdump output:
    /*
    00000000 00000014 00000000 CIE
    Format:                DWARF32
    Version:               1
    Augmentation:          "zR"
    Code alignment factor: 1
    Data alignment factor: -8
    Return address column: 16
    Augmentation data:     1B

    DW_CFA_def_cfa: RSP +8
    DW_CFA_offset: RIP -8
    DW_CFA_nop:
    DW_CFA_nop:

    CFA=RSP+8: RIP=[CFA-8]
    */
}

#[test]
fn parse_pcrel_fde() {
    #[rustfmt::skip]
    let data = [
        // the CIE from above
        0x14, 0, 0, 0,
        0, 0, 0, 0, 1,
        0x7a, 0x52, 0, 1,
        0x78, 0x10, 1,
        0x1b, 0xc, 7, 8,
        0x90, 1, 0, 0,
        // FDE
        0x14, 0, 0, 0,
        0x1c, 0, 0, 0,          // CIE pointer: 0x1c bytes back
        0xe0, 0xef, 0xff, 0xff, // pc begin: 0x2020 - 0x1020
        0x10, 0, 0, 0,          // pc range
        0,                      // augmentation data length
        0x41, 0x0e, 0x10, 0, 0, 0, 0,
        // terminator
        0, 0, 0, 0,
    ];
    let section = section(SectionKind::EhFrame, &data, 0x2000);
    let cie = parse_cie(&header_at(&section, 0), &section, &layout()).unwrap();

    let header = header_at(&section, 24);
    assert!(!header.is_cie(SectionKind::EhFrame));
    assert_eq!(header.cie_offset(SectionKind::EhFrame), Ok(0));
    assert!(parse_entry_header(&section, Endian::Little, header.next)
        .unwrap()
        .is_none());

    let fde = parse_fde(&header, &cie, &section, &layout()).unwrap();
    assert_eq!(
        fde,
        Fde {
            offset: 24,
            cie_offset: 0,
            initial_location: 0x1000,
            address_range: 0x10,
            lsda: None,
            instructions: &[0x41, 0x0e, 0x10, 0, 0, 0, 0],
            instructions_offset: 41,
        }
    );
    assert!(fde.contains(0x100f));
    assert!(!fde.contains(0x1010));

    // llvm-dwarfdump output:
    /*
    00000018 00000014 0000001c FDE cie=00000000 pc=00001000...00001010
    Format:       DWARF32
    DW_CFA_advance_loc: 1
    DW_CFA_def_cfa_offset: +16
    DW_CFA_nop:
    DW_CFA_nop:
    DW_CFA_nop:
    DW_CFA_nop:
    */
}

#[test]
fn parse_dwarf64_debug_frame() {
    #[rustfmt::skip]
    let data = [
        // CIE
        0xff, 0xff, 0xff, 0xff,
        18, 0, 0, 0, 0, 0, 0, 0,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        4,          // version
        0,          // augmentation
        8, 0,       // address size, segment selector size
        1, 0x78, 0x10,
        0x0c, 7, 8,
        // FDE
        0xff, 0xff, 0xff, 0xff,
        27, 0, 0, 0, 0, 0, 0, 0,
        0, 0, 0, 0, 0, 0, 0, 0,             // CIE pointer
        0x00, 0x40, 0, 0, 0, 0, 0, 0,       // pc begin
        0x20, 0, 0, 0, 0, 0, 0, 0,          // pc range
        0x41, 0x86, 0x02,
    ];
    let section = section(SectionKind::DebugFrame, &data, 0);

    let header = header_at(&section, 0);
    assert!(header.is_dwarf64);
    assert!(header.is_cie(SectionKind::DebugFrame));
    let cie = parse_cie(&header, &section, &layout()).unwrap();
    assert_eq!(cie.version, 4);
    assert_eq!(cie.address_size, 8);
    assert_eq!(cie.return_address_register, 16);
    assert_eq!(cie.initial_instructions, &[0x0c, 7, 8][..]);

    let header = header_at(&section, header.next);
    assert_eq!(header.offset, 30);
    assert!(!header.is_cie(SectionKind::DebugFrame));
    assert_eq!(header.cie_offset(SectionKind::DebugFrame), Ok(0));
    let fde = parse_fde(&header, &cie, &section, &layout()).unwrap();
    assert_eq!(fde.initial_location, 0x4000);
    assert_eq!(fde.address_range, 0x20);
    assert_eq!(fde.instructions, &[0x41, 0x86, 0x02][..]);
}

#[test]
fn parse_full_augmentation() {
    #[rustfmt::skip]
    let data = [
        // CIE
        28, 0, 0, 0,
        0, 0, 0, 0,
        1,
        b'z', b'P', b'L', b'R', b'S', 0,
        1, 0x78, 0x10,
        11,                                     // augmentation data length
        0x00, 0x00, 0x50, 0, 0, 0, 0, 0, 0,     // personality, absptr
        0x00,                                   // LSDA encoding, absptr
        0x03,                                   // FDE encoding, udata4
        0, 0,
        // FDE
        24, 0, 0, 0,
        36, 0, 0, 0,
        0x00, 0x10, 0, 0,                       // pc begin
        0x40, 0, 0, 0,                          // pc range
        8,                                      // augmentation data length
        0x00, 0x60, 0, 0, 0, 0, 0, 0,           // LSDA
        0, 0, 0,
        0, 0, 0, 0,
    ];
    let section = section(SectionKind::EhFrame, &data, 0);
    let cie = parse_cie(&header_at(&section, 0), &section, &layout()).unwrap();
    assert_eq!(
        cie.augmentation,
        Some(AugmentationData {
            lsda_encoding: Some(Encoding::ABSPTR),
            fde_encoding: Some(Encoding(0x03)),
            personality: Some(0x5000),
            personality_indirect: false,
            signal_frame: true,
        })
    );
    assert!(cie.is_signal_frame());

    let fde = parse_fde(&header_at(&section, 32), &cie, &section, &layout()).unwrap();
    assert_eq!(fde.initial_location, 0x1000);
    assert_eq!(fde.address_range, 0x40);
    assert_eq!(fde.lsda, Some(0x6000));
}

#[test]
fn indirect_personality_is_kept_unread() {
    #[rustfmt::skip]
    let data = [
        // CIE
        24, 0, 0, 0,
        0, 0, 0, 0,
        1,
        b'z', b'P', b'L', b'R', 0,
        1, 0x78, 0x10,
        7,                                      // augmentation data length
        0x9b, 0x00, 0x01, 0, 0,                 // personality, indirect pcrel sdata4
        0x1b,                                   // LSDA encoding, pcrel sdata4
        0x1b,                                   // FDE encoding, pcrel sdata4
        0x0c, 7, 8,
        // FDE
        20, 0, 0, 0,
        32, 0, 0, 0,
        0xdc, 0x0f, 0, 0,                       // pc begin, 0x2000
        0x40, 0, 0, 0,                          // pc range
        4,                                      // augmentation data length
        0x10, 0, 0, 0,                          // LSDA
        0, 0, 0,
    ];
    let section = section(SectionKind::EhFrame, &data, 0x1000);
    let cie = parse_cie(&header_at(&section, 0), &section, &layout()).unwrap();
    assert_eq!(
        cie.augmentation,
        Some(AugmentationData {
            lsda_encoding: Some(Encoding(0x1b)),
            fde_encoding: Some(Encoding(0x1b)),
            // Address of the slot, 0x1000 + 19 + 0x100.
            personality: Some(0x1113),
            personality_indirect: true,
            signal_frame: false,
        })
    );

    let fde = parse_fde(&header_at(&section, 28), &cie, &section, &layout()).unwrap();
    assert_eq!(fde.initial_location, 0x2000);
    assert_eq!(fde.lsda, Some(0x103d));

    // Only the `P` and `L` pointers may be indirect.
    assert!(Encoding(0x9b).is_indirect());
    assert!(!Encoding::OMIT.is_indirect());
}

#[test]
fn eh_augmentation_skips_the_eh_data_pointer() {
    for augmentation in ["eh", "ehx"] {
        let mut data = Vec::from([0u8; 8]);
        data.push(1);
        data.extend(augmentation.bytes());
        data.push(0);
        data.extend(0xdead_beef_u64.to_le_bytes());
        data.extend([1, 0x78, 0x10, 0x0c, 7, 8]);
        let length = u32::try_from(data.len() - 4).unwrap();
        data[..4].copy_from_slice(&length.to_le_bytes());

        let section = section(SectionKind::EhFrame, &data, 0);
        let cie = parse_cie(&header_at(&section, 0), &section, &layout()).unwrap();
        assert_eq!(cie.augmentation_string, augmentation);
        assert_eq!(cie.augmentation, None);
        assert_eq!(cie.return_address_register, 16);
        assert_eq!(cie.initial_instructions, &[0x0c, 7, 8][..]);
    }
}

fn cie_error(data: &[u8]) -> ErrorKind {
    let section = section(SectionKind::DebugFrame, data, 0);
    let header = header_at(&section, 0);
    parse_cie(&header, &section, &layout())
        .expect_err("CIE should be rejected")
        .kind()
}

#[test]
fn reject_malformed_cies() {
    #[rustfmt::skip]
    let zero_code_alignment = [
        12, 0, 0, 0,
        0xff, 0xff, 0xff, 0xff,
        1, 0, 0, 0x78, 0x10, 0, 0, 0,
    ];
    assert_eq!(cie_error(&zero_code_alignment), ErrorKind::MalformedCie);

    #[rustfmt::skip]
    let zero_data_alignment = [
        12, 0, 0, 0,
        0xff, 0xff, 0xff, 0xff,
        1, 0, 1, 0, 0x10, 0, 0, 0,
    ];
    assert_eq!(cie_error(&zero_data_alignment), ErrorKind::MalformedCie);

    #[rustfmt::skip]
    let unknown_augmentation = [
        12, 0, 0, 0,
        0xff, 0xff, 0xff, 0xff,
        1, b'x', 0, 1, 0x78, 0x10, 0, 0,
    ];
    assert_eq!(cie_error(&unknown_augmentation), ErrorKind::MalformedCie);

    #[rustfmt::skip]
    let bad_version = [
        12, 0, 0, 0,
        0xff, 0xff, 0xff, 0xff,
        2, 0, 1, 0x78, 0x10, 0, 0, 0,
    ];
    assert_eq!(cie_error(&bad_version), ErrorKind::MalformedCie);

    #[rustfmt::skip]
    let segmented = [
        12, 0, 0, 0,
        0xff, 0xff, 0xff, 0xff,
        4, 0, 8, 4, 1, 0x78, 0x10, 0,
    ];
    assert_eq!(cie_error(&segmented), ErrorKind::MalformedCie);
}

#[test]
fn reject_length_past_the_end() {
    let data = [0x40, 0, 0, 0, 0xff, 0xff, 0xff, 0xff, 1, 0];
    let section = section(SectionKind::DebugFrame, &data, 0);
    let err = parse_entry_header(&section, Endian::Little, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedFde);

    // An offset outside the section, e.g. from a bogus CIE pointer.
    assert!(parse_entry_header(&section, Endian::Little, 0x100).is_err());
}

#[test]
fn read_leb128() {
    let data = [0xe5, 0x8e, 0x26, 0x7e, 0x80, 0x7f];
    let mut cursor = Cursor::new(&data, 0, Endian::Little);
    assert_eq!(cursor.read_uleb128(), Ok(624485));
    assert_eq!(cursor.read_sleb128(), Ok(-2));
    assert_eq!(cursor.read_sleb128(), Ok(-128));
    assert!(cursor.is_empty());
    assert!(cursor.read_uleb128().is_err());

    let too_long = [0xff; 11];
    let mut cursor = Cursor::new(&too_long, 0, Endian::Little);
    assert!(cursor.read_uleb128().is_err());
}

#[test]
fn read_big_endian() {
    let data = [0x12, 0x34, 0x56, 0x78];
    let mut cursor = Cursor::new(&data, 0, Endian::Big);
    assert_eq!(cursor.read_u16(), Ok(0x1234));
    let mut cursor = Cursor::new(&data, 0, Endian::Big);
    assert_eq!(cursor.read_address(4), Ok(0x12345678));
}

#[test]
fn read_encoded_pointers() {
    let bases = PointerBases {
        section_address: 0x1000,
        text: Some(0x4000),
        data: Some(0x8000),
        func: None,
    };
    let data = [0x10, 0, 0, 0, 0x7c];

    let read = |encoding: u8, data: &[u8]| {
        let mut cursor = Cursor::new(data, 0x20, Endian::Little);
        read_encoded(&mut cursor, Encoding(encoding), 8, &bases)
    };

    // DW_EH_PE_udata4
    assert_eq!(read(0x03, &data), Ok(Some(0x10)));
    // DW_EH_PE_pcrel | DW_EH_PE_udata4, relative to section address + offset
    assert_eq!(read(0x13, &data), Ok(Some(0x1030)));
    // DW_EH_PE_textrel | DW_EH_PE_udata2
    assert_eq!(read(0x22, &data), Ok(Some(0x4010)));
    // DW_EH_PE_datarel | DW_EH_PE_sleb128
    assert_eq!(read(0x39, &data[4..]), Ok(Some(0x7ffc)));
    // DW_EH_PE_omit
    assert_eq!(read(0xff, &data), Ok(None));

    // DW_EH_PE_funcrel outside of an FDE
    assert!(read(0x43, &data).is_err());
    // DW_EH_PE_indirect
    assert!(read(0x83, &data).is_err());
    // no such format
    assert!(read(0x05, &data).is_err());
}
