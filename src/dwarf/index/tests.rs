use similar_asserts::assert_eq;

use super::*;
use crate::dwarf::testutil::{module, CfiBuilder, CieSpec, DW_EH_PE_pcrel_sdata4};

fn cie() -> CieSpec<'static> {
    CieSpec {
        instructions: &[0x0c, 7, 8],
        ..Default::default()
    }
}

fn found(index: &CfiIndex<'_>, pc: u64) -> Option<u64> {
    index.find(pc).map(|entry| entry.fde.offset)
}

#[test]
fn overlapping_fdes_last_inserted_wins() {
    let mut b = CfiBuilder::new(SectionKind::DebugFrame, 0);
    let c = b.cie(&cie());
    let first = b.fde(c, 0x1000, 0x100, &[]);
    let second = b.fde(c, 0x1080, 0x100, &[]);
    let data = b.finish();
    let index = build_cfi_index(&module("overlap", None, Some(&data[..])));

    assert_eq!(index.len(), 2);
    assert_eq!(found(&index, 0x1000), Some(first));
    assert_eq!(found(&index, 0x107f), Some(first));
    assert_eq!(found(&index, 0x1080), Some(second));
    assert_eq!(found(&index, 0x10ff), Some(second));
    assert_eq!(found(&index, 0x1100), Some(second));
    assert_eq!(found(&index, 0x1180), None);
    assert_eq!(found(&index, 0xfff), None);
}

#[test]
fn long_fde_is_found_past_later_ones() {
    let mut b = CfiBuilder::new(SectionKind::DebugFrame, 0);
    let c = b.cie(&cie());
    let outer = b.fde(c, 0x1000, 0x2000, &[]);
    let inner = b.fde(c, 0x1100, 0x100, &[]);
    let late = b.fde(c, 0x2000, 0x100, &[]);
    let data = b.finish();
    let index = build_cfi_index(&module("nested", None, Some(&data[..])));

    assert_eq!(found(&index, 0x1050), Some(outer));
    assert_eq!(found(&index, 0x1150), Some(inner));
    assert_eq!(found(&index, 0x1250), Some(outer));
    assert_eq!(found(&index, 0x2050), Some(late));
    assert_eq!(found(&index, 0x2800), Some(outer));
    assert_eq!(found(&index, 0x3000), None);
}

#[test]
fn debug_frame_wins_over_eh_frame() {
    let mut eh = CfiBuilder::new(SectionKind::EhFrame, 0x8000);
    let c = eh.cie(&CieSpec {
        augmentation: "zR",
        fde_encoding: DW_EH_PE_pcrel_sdata4,
        ..cie()
    });
    eh.fde(c, 0x1000, 0x100, &[]);
    eh.fde(c, 0x2000, 0x100, &[]);
    let eh = eh.finish();

    let mut debug = CfiBuilder::new(SectionKind::DebugFrame, 0);
    let c = debug.cie(&cie());
    debug.fde(c, 0x1000, 0x100, &[]);
    let debug = debug.finish();

    let index = build_cfi_index(&module("both", Some((&eh[..], 0x8000)), Some(&debug[..])));
    assert_eq!(index.len(), 3);
    assert_eq!(index.find(0x1010).map(|entry| entry.kind), Some(SectionKind::DebugFrame));
    assert_eq!(index.find(0x2010).map(|entry| entry.kind), Some(SectionKind::EhFrame));
}

#[test]
fn malformed_cie_drops_its_fdes_only() {
    let mut b = CfiBuilder::new(SectionKind::DebugFrame, 0);
    let bad = b.cie(&CieSpec {
        code_alignment_factor: 0,
        ..cie()
    });
    b.fde(bad, 0x1000, 0x100, &[]);
    let good = b.cie(&cie());
    let kept = b.fde(good, 0x2000, 0x100, &[]);
    b.fde(bad, 0x3000, 0x100, &[]);
    let data = b.finish();
    let index = build_cfi_index(&module("broken", None, Some(&data[..])));

    assert_eq!(index.len(), 1);
    assert_eq!(index.dropped(), 3);
    assert_eq!(found(&index, 0x1010), None);
    assert_eq!(found(&index, 0x2010), Some(kept));
    assert_eq!(found(&index, 0x3010), None);
}

#[test]
fn bad_length_stops_the_section() {
    let mut b = CfiBuilder::new(SectionKind::DebugFrame, 0);
    let c = b.cie(&cie());
    let kept = b.fde(c, 0x1000, 0x100, &[]);
    let mut data = b.finish();
    // An entry claiming far more bytes than there are.
    data.extend_from_slice(&[0xf0, 0xff, 0, 0, 0, 0, 0, 0]);
    let index = build_cfi_index(&module("truncated", None, Some(&data[..])));

    assert_eq!(index.len(), 1);
    assert_eq!(index.dropped(), 1);
    assert_eq!(found(&index, 0x1010), Some(kept));
}

#[test]
fn empty_fdes_are_not_indexed() {
    let mut b = CfiBuilder::new(SectionKind::DebugFrame, 0);
    let c = b.cie(&cie());
    b.fde(c, 0x1000, 0, &[]);
    let data = b.finish();
    let index = build_cfi_index(&module("empty", None, Some(&data[..])));

    assert!(index.is_empty());
    assert_eq!(index.dropped(), 0);
}

#[test]
fn load_bias_is_applied() {
    let mut eh = CfiBuilder::new(SectionKind::EhFrame, 0x8000);
    let c = eh.cie(&CieSpec {
        augmentation: "zR",
        fde_encoding: DW_EH_PE_pcrel_sdata4,
        ..cie()
    });
    eh.fde(c, 0x1000, 0x100, &[]);
    let eh = eh.finish();

    let mut shifted = module("shifted", Some((&eh[..], 0x8000)), None);
    shifted.bias = 0x10000;
    let index = build_cfi_index(&shifted);

    assert_eq!(found(&index, 0x1010), None);
    let entry = index.find(0x11010).unwrap();
    assert_eq!(entry.fde.initial_location, 0x1000);
    assert_eq!(entry.start(), 0x11000);
    assert_eq!(entry.end(), 0x11100);
}

#[test]
fn most_recent_module_wins() {
    // Same range, told apart by their return address column.
    let section = |ra| {
        let mut b = CfiBuilder::new(SectionKind::DebugFrame, 0);
        let c = b.cie(&CieSpec {
            return_address_register: ra,
            ..cie()
        });
        b.fde(c, 0x1000, 0x100, &[]);
        b.finish()
    };
    let first = section(16);
    let second = section(15);
    let ra = |table: &CfiTable<'_>| table.find(0x1010).map(|entry| entry.cie.return_address_register);

    let mut table = CfiTable::new();
    table.load(&module("first", None, Some(&first[..])));
    table.load(&module("second", None, Some(&second[..])));
    assert_eq!(table.modules().count(), 2);
    assert_eq!(ra(&table), Some(15));

    assert!(table.unload("second").is_some());
    assert_eq!(ra(&table), Some(16));
    assert!(table.unload("second").is_none());

    table.unload("first");
    assert_eq!(ra(&table), None);
}

#[test]
fn indirect_personality_keeps_its_fdes() {
    #[rustfmt::skip]
    let data = [
        24, 0, 0, 0, 0, 0, 0, 0, 1,
        b'z', b'P', b'L', b'R', 0,
        1, 0x78, 0x10,
        7, 0x9b, 0x00, 0x01, 0, 0, 0x1b, 0x1b,
        0x0c, 7, 8,
        20, 0, 0, 0, 32, 0, 0, 0,
        0xdc, 0x0f, 0, 0, 0x40, 0, 0, 0,
        4, 0x10, 0, 0, 0,
        0, 0, 0,
    ];
    let index = build_cfi_index(&module("cxx", Some((&data[..], 0x1000)), None));

    assert_eq!(index.len(), 1);
    assert_eq!(index.dropped(), 0);
    assert_eq!(found(&index, 0x2000), Some(28));
    assert_eq!(index.find(0x2000).and_then(|entry| entry.fde.lsda), Some(0x103d));
    assert_eq!(found(&index, 0x2040), None);
}
