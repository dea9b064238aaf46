use std::fs;
use std::io::Write as _;

use anyhow::Result;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use object::write::Object;
use object::{Architecture, BinaryFormat, Endianness, SectionKind};
use rdwarf::sections::{self, DebugSections};
use rdwarf::{frame, line, Endian, SectionError};

fn make_elf(section_list: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    for (name, data) in section_list {
        let id = obj.add_section(Vec::new(), name.as_bytes().to_vec(), SectionKind::Debug);
        obj.set_section_data(id, data.clone(), 1);
    }
    obj.write().unwrap()
}

/// GNU compressed-debug layout: "ZLIB", big-endian inflated size, stream.
fn zlib_wrap(payload: &[u8]) -> Vec<u8> {
    let mut out = b"ZLIB".to_vec();
    out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(payload).unwrap();
    out.extend_from_slice(&enc.finish().unwrap());
    out
}

fn with_length(body: Vec<u8>) -> Vec<u8> {
    let mut out = (body.len() as u32).to_le_bytes().to_vec();
    out.extend_from_slice(&body);
    out
}

/// One DWARF 4 line program: main.c, a row at 0x1000, sequence end 0x1008.
fn line_unit() -> Vec<u8> {
    let mut tables = vec![
        1, 1, 1, 0xfb, 14, 13, // min_instr, max_ops, is_stmt, -5, 14, opcode_base
        0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1, // standard opcode lengths
        0, // no directories
    ];
    tables.extend_from_slice(b"main.c\0");
    tables.extend_from_slice(&[0, 0, 0]); // dir, mtime, length
    tables.push(0);

    let mut program = vec![0x00, 0x09, 0x02]; // set_address
    program.extend_from_slice(&0x1000u64.to_le_bytes());
    program.extend_from_slice(&[0x01, 0x02, 0x08, 0x00, 0x01, 0x01]); // copy, advance_pc 8, end

    let mut body = 4u16.to_le_bytes().to_vec();
    body.extend_from_slice(&(tables.len() as u32).to_le_bytes());
    body.extend_from_slice(&tables);
    body.extend_from_slice(&program);
    with_length(body)
}

/// One CIE and one FDE covering 0x1000..0x1020.
fn frame_section() -> Vec<u8> {
    let cie = vec![
        0xff, 0xff, 0xff, 0xff, // CIE id
        3, 0, // version, empty augmentation
        0x01, 0x78, 0x10, // code 1, data -8, return address register 16
        0x0c, 0x07, 0x08, // def_cfa rsp+8
    ];
    let mut fde = vec![0, 0, 0, 0]; // CIE at offset 0
    fde.extend_from_slice(&0x1000u64.to_le_bytes());
    fde.extend_from_slice(&0x20u64.to_le_bytes());
    [with_length(cie), with_length(fde)].concat()
}

#[test]
fn finds_sections_under_either_spelling() -> Result<()> {
    let payload = b"line bytes".to_vec();
    let elf = make_elf(&[
        (".debug_line", payload.clone()),
        (".zdebug_info", zlib_wrap(b"inflated info")),
        (".zdebug_abbrev", b"short".to_vec()), // no ZLIB magic: passthrough
    ]);
    let file = object::File::parse(elf.as_slice())?;

    assert_eq!(sections::debug_section(&file, "line")?, payload);
    assert_eq!(sections::debug_section(&file, "info")?, b"inflated info");
    assert_eq!(sections::debug_section(&file, "abbrev")?, b"short");
    assert!(matches!(
        sections::debug_section(&file, "frame"),
        Err(SectionError::Missing(name)) if name == "frame"
    ));
    Ok(())
}

#[test]
fn size_header_lies_are_tolerated() -> Result<()> {
    let mut lying = zlib_wrap(b"four");
    lying[4..12].copy_from_slice(&999u64.to_be_bytes());
    let elf = make_elf(&[(".zdebug_loc", lying)]);
    let file = object::File::parse(elf.as_slice())?;

    assert_eq!(sections::debug_section(&file, "loc")?, b"four");
    Ok(())
}

#[test]
fn compressed_line_sections_decode_to_the_same_rows() -> Result<()> {
    let plain = make_elf(&[(".debug_line", line_unit())]);
    let squeezed = make_elf(&[(".zdebug_line", zlib_wrap(&line_unit()))]);

    let plain_bytes =
        sections::debug_section(&object::File::parse(plain.as_slice())?, "line")?;
    let squeezed_bytes =
        sections::debug_section(&object::File::parse(squeezed.as_slice())?, "line")?;
    assert_eq!(plain_bytes, squeezed_bytes);

    let rows = line::parse_all(&squeezed_bytes, &[], 0, true, 8)[0].rows()?;
    assert_eq!(rows.len(), 2);
    assert_eq!((rows[0].address, rows[0].line), (0x1000, 1));
    Ok(())
}

#[test]
fn bundles_every_debug_section() -> Result<()> {
    let elf = make_elf(&[
        (".debug_line", line_unit()),
        (".debug_frame", frame_section()),
        (".eh_frame", vec![0, 0, 0, 0]),
    ]);
    let bundle = DebugSections::from_bytes(&elf)?;

    assert!(bundle.line.is_some());
    assert!(bundle.frame.is_some());
    assert_eq!(bundle.eh_frame.as_deref(), Some(&[0u8, 0, 0, 0][..]));
    assert_eq!(bundle.eh_frame_addr, 0); // relocatable object, never loaded
    assert!(bundle.info.is_none());
    assert!(bundle.ranges.is_none());
    assert!(bundle.pubnames.is_none());
    Ok(())
}

#[test]
fn decodes_straight_from_a_binary() -> Result<()> {
    let elf = make_elf(&[
        (".debug_line", line_unit()),
        (".debug_frame", frame_section()),
    ]);
    let path = std::env::temp_dir().join(format!("rdwarf-sections-{}.o", std::process::id()));
    fs::write(&path, &elf)?;
    let bundle = DebugSections::load(&path)?;
    fs::remove_file(&path)?;

    let units = line::parse_all(bundle.line.as_deref().unwrap_or(&[]), &[], 0, true, 8);
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].pc_to_line(0, 0x1004), Some(("main.c".to_string(), 1)));

    let fdes = frame::parse(
        bundle.frame.as_deref().unwrap_or(&[]),
        Endian::Little,
        0,
        8,
        0,
    )?;
    assert!(fdes.fde_for_pc(0x1010).is_some());
    assert!(fdes.fde_for_pc(0x2000).is_none());
    Ok(())
}
