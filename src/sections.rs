use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::read::ZlibDecoder;
use log::warn;
use memmap2::Mmap;
use object::{Object, ObjectSection};

use crate::error::SectionError;

/// Returns the contents of `.debug_<name>`, falling back to the compressed
/// `.zdebug_<name>` spelling emitted by older toolchains.
pub fn debug_section(file: &object::File, name: &str) -> Result<Vec<u8>, SectionError> {
    if let Some(section) = file.section_by_name(&format!(".debug_{name}")) {
        return Ok(section.data()?.to_vec());
    }
    if let Some(section) = file.section_by_name(&format!(".zdebug_{name}")) {
        return decompress_maybe(section.data()?);
    }
    Err(SectionError::Missing(name.to_string()))
}

/// Inflates a `.zdebug_*` payload: a "ZLIB" magic, a big-endian u64 with the
/// inflated size, then the deflate stream. Anything else passes through
/// unchanged.
fn decompress_maybe(data: &[u8]) -> Result<Vec<u8>, SectionError> {
    if data.len() < 12 || &data[..4] != b"ZLIB" {
        return Ok(data.to_vec());
    }
    let mut size_bytes = [0u8; 8];
    size_bytes.copy_from_slice(&data[4..12]);
    let expected = u64::from_be_bytes(size_bytes);

    let mut out = Vec::new();
    ZlibDecoder::new(&data[12..])
        .read_to_end(&mut out)
        .map_err(SectionError::Inflate)?;
    if out.len() as u64 != expected {
        warn!(
            "zdebug section inflated to {} bytes, header claims {expected}",
            out.len()
        );
    }
    Ok(out)
}

/// The debug sections of one binary, each `None` when absent.
///
/// `.eh_frame` is kept raw together with its load address since its pointer
/// encodings are relative to where the section sits in memory.
#[derive(Debug, Default)]
pub struct DebugSections {
    pub abbrev: Option<Vec<u8>>,
    pub line: Option<Vec<u8>>,
    pub line_str: Option<Vec<u8>>,
    pub frame: Option<Vec<u8>>,
    pub eh_frame: Option<Vec<u8>>,
    pub eh_frame_addr: u64,
    pub info: Option<Vec<u8>>,
    pub loc: Option<Vec<u8>>,
    pub ranges: Option<Vec<u8>>,
    pub pubnames: Option<Vec<u8>>,
    pub pubtypes: Option<Vec<u8>>,
}

impl DebugSections {
    pub fn load(path: &Path) -> Result<DebugSections, SectionError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        DebugSections::from_bytes(&mmap)
    }

    pub fn from_bytes(data: &[u8]) -> Result<DebugSections, SectionError> {
        let file = object::File::parse(data)?;
        let (eh_frame, eh_frame_addr) = match file.section_by_name(".eh_frame") {
            Some(section) => (section.data().ok().map(<[u8]>::to_vec), section.address()),
            None => (None, 0),
        };
        Ok(DebugSections {
            abbrev: debug_section(&file, "abbrev").ok(),
            line: debug_section(&file, "line").ok(),
            line_str: debug_section(&file, "line_str").ok(),
            frame: debug_section(&file, "frame").ok(),
            eh_frame,
            eh_frame_addr,
            info: debug_section(&file, "info").ok(),
            loc: debug_section(&file, "loc").ok(),
            ranges: debug_section(&file, "ranges").ok(),
            pubnames: debug_section(&file, "pubnames").ok(),
            pubtypes: debug_section(&file, "pubtypes").ok(),
        })
    }
}
