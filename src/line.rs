use std::collections::HashMap;

use log::warn;

use crate::cursor::{Cursor, Endian};
use crate::error::{DecodeError, Result};

// Line table opcodes
const DW_LNS_COPY: u8 = 0x01;
const DW_LNS_ADVANCE_PC: u8 = 0x02;
const DW_LNS_ADVANCE_LINE: u8 = 0x03;
const DW_LNS_SET_FILE: u8 = 0x04;
const DW_LNS_SET_COLUMN: u8 = 0x05;
const DW_LNS_NEGATE_STMT: u8 = 0x06;
const DW_LNS_SET_BASIC_BLOCK: u8 = 0x07;
const DW_LNS_CONST_ADD_PC: u8 = 0x08;
const DW_LNS_FIXED_ADVANCE_PC: u8 = 0x09;
const DW_LNS_SET_PROLOGUE_END: u8 = 0x0a;
const DW_LNS_SET_EPILOGUE_BEGIN: u8 = 0x0b;
const DW_LNS_SET_ISA: u8 = 0x0c;

const DW_LNE_END_SEQUENCE: u8 = 0x01;
const DW_LNE_SET_ADDRESS: u8 = 0x02;
const DW_LNE_DEFINE_FILE: u8 = 0x03;
const DW_LNE_SET_DISCRIMINATOR: u8 = 0x04;

// Content types for the version 5 directory/file tables
const DW_LNCT_PATH: u64 = 0x01;
const DW_LNCT_DIRECTORY_INDEX: u64 = 0x02;
const DW_LNCT_TIMESTAMP: u64 = 0x03;
const DW_LNCT_SIZE: u64 = 0x04;

// DW_FORM_* constants (subset used by line tables)
const DW_FORM_DATA2: u64 = 0x05;
const DW_FORM_DATA4: u64 = 0x06;
const DW_FORM_DATA8: u64 = 0x07;
const DW_FORM_STRING: u64 = 0x08;
const DW_FORM_BLOCK: u64 = 0x09;
const DW_FORM_BLOCK1: u64 = 0x0a;
const DW_FORM_DATA1: u64 = 0x0b;
const DW_FORM_UDATA: u64 = 0x0f;
const DW_FORM_DATA16: u64 = 0x1e;
const DW_FORM_LINE_STRP: u64 = 0x1f;

/// Operand counts the interpreter itself knows for standard opcodes 1-12.
/// A header declaring a different count downgrades the opcode to the generic
/// skip path (DWARF 5 vendor extensions redefine the upper numbers).
const EXPECTED_STD_OPERANDS: [u8; 12] = [0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1];

/// Decoded line-number program header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prologue {
    pub unit_length: u64,
    pub version: u16,
    pub address_size: u8,
    pub segment_selector_size: u8,
    pub header_length: u64,
    pub min_instr_length: u8,
    pub max_ops_per_instr: u8,
    pub initial_is_stmt: bool,
    pub line_base: i8,
    pub line_range: u8,
    pub opcode_base: u8,
    pub std_op_lengths: Vec<u8>,
    pub dwarf64: bool,
}

/// One entry of the file-name table, with its path already joined against
/// the directory table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub dir_index: u64,
    pub mod_time: u64,
    pub length: u64,
}

/// The line-number program of one compilation unit: header, tables, and the
/// raw instruction stream. Immutable once parsed; every query runs a fresh
/// [`StateMachine`] (or resumes one, see [`LineLookup`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugLineUnit {
    pub prologue: Prologue,
    pub include_dirs: Vec<String>,
    pub file_names: Vec<FileEntry>,
    pub instructions: Vec<u8>,
    /// Emitted file index to position in `file_names`. Indices are 1-based
    /// for version <= 4 and 0-based for version 5.
    pub lookup: HashMap<u64, usize>,
    ptr_size: u8,
    static_base: u64,
    normalize_backslash: bool,
}

/// One row of the decoded line table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRow {
    pub address: u64,
    pub file: u64,
    pub line: i64,
    pub column: u64,
    pub is_stmt: bool,
    pub basic_block: bool,
    pub end_sequence: bool,
    pub prologue_end: bool,
    pub epilogue_begin: bool,
}

/// Parses every line-number program in a `.debug_line` section.
///
/// Units that fail to decode are skipped with a warning; the section is a
/// concatenation of independently length-prefixed programs, so one broken
/// compiler's output does not hide the rest. Use [`parse_unit`] when a hard
/// error is wanted instead.
///
/// `debug_line_str` is the `.debug_line_str` section for version 5 string
/// references and may be empty. `static_base` is added to every address the
/// programs produce (position-independent binaries relocated at load time).
pub fn parse_all(
    data: &[u8],
    debug_line_str: &[u8],
    static_base: u64,
    normalize_backslash: bool,
    ptr_size: u8,
) -> Vec<DebugLineUnit> {
    let mut units = Vec::new();
    let mut cursor = Cursor::new(data, Endian::Little);
    while !cursor.is_finished() {
        let start = cursor.position();

        // Peek the unit boundary so a broken unit can be skipped cleanly.
        let mut probe = cursor;
        let (unit_length, _) = match probe.read_initial_length() {
            Ok(v) => v,
            Err(err) => {
                warn!("debug_line: no unit boundary at offset {start:#x}: {err}");
                break;
            }
        };
        if unit_length > probe.remaining().len() as u64 {
            warn!("debug_line: unit at offset {start:#x} overruns the section");
            break;
        }
        let end = probe.position() + unit_length as usize;

        match parse_unit(
            &mut cursor,
            "",
            debug_line_str,
            static_base,
            normalize_backslash,
            ptr_size,
        ) {
            Ok(unit) => units.push(unit),
            Err(err) => warn!("debug_line: skipping unit at offset {start:#x}: {err}"),
        }
        cursor.set_position(end);
    }
    units
}

/// Parses a single line-number program at the cursor's position, leaving the
/// cursor at the end of the unit.
///
/// `comp_dir` is the compilation directory from the unit's DIE; for version
/// <= 4 tables it becomes include directory 0. Pass an empty string when it
/// is unknown, which leaves unit-relative paths bare.
pub fn parse_unit(
    cursor: &mut Cursor,
    comp_dir: &str,
    debug_line_str: &[u8],
    static_base: u64,
    normalize_backslash: bool,
    ptr_size: u8,
) -> Result<DebugLineUnit> {
    let (unit_length, dwarf64) = cursor.read_initial_length()?;
    let body_start = cursor.position();
    if unit_length > cursor.remaining().len() as u64 {
        return Err(DecodeError::TruncatedInput { offset: body_start });
    }
    let unit_end = body_start + unit_length as usize;

    let version = cursor.read_u16()?;
    if !(2..=5).contains(&version) {
        return Err(DecodeError::UnsupportedVersion { version });
    }

    let mut address_size = 0u8;
    let mut segment_selector_size = 0u8;
    if version >= 5 {
        let pos = cursor.position();
        address_size = cursor.read_u8()?;
        segment_selector_size = cursor.read_u8()?;
        if address_size == 0 || address_size > 8 {
            return Err(DecodeError::InvalidHeader {
                offset: pos,
                what: "bad address_size",
            });
        }
    }

    let header_length = if dwarf64 {
        cursor.read_u64()?
    } else {
        u64::from(cursor.read_u32()?)
    };
    let header_start = cursor.position();
    if header_start > unit_end || header_length > (unit_end - header_start) as u64 {
        return Err(DecodeError::InvalidHeader {
            offset: header_start,
            what: "header_length overruns the unit",
        });
    }
    let program_start = header_start + header_length as usize;

    let min_instr_length = cursor.read_u8()?;
    let max_ops_per_instr = if version >= 4 { cursor.read_u8()? } else { 1 };
    if max_ops_per_instr == 0 {
        return Err(DecodeError::InvalidHeader {
            offset: cursor.position() - 1,
            what: "maximum_operations_per_instruction is zero",
        });
    }
    let initial_is_stmt = cursor.read_u8()? != 0;
    let line_base = cursor.read_i8()?;
    let line_range_pos = cursor.position();
    let line_range = cursor.read_u8()?;
    if line_range == 0 {
        return Err(DecodeError::InvalidHeader {
            offset: line_range_pos,
            what: "line_range is zero",
        });
    }
    let opcode_base_pos = cursor.position();
    let opcode_base = cursor.read_u8()?;
    if opcode_base == 0 {
        return Err(DecodeError::InvalidHeader {
            offset: opcode_base_pos,
            what: "opcode_base is zero",
        });
    }
    let mut std_op_lengths = Vec::with_capacity(usize::from(opcode_base) - 1);
    for _ in 1..opcode_base {
        std_op_lengths.push(cursor.read_u8()?);
    }

    let mut include_dirs;
    let mut file_names = Vec::new();
    let mut lookup = HashMap::new();
    if version >= 5 {
        include_dirs = read_directories_v5(cursor, debug_line_str, dwarf64, normalize_backslash)?;
        let entries = read_files_v5(
            cursor,
            debug_line_str,
            dwarf64,
            normalize_backslash,
            &include_dirs,
        )?;
        for (i, entry) in entries.into_iter().enumerate() {
            lookup.insert(i as u64, file_names.len());
            file_names.push(entry);
        }
    } else {
        // Directory 0 is the compilation directory.
        include_dirs = vec![normalize_separators(comp_dir.to_string(), normalize_backslash)];
        loop {
            let dir = read_path(cursor, normalize_backslash)?;
            if dir.is_empty() {
                break;
            }
            include_dirs.push(dir);
        }
        while let Some(entry) = read_file_entry(cursor, &include_dirs, normalize_backslash)? {
            lookup.insert(file_names.len() as u64 + 1, file_names.len());
            file_names.push(entry);
        }
    }

    // Vendor padding between the tables and the program is allowed; running
    // into the program area is not.
    if cursor.position() > program_start {
        return Err(DecodeError::InvalidHeader {
            offset: program_start,
            what: "directory/file tables overrun header_length",
        });
    }
    cursor.set_position(program_start);
    let instructions = cursor.read_bytes(unit_end - program_start)?.to_vec();

    Ok(DebugLineUnit {
        prologue: Prologue {
            unit_length,
            version,
            address_size,
            segment_selector_size,
            header_length,
            min_instr_length,
            max_ops_per_instr,
            initial_is_stmt,
            line_base,
            line_range,
            opcode_base,
            std_op_lengths,
            dwarf64,
        },
        include_dirs,
        file_names,
        instructions,
        lookup,
        ptr_size: if version >= 5 { address_size } else { ptr_size },
        static_base,
        normalize_backslash,
    })
}

impl DebugLineUnit {
    /// Decodes the whole program, collecting every emitted row in order.
    pub fn rows(&self) -> Result<Vec<LineRow>> {
        let mut sm = StateMachine::new(self);
        let mut rows = Vec::new();
        while let Some(row) = sm.next_row()? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Resolves an emitted file index against the unit's file table.
    pub fn lookup_file(&self, index: u64) -> Result<&FileEntry> {
        self.lookup
            .get(&index)
            .map(|&slot| &self.file_names[slot])
            .ok_or(DecodeError::InvalidFileIndex { index })
    }

    /// Returns the file and line of the row with the greatest address not
    /// above `pc`, within the sequence containing `base_pc`.
    ///
    /// `base_pc` is the caller's hint for where the covering sequence starts
    /// (usually the function entry); sequences of one unit are not globally
    /// ordered, so the scan positions itself there first. Returns `None`
    /// when `pc` precedes every row of that sequence or falls past its
    /// end-of-sequence marker. Decode errors end the scan with a warning.
    pub fn pc_to_line(&self, base_pc: u64, pc: u64) -> Option<(String, i64)> {
        if base_pc > pc {
            return None;
        }
        let mut sm = StateMachine::new(self);
        if base_pc != 0 && base_pc != pc {
            sm.pc_to_line(base_pc)?;
        }
        sm.pc_to_line(pc)
    }

    /// Reverse index: records the address of every statement row of `path`
    /// whose line already has a key in `lines`.
    ///
    /// Consecutive rows at one address count once. `path` must match the
    /// decoder's recorded form (directory-joined, forward slashes when the
    /// unit was parsed with backslash normalization).
    pub fn file_lines_to_pcs(&self, path: &str, lines: &mut HashMap<i64, Vec<u64>>) {
        let mut sm = StateMachine::new(self);
        let mut last_addr = 0u64;
        loop {
            let row = match sm.next_row() {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(err) => {
                    warn!("debug_line: file/line scan: {err}");
                    break;
                }
            };
            if row.end_sequence || !row.is_stmt || row.address == last_addr {
                continue;
            }
            if sm.file_path(row.file) != Some(path) {
                continue;
            }
            last_addr = row.address;
            if let Some(pcs) = lines.get_mut(&row.line) {
                pcs.push(row.address);
            }
        }
    }

    /// All row addresses in `[begin, end)`, except rows mapped to
    /// `exclude_path:exclude_line`. Used to sweep a function's body for
    /// step-over targets while leaving out the current source line.
    pub fn all_pcs_between(
        &self,
        begin: u64,
        end: u64,
        exclude_path: &str,
        exclude_line: i64,
    ) -> Vec<u64> {
        let mut sm = StateMachine::new(self);
        let mut pcs: Vec<u64> = Vec::new();
        let mut last_addr = 0u64;
        loop {
            let row = match sm.next_row() {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(err) => {
                    warn!("debug_line: pc sweep: {err}");
                    break;
                }
            };
            if row.end_sequence {
                continue;
            }
            if row.address > last_addr && row.address >= begin && row.address < end {
                if row.line != exclude_line || sm.file_path(row.file) != Some(exclude_path) {
                    pcs.push(row.address);
                    last_addr = row.address;
                }
            }
        }
        pcs
    }
}

/// Executes a line-number program one opcode at a time.
///
/// The registers mirror the DWARF specification's state machine. The machine
/// is cheap to clone, which [`LineLookup`] uses to snapshot a position and
/// replay from it.
#[derive(Clone)]
pub struct StateMachine<'a> {
    unit: &'a DebugLineUnit,
    cursor: Cursor<'a>,
    address: u64,
    op_index: u64,
    file: u64,
    line: i64,
    column: u64,
    is_stmt: bool,
    basic_block: bool,
    end_sequence: bool,
    prologue_end: bool,
    epilogue_begin: bool,
    discriminator: u64,
    valid: bool,
    started: bool,
    defined_files: Vec<FileEntry>,
    last_address: u64,
    last_file: u64,
    last_line: i64,
}

impl<'a> StateMachine<'a> {
    pub fn new(unit: &'a DebugLineUnit) -> Self {
        StateMachine {
            unit,
            cursor: Cursor::new(&unit.instructions, Endian::Little),
            address: 0,
            op_index: 0,
            file: 1,
            line: 1,
            column: 0,
            is_stmt: unit.prologue.initial_is_stmt,
            basic_block: false,
            end_sequence: false,
            prologue_end: false,
            epilogue_begin: false,
            discriminator: 0,
            valid: false,
            started: false,
            defined_files: Vec::new(),
            last_address: u64::MAX,
            last_file: 0,
            last_line: 0,
        }
    }

    fn reset(&mut self) {
        self.address = 0;
        self.op_index = 0;
        self.file = 1;
        self.line = 1;
        self.column = 0;
        self.is_stmt = self.unit.prologue.initial_is_stmt;
        self.basic_block = false;
        self.end_sequence = false;
        self.prologue_end = false;
        self.epilogue_begin = false;
        self.discriminator = 0;
        self.last_address = u64::MAX;
        self.last_file = 0;
        self.last_line = 0;
    }

    /// Advances until the next row is emitted. Returns `Ok(None)` at the end
    /// of the instruction stream.
    pub fn next_row(&mut self) -> Result<Option<LineRow>> {
        loop {
            if self.valid {
                // The row just handed out becomes the lookback row, and its
                // single-row flags are consumed.
                self.last_address = self.address;
                self.last_file = self.file;
                self.last_line = self.line;
                self.basic_block = false;
                self.prologue_end = false;
                self.epilogue_begin = false;
                self.discriminator = 0;
            }
            if self.end_sequence {
                self.reset();
            }
            self.valid = false;
            self.started = true;

            if self.cursor.is_finished() {
                return Ok(None);
            }
            let opcode = self.cursor.read_u8()?;
            let emitted = if opcode == 0 {
                self.execute_extended_opcode()?
            } else if opcode >= self.unit.prologue.opcode_base {
                self.execute_special_opcode(opcode);
                true
            } else {
                self.execute_standard_opcode(opcode)?
            };
            if emitted {
                self.valid = true;
                return Ok(Some(self.row()));
            }
        }
    }

    /// Resolves an emitted file index, including files appended at run time
    /// by DW_LNE_define_file.
    pub fn file_path(&self, index: u64) -> Option<&str> {
        if let Some(&slot) = self.unit.lookup.get(&index) {
            return Some(&self.unit.file_names[slot].path);
        }
        let base = self.unit.file_names.len() as u64;
        let first_defined = if self.unit.prologue.version >= 5 {
            base
        } else {
            base + 1
        };
        index
            .checked_sub(first_defined)
            .and_then(|i| self.defined_files.get(i as usize))
            .map(|entry| entry.path.as_str())
    }

    /// Scans forward for the row covering `pc`, in the same way address
    /// ranges are walked by [`DebugLineUnit::pc_to_line`]. The machine stops
    /// on the first row past `pc`, so a later call with a larger `pc` picks
    /// up from there instead of rescanning.
    pub fn pc_to_line(&mut self, pc: u64) -> Option<(String, i64)> {
        if !self.started {
            match self.next_row() {
                Ok(Some(_)) => {}
                Ok(None) => return None,
                Err(err) => {
                    warn!("debug_line: pc lookup: {err}");
                    return None;
                }
            }
        }
        let mut hit = None;
        if self.last_address != u64::MAX {
            if self.last_address > pc {
                // The cursor is already past pc; the caller has to restart.
                return None;
            }
            hit = Some((self.last_file, self.last_line));
        }
        loop {
            if self.valid {
                if self.address > pc {
                    if hit.is_some() {
                        break;
                    }
                    // pc precedes this sequence; a later one may cover it.
                } else if self.end_sequence {
                    // pc is at or past the end of this sequence.
                    hit = None;
                } else {
                    hit = Some((self.file, self.line));
                }
            }
            match self.next_row() {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(err) => {
                    warn!("debug_line: pc lookup: {err}");
                    break;
                }
            }
        }
        hit.map(|(file, line)| (self.path_string(file), line))
    }

    fn path_string(&self, index: u64) -> String {
        self.file_path(index).unwrap_or("").to_string()
    }

    fn row(&self) -> LineRow {
        LineRow {
            address: self.address,
            file: self.file,
            line: self.line,
            column: self.column,
            is_stmt: self.is_stmt,
            basic_block: self.basic_block,
            end_sequence: self.end_sequence,
            prologue_end: self.prologue_end,
            epilogue_begin: self.epilogue_begin,
        }
    }

    /// Address advance shared by special opcodes, advance_pc and
    /// const_add_pc. op_index only matters for VLIW targets where
    /// max_ops_per_instr > 1; everywhere else it stays zero. The arithmetic
    /// wraps; operands come straight from the program bytes.
    fn advance_address(&mut self, operation_advance: u64) {
        let prologue = &self.unit.prologue;
        let max_ops = u64::from(prologue.max_ops_per_instr);
        let total = self.op_index.wrapping_add(operation_advance);
        let delta = u64::from(prologue.min_instr_length).wrapping_mul(total / max_ops);
        self.address = self.address.wrapping_add(delta);
        self.op_index = total % max_ops;
    }

    fn execute_special_opcode(&mut self, opcode: u8) {
        let prologue = &self.unit.prologue;
        let adjusted = opcode - prologue.opcode_base;
        let line_advance =
            i64::from(prologue.line_base) + i64::from(adjusted % prologue.line_range);
        self.advance_address(u64::from(adjusted / self.unit.prologue.line_range));
        self.line = self.line.wrapping_add(line_advance);
    }

    fn execute_standard_opcode(&mut self, opcode: u8) -> Result<bool> {
        let declared = self.unit.prologue.std_op_lengths[usize::from(opcode) - 1];
        let known = usize::from(opcode) <= EXPECTED_STD_OPERANDS.len()
            && EXPECTED_STD_OPERANDS[usize::from(opcode) - 1] == declared;
        if !known {
            // Vendor or future opcode: consume exactly the operand count the
            // header declared and move on.
            for _ in 0..declared {
                self.cursor.read_uleb128()?;
            }
            return Ok(false);
        }
        match opcode {
            DW_LNS_COPY => return Ok(true),
            DW_LNS_ADVANCE_PC => {
                let advance = self.cursor.read_uleb128()?;
                self.advance_address(advance);
            }
            DW_LNS_ADVANCE_LINE => {
                let advance = self.cursor.read_sleb128()?;
                self.line = self.line.wrapping_add(advance);
            }
            DW_LNS_SET_FILE => {
                let file = self.cursor.read_uleb128()?;
                if self.file_path(file).is_none() {
                    warn!(
                        "debug_line: {}",
                        DecodeError::InvalidFileIndex { index: file }
                    );
                }
                self.file = file;
            }
            DW_LNS_SET_COLUMN => self.column = self.cursor.read_uleb128()?,
            DW_LNS_NEGATE_STMT => self.is_stmt = !self.is_stmt,
            DW_LNS_SET_BASIC_BLOCK => self.basic_block = true,
            DW_LNS_CONST_ADD_PC => {
                let prologue = &self.unit.prologue;
                let adjusted = 255 - prologue.opcode_base;
                self.advance_address(u64::from(adjusted / prologue.line_range));
            }
            DW_LNS_FIXED_ADVANCE_PC => {
                // Byte-exact advance, no min_instr_length scaling.
                let advance = self.cursor.read_u16()?;
                self.address = self.address.wrapping_add(u64::from(advance));
                self.op_index = 0;
            }
            DW_LNS_SET_PROLOGUE_END => self.prologue_end = true,
            DW_LNS_SET_EPILOGUE_BEGIN => self.epilogue_begin = true,
            DW_LNS_SET_ISA => {
                let _ = self.cursor.read_uleb128()?;
            }
            _ => {}
        }
        Ok(false)
    }

    fn execute_extended_opcode(&mut self) -> Result<bool> {
        let declared = self.cursor.read_uleb128()?;
        let start = self.cursor.position();
        if declared > self.cursor.remaining().len() as u64 {
            return Err(DecodeError::TruncatedInput { offset: start });
        }
        let len = declared as usize;
        if len == 0 {
            return Ok(false);
        }

        let opcode = self.cursor.read_u8()?;
        let mut emitted = false;
        match opcode {
            DW_LNE_END_SEQUENCE => {
                // The reset happens on the next advance, so the emitted row
                // keeps the final address of the sequence.
                self.end_sequence = true;
                emitted = true;
            }
            DW_LNE_SET_ADDRESS => {
                let unit = self.unit;
                let addr = self.cursor.read_uint(usize::from(unit.ptr_size))?;
                self.address = addr.wrapping_add(unit.static_base);
                self.op_index = 0;
            }
            DW_LNE_DEFINE_FILE => {
                let unit = self.unit;
                if let Some(entry) =
                    read_file_entry(&mut self.cursor, &unit.include_dirs, unit.normalize_backslash)?
                {
                    self.defined_files.push(entry);
                }
            }
            DW_LNE_SET_DISCRIMINATOR => {
                self.discriminator = self.cursor.read_uleb128()?;
            }
            _ => {} // unknown extended opcode, skipped below
        }

        // len counts the opcode byte and its operands. Reading past it means
        // the stream is corrupt; reading less (unknown opcodes, oversized
        // address fields) skips the remainder.
        if self.cursor.position() - start > len {
            return Err(DecodeError::TruncatedInput { offset: start });
        }
        self.cursor.set_position(start + len);
        Ok(emitted)
    }
}

/// Forward-scanning cache for the single-stepping pattern: repeated
/// `pc_to_line` calls with mostly increasing pcs inside one function.
///
/// Per `base_pc`, one machine is parked at the start of the covering
/// sequence (built once) and one keeps the position of the latest query.
/// Increasing pcs resume the second machine; a backward pc falls back to
/// replaying a clone of the parked one. Callers on different threads each
/// build their own lookup over the shared unit.
pub struct LineLookup<'a> {
    unit: &'a DebugLineUnit,
    entries: HashMap<u64, StateMachine<'a>>,
    cursors: HashMap<u64, StateMachine<'a>>,
}

impl<'a> LineLookup<'a> {
    pub fn new(unit: &'a DebugLineUnit) -> Self {
        LineLookup {
            unit,
            entries: HashMap::new(),
            cursors: HashMap::new(),
        }
    }

    pub fn pc_to_line(&mut self, base_pc: u64, pc: u64) -> Option<(String, i64)> {
        if base_pc > pc {
            return None;
        }
        if base_pc == 0 {
            return self.unit.pc_to_line(0, pc);
        }
        if let Some(sm) = self.cursors.get_mut(&base_pc) {
            if sm.last_address != u64::MAX && sm.last_address <= pc {
                return sm.pc_to_line(pc);
            }
        }
        let unit = self.unit;
        let entry = self.entries.entry(base_pc).or_insert_with(|| {
            let mut sm = StateMachine::new(unit);
            let _ = sm.pc_to_line(base_pc);
            sm
        });
        let mut sm = entry.clone();
        let result = sm.pc_to_line(pc);
        self.cursors.insert(base_pc, sm);
        result
    }
}

fn normalize_separators(path: String, normalize_backslash: bool) -> String {
    if normalize_backslash && path.contains('\\') {
        path.replace('\\', "/")
    } else {
        path
    }
}

fn read_path(cursor: &mut Cursor, normalize_backslash: bool) -> Result<String> {
    let bytes = cursor.read_cstr()?;
    Ok(normalize_separators(
        String::from_utf8_lossy(bytes).into_owned(),
        normalize_backslash,
    ))
}

fn path_is_absolute(path: &str) -> bool {
    if path.starts_with('/') {
        return true;
    }
    // Windows drive prefix, after backslashes were normalized away.
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}

fn join_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

fn resolve_path(name: &str, dir_index: u64, include_dirs: &[String]) -> String {
    if path_is_absolute(name) {
        return name.to_string();
    }
    match include_dirs.get(dir_index as usize) {
        Some(dir) if !dir.is_empty() => join_path(dir, name),
        _ => name.to_string(),
    }
}

/// Reads one version <= 4 file entry. `None` means the empty-name table
/// terminator was found.
fn read_file_entry(
    cursor: &mut Cursor,
    include_dirs: &[String],
    normalize_backslash: bool,
) -> Result<Option<FileEntry>> {
    let name = read_path(cursor, normalize_backslash)?;
    if name.is_empty() {
        return Ok(None);
    }
    let dir_index = cursor.read_uleb128()?;
    let mod_time = cursor.read_uleb128()?;
    let length = cursor.read_uleb128()?;
    let path = resolve_path(&name, dir_index, include_dirs);
    Ok(Some(FileEntry {
        path,
        dir_index,
        mod_time,
        length,
    }))
}

struct EntryFormat {
    content_type: u64,
    form: u64,
}

enum FormValue {
    Str(String),
    Num(u64),
    Skipped,
}

fn read_entry_formats(cursor: &mut Cursor) -> Result<Vec<EntryFormat>> {
    let count = cursor.read_u8()?;
    let mut formats = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let content_type = cursor.read_uleb128()?;
        let form = cursor.read_uleb128()?;
        formats.push(EntryFormat { content_type, form });
    }
    Ok(formats)
}

fn read_form_value(
    cursor: &mut Cursor,
    form: u64,
    debug_line_str: &[u8],
    dwarf64: bool,
    normalize_backslash: bool,
) -> Result<FormValue> {
    let value = match form {
        DW_FORM_STRING => FormValue::Str(read_path(cursor, normalize_backslash)?),
        DW_FORM_LINE_STRP => {
            let offset = if dwarf64 {
                cursor.read_u64()?
            } else {
                u64::from(cursor.read_u32()?)
            };
            FormValue::Str(normalize_separators(
                line_str_at(debug_line_str, offset),
                normalize_backslash,
            ))
        }
        DW_FORM_UDATA => FormValue::Num(cursor.read_uleb128()?),
        DW_FORM_DATA1 => FormValue::Num(u64::from(cursor.read_u8()?)),
        DW_FORM_DATA2 => FormValue::Num(u64::from(cursor.read_u16()?)),
        DW_FORM_DATA4 => FormValue::Num(u64::from(cursor.read_u32()?)),
        DW_FORM_DATA8 => FormValue::Num(cursor.read_u64()?),
        DW_FORM_DATA16 => {
            cursor.advance(16)?;
            FormValue::Skipped
        }
        DW_FORM_BLOCK => {
            let size = cursor.read_uleb128()? as usize;
            cursor.advance(size)?;
            FormValue::Skipped
        }
        DW_FORM_BLOCK1 => {
            let size = usize::from(cursor.read_u8()?);
            cursor.advance(size)?;
            FormValue::Skipped
        }
        _ => {
            return Err(DecodeError::InvalidHeader {
                offset: cursor.position(),
                what: "unsupported form in directory/file table",
            })
        }
    };
    Ok(value)
}

fn line_str_at(debug_line_str: &[u8], offset: u64) -> String {
    let Some(bytes) = usize::try_from(offset)
        .ok()
        .and_then(|offset| debug_line_str.get(offset..))
    else {
        warn!("debug_line: string offset {offset:#x} outside .debug_line_str");
        return String::new();
    };
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn read_directories_v5(
    cursor: &mut Cursor,
    debug_line_str: &[u8],
    dwarf64: bool,
    normalize_backslash: bool,
) -> Result<Vec<String>> {
    let formats = read_entry_formats(cursor)?;
    let count = cursor.read_uleb128()?;
    let mut dirs = Vec::new();
    for _ in 0..count {
        let mut path = String::new();
        for format in &formats {
            let value =
                read_form_value(cursor, format.form, debug_line_str, dwarf64, normalize_backslash)?;
            if format.content_type == DW_LNCT_PATH {
                if let FormValue::Str(s) = value {
                    path = s;
                }
            }
        }
        dirs.push(path);
    }
    Ok(dirs)
}

fn read_files_v5(
    cursor: &mut Cursor,
    debug_line_str: &[u8],
    dwarf64: bool,
    normalize_backslash: bool,
    include_dirs: &[String],
) -> Result<Vec<FileEntry>> {
    let formats = read_entry_formats(cursor)?;
    let count = cursor.read_uleb128()?;
    let mut entries = Vec::new();
    for _ in 0..count {
        let mut name = String::new();
        let mut dir_index = 0u64;
        let mut mod_time = 0u64;
        let mut length = 0u64;
        for format in &formats {
            let value =
                read_form_value(cursor, format.form, debug_line_str, dwarf64, normalize_backslash)?;
            match (format.content_type, value) {
                (DW_LNCT_PATH, FormValue::Str(s)) => name = s,
                (DW_LNCT_DIRECTORY_INDEX, FormValue::Num(n)) => dir_index = n,
                (DW_LNCT_TIMESTAMP, FormValue::Num(n)) => mod_time = n,
                (DW_LNCT_SIZE, FormValue::Num(n)) => length = n,
                _ => {} // MD5 and vendor content types are skipped
            }
        }
        let path = resolve_path(&name, dir_index, include_dirs);
        entries.push(FileEntry {
            path,
            dir_index,
            mod_time,
            length,
        });
    }
    Ok(entries)
}
