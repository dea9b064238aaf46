use std::collections::HashMap;
use std::sync::Arc;

use log::warn;

use crate::cursor::{Cursor, Endian};
use crate::error::{DecodeError, Result};

// Call frame instructions with the operand packed into the low six bits
const DW_CFA_ADVANCE_LOC: u8 = 0x40;
const DW_CFA_OFFSET: u8 = 0x80;
const DW_CFA_RESTORE: u8 = 0xc0;

const DW_CFA_NOP: u8 = 0x00;
const DW_CFA_SET_LOC: u8 = 0x01;
const DW_CFA_ADVANCE_LOC1: u8 = 0x02;
const DW_CFA_ADVANCE_LOC2: u8 = 0x03;
const DW_CFA_ADVANCE_LOC4: u8 = 0x04;
const DW_CFA_OFFSET_EXTENDED: u8 = 0x05;
const DW_CFA_RESTORE_EXTENDED: u8 = 0x06;
const DW_CFA_UNDEFINED: u8 = 0x07;
const DW_CFA_SAME_VALUE: u8 = 0x08;
const DW_CFA_REGISTER: u8 = 0x09;
const DW_CFA_REMEMBER_STATE: u8 = 0x0a;
const DW_CFA_RESTORE_STATE: u8 = 0x0b;
const DW_CFA_DEF_CFA: u8 = 0x0c;
const DW_CFA_DEF_CFA_REGISTER: u8 = 0x0d;
const DW_CFA_DEF_CFA_OFFSET: u8 = 0x0e;
const DW_CFA_DEF_CFA_EXPRESSION: u8 = 0x0f;
const DW_CFA_EXPRESSION: u8 = 0x10;
const DW_CFA_OFFSET_EXTENDED_SF: u8 = 0x11;
const DW_CFA_DEF_CFA_SF: u8 = 0x12;
const DW_CFA_DEF_CFA_OFFSET_SF: u8 = 0x13;
const DW_CFA_VAL_OFFSET: u8 = 0x14;
const DW_CFA_VAL_OFFSET_SF: u8 = 0x15;
const DW_CFA_VAL_EXPRESSION: u8 = 0x16;
const DW_CFA_GNU_WINDOW_SAVE: u8 = 0x2d;
const DW_CFA_GNU_ARGS_SIZE: u8 = 0x2e;
const DW_CFA_GNU_NEGATIVE_OFFSET_EXTENDED: u8 = 0x2f;

// .eh_frame pointer encodings (value format in the low nibble)
const DW_EH_PE_ABSPTR: u8 = 0x00;
const DW_EH_PE_ULEB128: u8 = 0x01;
const DW_EH_PE_UDATA2: u8 = 0x02;
const DW_EH_PE_UDATA4: u8 = 0x03;
const DW_EH_PE_UDATA8: u8 = 0x04;
const DW_EH_PE_SLEB128: u8 = 0x09;
const DW_EH_PE_SDATA2: u8 = 0x0a;
const DW_EH_PE_SDATA4: u8 = 0x0b;
const DW_EH_PE_SDATA8: u8 = 0x0c;
const DW_EH_PE_PCREL: u8 = 0x10;
const DW_EH_PE_OMIT: u8 = 0xff;

/// Recovery recipe for one register at a given pc.
///
/// `Offset` is relative to the CFA. Registers never mentioned by the frame
/// program are implicitly `Undefined`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    Undefined,
    SameValue,
    Offset(i64),
    Register(u64),
    ValExpression(Vec<u8>),
    /// The instruction was understood and consumed but the rule it sets is
    /// not representable here (DWARF expressions for saved locations).
    Unsupported,
}

/// How the canonical frame address is computed at a given pc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CfaRule {
    RegisterOffset { reg: u64, offset: i64 },
    Expression(Vec<u8>),
}

/// Unwinding rules in effect at one pc, produced by
/// [`FrameDescriptionEntry::establish_frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameContext {
    pub cfa: CfaRule,
    pub regs: HashMap<u64, Rule>,
    pub ret_addr_reg: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonInformationEntry {
    pub version: u8,
    pub augmentation: String,
    pub code_alignment_factor: u64,
    pub data_alignment_factor: i64,
    pub return_address_register: u64,
    pub initial_instructions: Vec<u8>,
    pub address_size: u8,
    pub segment_selector_size: u8,
    pub static_base: u64,
    endian: Endian,
    fde_pointer_encoding: u8,
}

/// One frame description entry covering `[begin, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDescriptionEntry {
    pub begin: u64,
    pub end: u64,
    pub cie: Arc<CommonInformationEntry>,
    pub instructions: Vec<u8>,
}

impl FrameDescriptionEntry {
    pub fn cover(&self, pc: u64) -> bool {
        self.begin <= pc && pc < self.end
    }

    /// Runs the CIE's initial instructions, then this entry's instructions
    /// up to the row covering `pc`, and returns the resulting rules.
    pub fn establish_frame(&self, pc: u64) -> Result<FrameContext> {
        let mut executor = FrameExecutor::new(&self.cie, self.begin);
        executor.execute(&self.cie.initial_instructions, u64::MAX)?;
        executor.save_initial_rules();
        executor.execute(&self.instructions, pc)?;
        Ok(executor.into_context())
    }
}

/// All FDEs of a section, ordered by begin address.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FrameDescriptionEntries(Vec<FrameDescriptionEntry>);

impl FrameDescriptionEntries {
    /// Binary search for the entry covering `pc`.
    pub fn fde_for_pc(&self, pc: u64) -> Option<&FrameDescriptionEntry> {
        let idx = self.0.partition_point(|fde| fde.end <= pc);
        self.0.get(idx).filter(|fde| fde.cover(pc))
    }

    /// Merges another set into this one, used to combine `.debug_frame` with
    /// `.eh_frame` of the same binary. Entries for a range already present
    /// are dropped.
    pub fn append(&mut self, other: FrameDescriptionEntries) {
        self.0.extend(other.0);
        self.0.sort_by_key(|fde| fde.begin);
        self.0
            .dedup_by(|a, b| a.begin == b.begin && a.end == b.end);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&FrameDescriptionEntry> {
        self.0.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FrameDescriptionEntry> {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a FrameDescriptionEntries {
    type Item = &'a FrameDescriptionEntry;
    type IntoIter = std::slice::Iter<'a, FrameDescriptionEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

struct PendingFde {
    cie_offset: u64,
    body_start: usize,
    body_end: usize,
}

/// Parses a `.debug_frame` or `.eh_frame` section into its FDEs.
///
/// `eh_frame_addr` is the load address of the section; a nonzero value
/// selects `.eh_frame` conventions (CIE id 0, relative CIE pointers, encoded
/// and possibly pc-relative addresses). `static_base` is added to every code
/// address. CIE records may appear after the FDEs referencing them.
pub fn parse(
    data: &[u8],
    endian: Endian,
    static_base: u64,
    ptr_size: u8,
    eh_frame_addr: u64,
) -> Result<FrameDescriptionEntries> {
    let eh_frame = eh_frame_addr != 0;
    let mut cursor = Cursor::new(data, endian);
    let mut cies: HashMap<u64, Arc<CommonInformationEntry>> = HashMap::new();
    let mut pending: Vec<PendingFde> = Vec::new();

    while !cursor.is_finished() {
        let record_start = cursor.position();
        let (length, dwarf64) = cursor.read_initial_length()?;
        if length == 0 {
            // .eh_frame terminator; linkers occasionally leave several.
            continue;
        }
        let body_start = cursor.position();
        if length > cursor.remaining().len() as u64 {
            return Err(DecodeError::TruncatedInput { offset: body_start });
        }
        let body_end = body_start + length as usize;

        let id_field = cursor.position() as u64;
        let id = if dwarf64 {
            cursor.read_u64()?
        } else {
            u64::from(cursor.read_u32()?)
        };
        let is_cie = if eh_frame {
            id == 0
        } else if dwarf64 {
            id == u64::MAX
        } else {
            id == u64::from(u32::MAX)
        };

        if is_cie {
            let cie = parse_cie(
                &mut cursor,
                body_end,
                endian,
                static_base,
                ptr_size,
                eh_frame,
            )?;
            cies.insert(record_start as u64, Arc::new(cie));
        } else {
            // .debug_frame stores the CIE's section offset; .eh_frame stores
            // the distance back from this very field.
            let cie_offset = if eh_frame {
                id_field.wrapping_sub(id)
            } else {
                id
            };
            pending.push(PendingFde {
                cie_offset,
                body_start: cursor.position(),
                body_end,
            });
        }
        cursor.set_position(body_end);
    }

    let mut fdes = Vec::with_capacity(pending.len());
    for raw in pending {
        let cie = cies
            .get(&raw.cie_offset)
            .cloned()
            .ok_or(DecodeError::DanglingCIEReference {
                offset: raw.cie_offset,
            })?;
        let mut body = Cursor::new(data, endian);
        body.set_position(raw.body_start);

        let (begin_raw, range) = if eh_frame {
            let begin = read_encoded_pointer(
                &mut body,
                cie.fde_pointer_encoding,
                cie.address_size,
                eh_frame_addr,
            )?;
            // The range field carries the value format only, never pcrel.
            let range = read_encoded_pointer(
                &mut body,
                cie.fde_pointer_encoding & 0x0f,
                cie.address_size,
                0,
            )?;
            if cie.augmentation.starts_with('z') {
                let aug_len = body.read_uleb128()?;
                body.advance(aug_len as usize)?;
            }
            (begin, range)
        } else {
            body.advance(usize::from(cie.segment_selector_size))?;
            let begin = body.read_uint(usize::from(cie.address_size))?;
            let range = body.read_uint(usize::from(cie.address_size))?;
            (begin, range)
        };

        let instr_start = body.position();
        if instr_start > raw.body_end {
            return Err(DecodeError::TruncatedInput {
                offset: raw.body_start,
            });
        }
        let instructions = body.read_bytes(raw.body_end - instr_start)?.to_vec();
        let begin = begin_raw.wrapping_add(static_base);
        fdes.push(FrameDescriptionEntry {
            begin,
            end: begin.wrapping_add(range),
            cie,
            instructions,
        });
    }

    fdes.sort_by_key(|fde| fde.begin);
    Ok(FrameDescriptionEntries(fdes))
}

fn parse_cie(
    cursor: &mut Cursor,
    body_end: usize,
    endian: Endian,
    static_base: u64,
    ptr_size: u8,
    eh_frame: bool,
) -> Result<CommonInformationEntry> {
    let version_pos = cursor.position();
    let version = cursor.read_u8()?;
    if !matches!(version, 1 | 3 | 4) {
        return Err(DecodeError::UnsupportedVersion {
            version: u16::from(version),
        });
    }
    let augmentation = String::from_utf8_lossy(cursor.read_cstr()?).into_owned();
    if augmentation == "eh" {
        // Old GCC layout: a raw pointer follows the augmentation string.
        cursor.advance(usize::from(ptr_size))?;
    }

    let mut address_size = ptr_size;
    let mut segment_selector_size = 0u8;
    if version == 4 && !eh_frame {
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

    let code_alignment_factor = cursor.read_uleb128()?;
    let data_alignment_factor = cursor.read_sleb128()?;
    let return_address_register = if version == 1 {
        u64::from(cursor.read_u8()?)
    } else {
        cursor.read_uleb128()?
    };

    let mut fde_pointer_encoding = DW_EH_PE_ABSPTR;
    if eh_frame && augmentation.starts_with('z') {
        let aug_len = cursor.read_uleb128()? as usize;
        let aug_start = cursor.position();
        if aug_start > body_end || aug_len > body_end - aug_start {
            return Err(DecodeError::TruncatedInput { offset: aug_start });
        }
        for letter in augmentation.chars().skip(1) {
            match letter {
                'R' => fde_pointer_encoding = cursor.read_u8()?,
                'L' => {
                    // LSDA pointers live in the FDE augmentation data.
                    let _ = cursor.read_u8()?;
                }
                'P' => {
                    let encoding = cursor.read_u8()?;
                    let _ = read_encoded_pointer(cursor, encoding, address_size, 0)?;
                }
                'S' => {} // signal frame marker, no data
                _ => break,
            }
        }
        if cursor.position() > aug_start + aug_len {
            return Err(DecodeError::TruncatedInput { offset: aug_start });
        }
        cursor.set_position(aug_start + aug_len);
    }

    let init_start = cursor.position();
    if init_start > body_end {
        return Err(DecodeError::TruncatedInput { offset: version_pos });
    }
    let opaque_augmentation =
        !augmentation.is_empty() && !augmentation.starts_with('z') && augmentation != "eh";
    let initial_instructions = if opaque_augmentation {
        // Without 'z' there is no length prefix, so the instruction stream
        // cannot be located past the unknown augmentation data.
        warn!("debug_frame: opaque CIE augmentation {augmentation:?}, instructions dropped");
        Vec::new()
    } else {
        cursor.read_bytes(body_end - init_start)?.to_vec()
    };

    Ok(CommonInformationEntry {
        version,
        augmentation,
        code_alignment_factor,
        data_alignment_factor,
        return_address_register,
        initial_instructions,
        address_size,
        segment_selector_size,
        static_base,
        endian,
        fde_pointer_encoding,
    })
}

fn read_encoded_pointer(
    cursor: &mut Cursor,
    encoding: u8,
    address_size: u8,
    section_addr: u64,
) -> Result<u64> {
    if encoding == DW_EH_PE_OMIT {
        return Ok(0);
    }
    let field_addr = section_addr.wrapping_add(cursor.position() as u64);
    let value = match encoding & 0x0f {
        DW_EH_PE_ABSPTR => cursor.read_uint(usize::from(address_size))?,
        DW_EH_PE_ULEB128 => cursor.read_uleb128()?,
        DW_EH_PE_UDATA2 => u64::from(cursor.read_u16()?),
        DW_EH_PE_UDATA4 => u64::from(cursor.read_u32()?),
        DW_EH_PE_UDATA8 => cursor.read_u64()?,
        DW_EH_PE_SLEB128 => cursor.read_sleb128()? as u64,
        DW_EH_PE_SDATA2 => cursor.read_u16()? as i16 as i64 as u64,
        DW_EH_PE_SDATA4 => cursor.read_u32()? as i32 as i64 as u64,
        DW_EH_PE_SDATA8 => cursor.read_u64()?,
        _ => {
            return Err(DecodeError::InvalidHeader {
                offset: cursor.position(),
                what: "unsupported pointer encoding",
            })
        }
    };
    // Application modifiers other than pcrel (datarel, textrel, ...) need
    // bases this decoder does not carry; their values pass through as-is.
    if encoding & 0x70 == DW_EH_PE_PCREL {
        Ok(field_addr.wrapping_add(value))
    } else {
        Ok(value)
    }
}

/// Interpreter state while walking a frame program.
struct FrameExecutor<'a> {
    cie: &'a CommonInformationEntry,
    loc: u64,
    cfa: CfaRule,
    regs: HashMap<u64, Rule>,
    initial_regs: HashMap<u64, Rule>,
    stack: Vec<HashMap<u64, Rule>>,
}

impl<'a> FrameExecutor<'a> {
    fn new(cie: &'a CommonInformationEntry, begin: u64) -> Self {
        FrameExecutor {
            cie,
            loc: begin,
            cfa: CfaRule::RegisterOffset { reg: 0, offset: 0 },
            regs: HashMap::new(),
            initial_regs: HashMap::new(),
            stack: Vec::new(),
        }
    }

    /// Snapshot for DW_CFA_restore, taken between the CIE program and the
    /// FDE program.
    fn save_initial_rules(&mut self) {
        self.initial_regs = self.regs.clone();
    }

    fn into_context(self) -> FrameContext {
        FrameContext {
            cfa: self.cfa,
            regs: self.regs,
            ret_addr_reg: self.cie.return_address_register,
        }
    }

    /// Executes instructions while the current location is at or before
    /// `pc`. Instructions between two location advances take effect at the
    /// location reached by the first advance, so the check runs per opcode.
    fn execute(&mut self, instructions: &[u8], pc: u64) -> Result<()> {
        let mut cursor = Cursor::new(instructions, self.cie.endian);
        while !cursor.is_finished() && self.loc <= pc {
            self.step(&mut cursor)?;
        }
        Ok(())
    }

    fn advance_loc(&mut self, delta: u64) {
        self.loc = self
            .loc
            .wrapping_add(delta.wrapping_mul(self.cie.code_alignment_factor));
    }

    fn data_offset(&self, factored: i64) -> i64 {
        factored.wrapping_mul(self.cie.data_alignment_factor)
    }

    fn restore(&mut self, reg: u64) {
        let rule = self
            .initial_regs
            .get(&reg)
            .cloned()
            .unwrap_or(Rule::Undefined);
        self.regs.insert(reg, rule);
    }

    fn step(&mut self, cursor: &mut Cursor) -> Result<()> {
        let opcode = cursor.read_u8()?;
        match opcode & 0xc0 {
            DW_CFA_ADVANCE_LOC => {
                self.advance_loc(u64::from(opcode & 0x3f));
                return Ok(());
            }
            DW_CFA_OFFSET => {
                let offset = cursor.read_uleb128()?;
                self.regs.insert(
                    u64::from(opcode & 0x3f),
                    Rule::Offset(self.data_offset(offset as i64)),
                );
                return Ok(());
            }
            DW_CFA_RESTORE => {
                self.restore(u64::from(opcode & 0x3f));
                return Ok(());
            }
            _ => {}
        }
        match opcode {
            DW_CFA_NOP => {}
            DW_CFA_SET_LOC => {
                let addr = cursor.read_uint(usize::from(self.cie.address_size))?;
                self.loc = addr.wrapping_add(self.cie.static_base);
            }
            DW_CFA_ADVANCE_LOC1 => {
                let delta = cursor.read_u8()?;
                self.advance_loc(u64::from(delta));
            }
            DW_CFA_ADVANCE_LOC2 => {
                let delta = cursor.read_u16()?;
                self.advance_loc(u64::from(delta));
            }
            DW_CFA_ADVANCE_LOC4 => {
                let delta = cursor.read_u32()?;
                self.advance_loc(u64::from(delta));
            }
            DW_CFA_OFFSET_EXTENDED => {
                let reg = cursor.read_uleb128()?;
                let offset = cursor.read_uleb128()?;
                self.regs
                    .insert(reg, Rule::Offset(self.data_offset(offset as i64)));
            }
            DW_CFA_RESTORE_EXTENDED => {
                let reg = cursor.read_uleb128()?;
                self.restore(reg);
            }
            DW_CFA_UNDEFINED => {
                let reg = cursor.read_uleb128()?;
                self.regs.insert(reg, Rule::Undefined);
            }
            DW_CFA_SAME_VALUE => {
                let reg = cursor.read_uleb128()?;
                self.regs.insert(reg, Rule::SameValue);
            }
            DW_CFA_REGISTER => {
                let reg = cursor.read_uleb128()?;
                let from = cursor.read_uleb128()?;
                self.regs.insert(reg, Rule::Register(from));
            }
            DW_CFA_REMEMBER_STATE => {
                self.stack.push(self.regs.clone());
            }
            DW_CFA_RESTORE_STATE => {
                self.regs = self.stack.pop().ok_or(DecodeError::InvalidCFIState)?;
            }
            DW_CFA_DEF_CFA => {
                let reg = cursor.read_uleb128()?;
                let offset = cursor.read_uleb128()? as i64;
                self.cfa = CfaRule::RegisterOffset { reg, offset };
            }
            DW_CFA_DEF_CFA_REGISTER => {
                let reg = cursor.read_uleb128()?;
                let offset = match self.cfa {
                    CfaRule::RegisterOffset { offset, .. } => offset,
                    CfaRule::Expression(_) => 0,
                };
                self.cfa = CfaRule::RegisterOffset { reg, offset };
            }
            DW_CFA_DEF_CFA_OFFSET => {
                let offset = cursor.read_uleb128()? as i64;
                if let CfaRule::RegisterOffset { reg, .. } = self.cfa {
                    self.cfa = CfaRule::RegisterOffset { reg, offset };
                }
            }
            DW_CFA_DEF_CFA_EXPRESSION => {
                let size = cursor.read_uleb128()? as usize;
                let expr = cursor.read_bytes(size)?;
                self.cfa = CfaRule::Expression(expr.to_vec());
            }
            DW_CFA_EXPRESSION => {
                let reg = cursor.read_uleb128()?;
                let size = cursor.read_uleb128()? as usize;
                cursor.advance(size)?;
                self.regs.insert(reg, Rule::Unsupported);
            }
            DW_CFA_OFFSET_EXTENDED_SF => {
                let reg = cursor.read_uleb128()?;
                let offset = cursor.read_sleb128()?;
                self.regs.insert(reg, Rule::Offset(self.data_offset(offset)));
            }
            DW_CFA_DEF_CFA_SF => {
                let reg = cursor.read_uleb128()?;
                let offset = cursor.read_sleb128()?;
                self.cfa = CfaRule::RegisterOffset {
                    reg,
                    offset: self.data_offset(offset),
                };
            }
            DW_CFA_DEF_CFA_OFFSET_SF => {
                let offset = cursor.read_sleb128()?;
                if let CfaRule::RegisterOffset { reg, .. } = self.cfa {
                    self.cfa = CfaRule::RegisterOffset {
                        reg,
                        offset: self.data_offset(offset),
                    };
                }
            }
            DW_CFA_VAL_OFFSET => {
                let reg = cursor.read_uleb128()?;
                let _ = cursor.read_uleb128()?;
                self.regs.insert(reg, Rule::Unsupported);
            }
            DW_CFA_VAL_OFFSET_SF => {
                let reg = cursor.read_uleb128()?;
                let _ = cursor.read_sleb128()?;
                self.regs.insert(reg, Rule::Unsupported);
            }
            DW_CFA_VAL_EXPRESSION => {
                let reg = cursor.read_uleb128()?;
                let size = cursor.read_uleb128()? as usize;
                let expr = cursor.read_bytes(size)?;
                self.regs.insert(reg, Rule::ValExpression(expr.to_vec()));
            }
            DW_CFA_GNU_WINDOW_SAVE => {} // SPARC register windows, nothing to track
            DW_CFA_GNU_ARGS_SIZE => {
                let _ = cursor.read_uleb128()?;
            }
            DW_CFA_GNU_NEGATIVE_OFFSET_EXTENDED => {
                let reg = cursor.read_uleb128()?;
                let offset = cursor.read_uleb128()?;
                self.regs.insert(
                    reg,
                    Rule::Offset(self.data_offset(offset as i64).wrapping_neg()),
                );
            }
            _ => return Err(DecodeError::UnknownCFIInstruction { opcode }),
        }
        Ok(())
    }
}
