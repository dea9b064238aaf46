use thiserror::Error;

/// Errors produced while decoding DWARF byte streams.
///
/// Offsets are relative to the start of the buffer handed to the decoder,
/// which for the usual entry points is the start of the section.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("input ends early at offset {offset:#x}")]
    TruncatedInput { offset: usize },
    #[error("LEB128 value does not terminate at offset {offset:#x}")]
    MalformedVarint { offset: usize },
    #[error("unsupported DWARF version {version}")]
    UnsupportedVersion { version: u16 },
    #[error("invalid header at offset {offset:#x}: {what}")]
    InvalidHeader { offset: usize, what: &'static str },
    #[error("file index {index} is not in the file table")]
    InvalidFileIndex { index: u64 },
    #[error("FDE references a CIE at offset {offset:#x} that was never parsed")]
    DanglingCIEReference { offset: u64 },
    #[error("restore_state without a matching remember_state")]
    InvalidCFIState,
    #[error("unknown call frame instruction {opcode:#04x}")]
    UnknownCFIInstruction { opcode: u8 },
}

pub type Result<T, E = DecodeError> = std::result::Result<T, E>;

/// Errors from loading debug sections out of a binary.
#[derive(Error, Debug)]
pub enum SectionError {
    #[error("could not find .debug_{0} or .zdebug_{0} section")]
    Missing(String),
    #[error("malformed object file: {0}")]
    Object(#[from] object::read::Error),
    #[error("zlib inflate failed: {0}")]
    Inflate(std::io::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
