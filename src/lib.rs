//! Decoders for the DWARF debug information a native-code debugger leans on:
//! the `.debug_line` line-number programs mapping machine addresses to source
//! positions, and the `.debug_frame`/`.eh_frame` call frame information that
//! drives stack unwinding. Both are byte-code formats; this crate parses the
//! containers and interprets the programs.

pub mod cursor;
pub mod error;
pub mod frame;
pub mod line;
pub mod regnum;
pub mod sections;

pub use cursor::{Cursor, Endian};
pub use error::{DecodeError, Result, SectionError};
