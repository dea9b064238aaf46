// DWARF register numbers from the System V ABI processor supplements.

pub const AMD64_RAX: u64 = 0;
pub const AMD64_RDX: u64 = 1;
pub const AMD64_RCX: u64 = 2;
pub const AMD64_RBX: u64 = 3;
pub const AMD64_RSI: u64 = 4;
pub const AMD64_RDI: u64 = 5;
pub const AMD64_RBP: u64 = 6;
pub const AMD64_RSP: u64 = 7;
pub const AMD64_RIP: u64 = 16;
pub const AMD64_RFLAGS: u64 = 49;
pub const AMD64_FS_BASE: u64 = 58;
pub const AMD64_GS_BASE: u64 = 59;

pub const ARM64_X0: u64 = 0;
pub const ARM64_LR: u64 = 30;
pub const ARM64_SP: u64 = 31;
pub const ARM64_PC: u64 = 32;
pub const ARM64_V0: u64 = 64;

/// Name of an x86-64 DWARF register number, `unknown<n>` if unassigned.
pub fn amd64_to_name(num: u64) -> String {
    match num {
        0 => "Rax".to_string(),
        1 => "Rdx".to_string(),
        2 => "Rcx".to_string(),
        3 => "Rbx".to_string(),
        4 => "Rsi".to_string(),
        5 => "Rdi".to_string(),
        6 => "Rbp".to_string(),
        7 => "Rsp".to_string(),
        8..=15 => format!("R{num}"),
        16 => "Rip".to_string(),
        17..=32 => format!("XMM{}", num - 17),
        33..=40 => format!("ST({})", num - 33),
        49 => "Rflags".to_string(),
        50 => "Es".to_string(),
        51 => "Cs".to_string(),
        52 => "Ss".to_string(),
        53 => "Ds".to_string(),
        54 => "Fs".to_string(),
        55 => "Gs".to_string(),
        58 => "Fs_base".to_string(),
        59 => "Gs_base".to_string(),
        64 => "MXCSR".to_string(),
        65 => "CW".to_string(),
        66 => "SW".to_string(),
        _ => format!("unknown{num}"),
    }
}

/// Name of an AArch64 DWARF register number, `unknown<n>` if unassigned.
pub fn arm64_to_name(num: u64) -> String {
    match num {
        0..=30 => format!("X{num}"),
        31 => "SP".to_string(),
        32 => "PC".to_string(),
        64..=95 => format!("V{}", num - 64),
        _ => format!("unknown{num}"),
    }
}
