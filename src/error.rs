use std::path::PathBuf;

use crate::insn::InsnHandle;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("class read error")]
    ClassRead(#[from] ClassReadError),
    #[error("class write error")]
    ClassWrite(#[from] ClassWriteError),
    #[error("constant pool error")]
    Symbol(#[from] SymbolError),
    #[error("downgrade failed")]
    Downgrade(#[from] DowngradeError),
    #[error("configuration error")]
    Config(#[from] ConfigError),
    #[error("i/o error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum ClassReadError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("invalid magic 0x{0:08x}")]
    InvalidMagic(u32),
    #[error("invalid constant pool tag {0}")]
    InvalidConstantPoolTag(u8),
    #[error("invalid constant pool index {0}")]
    InvalidIndex(u16),
    #[error("invalid attribute {0}")]
    InvalidAttribute(String),
    #[error("invalid opcode 0x{opcode:02x} at {offset}")]
    InvalidOpcode {
        /// The opcode that caused the error.
        opcode: u8,
        /// Offset into the byte sequence where the error occurred.
        offset: usize,
    },
    #[error("branch at {offset} targets {target}, which is not an instruction boundary")]
    InvalidBranchTarget { offset: usize, target: i64 },
    #[error("modified utf8 error: {0}")]
    Utf8Error(String),
    #[error("{0} trailing bytes after class file")]
    TrailingBytes(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum ClassWriteError {
    #[error("missing constant pool")]
    MissingConstantPool,
    #[error("invalid constant pool")]
    InvalidConstantPool,
    #[error("branch offset {offset} out of range for opcode 0x{opcode:02X}")]
    BranchOutOfRange { opcode: u8, offset: i64 },
    #[error("code length {0} exceeds 65535 bytes")]
    CodeTooLarge(usize),
    #[error("reference to deleted instruction {0}")]
    DeadHandle(InsnHandle),
    #[error("stack analysis error: {0}")]
    StackAnalysis(String),
}

/// Failures resolving or allocating constant pool entries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SymbolError {
    #[error("constant pool index {0} is out of range")]
    InvalidIndex(u16),
    #[error("constant pool index {index} is not a {expected} entry")]
    UnexpectedKind { index: u16, expected: &'static str },
    #[error("constant pool is full")]
    PoolOverflow,
}

/// Failures of a single instruction list edit. The list is unchanged when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    #[error("handle {0} is not a live instruction")]
    NotLive(InsnHandle),
    #[error("span {from}..={to} is not a forward range of live instructions")]
    InvalidSpan { from: InsnHandle, to: InsnHandle },
    #[error("{referrers} reference(s) to {handle} have no surviving instruction to move to")]
    TargetLost { handle: InsnHandle, referrers: usize },
}

/// An editor failure reported against the method and match that triggered it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("rule {rule} failed in {method} at {matched:?}")]
pub struct RetargetFailure {
    pub rule: &'static str,
    pub method: String,
    pub matched: Vec<InsnHandle>,
    #[source]
    pub source: EditError,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration")]
    Parse(#[from] toml::de::Error),
    #[error("substitution key must not be empty")]
    EmptyKey,
    #[error("substitution for {key:?} produces {replacement:?}, which is itself a key")]
    ChainedSubstitution { key: String, replacement: String },
    #[error("retarget entry {owner}.{name}{descriptor} is registered twice")]
    DuplicateRetarget {
        owner: String,
        name: String,
        descriptor: String,
    },
    #[error("retarget entry {owner}.{name}{descriptor} has an empty field")]
    IncompleteRetarget {
        owner: String,
        name: String,
        descriptor: String,
    },
}

/// Per-unit failures of the rewrite engine. Any of these abandons the unit before it is encoded.
#[derive(Debug, thiserror::Error)]
pub enum DowngradeError {
    #[error("constant pool error")]
    Symbol(#[from] SymbolError),
    #[error("failed to decode method {method}")]
    DecodeCode {
        method: String,
        #[source]
        source: ClassReadError,
    },
    #[error("failed to encode method {method}")]
    EncodeCode {
        method: String,
        #[source]
        source: ClassWriteError,
    },
}
