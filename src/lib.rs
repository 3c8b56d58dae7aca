//! Rewrites JVM class files compiled for a newer target so they load on an older,
//! stricter verifier.
//!
//! A class goes through three kinds of edits: exact substitution of constant pool
//! text, retargeting of selected call sites to another owner class, and a small
//! set of pattern-driven rewrites of method bodies. See [`Downgrader`] for the
//! per-class engine and [`batch`] for running it over directories.

mod macros;

pub mod batch;
pub mod builder;
pub mod class_reader;
pub mod class_writer;
pub mod config;
pub mod constant_pool;
pub mod constants;
pub mod downgrader;
pub mod editor;
pub mod error;
pub mod insn;
pub mod method_code;
pub mod opcodes;
pub mod pattern;
pub mod retarget;
pub mod rules;
pub mod substitution;

pub use config::DowngradeConfig;
pub use downgrader::{Downgrader, Outcome, Status, VersionGate};
pub use error::{
    ClassReadError, ClassWriteError, ConfigError, DowngradeError, EditError, Error,
    RetargetFailure, SymbolError,
};
