//! Editable form of a method body.
//!
//! A [`MethodCode`] owns the instruction list together with everything that points
//! into it. Ranges are half-open: `start` is the first covered instruction and `end`
//! is the first instruction past the range, with `None` meaning the end of the code.
//! The editing operations live in [`crate::editor`].

use crate::class_reader::{self, AttributeInfo, CodeAttribute};
use crate::class_writer;
use crate::error::{ClassReadError, ClassWriteError};
use crate::insn::{InsnHandle, InsnList};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryCatchBlock {
    pub start: InsnHandle,
    pub end: Option<InsnHandle>,
    pub handler: InsnHandle,
    /// `Class` index of the caught type, 0 for catch-all.
    pub catch_type: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumberNode {
    pub start: InsnHandle,
    pub line: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalVariableNode {
    pub start: InsnHandle,
    pub end: Option<InsnHandle>,
    pub name_index: u16,
    /// Descriptor for `LocalVariableTable`, signature for `LocalVariableTypeTable`.
    pub descriptor_index: u16,
    pub index: u16,
}

/// Attributes nested in `Code`, in their original order. The debug tables are
/// placeholders; their entries live on [`MethodCode`] as handle ranges.
#[derive(Debug, Clone, PartialEq)]
pub enum NestedAttribute {
    LineNumbers { name_index: u16 },
    LocalVariables { name_index: u16 },
    LocalVariableTypes { name_index: u16 },
    Other(AttributeInfo),
}

#[derive(Debug, Clone)]
pub struct MethodCode {
    pub max_stack: u16,
    pub max_locals: u16,
    pub insns: InsnList,
    pub try_catch_blocks: Vec<TryCatchBlock>,
    pub line_numbers: Vec<LineNumberNode>,
    pub local_variables: Vec<LocalVariableNode>,
    pub local_variable_types: Vec<LocalVariableNode>,
    pub attributes: Vec<NestedAttribute>,
}

impl MethodCode {
    pub fn new(max_stack: u16, max_locals: u16, insns: InsnList) -> Self {
        Self {
            max_stack,
            max_locals,
            insns,
            try_catch_blocks: Vec::new(),
            line_numbers: Vec::new(),
            local_variables: Vec::new(),
            local_variable_types: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn decode(attribute: &CodeAttribute) -> Result<Self, ClassReadError> {
        class_reader::read_method_code(attribute)
    }

    /// Lays the instructions out again and produces a `Code` attribute named by `name_index`.
    pub fn encode(&self, name_index: u16) -> Result<CodeAttribute, ClassWriteError> {
        class_writer::write_method_code(self, name_index)
    }
}
