use std::collections::HashMap;

use crate::constant_pool::{Constant, ConstantPool};
use crate::constants::{ACC_ABSTRACT, ACC_NATIVE, CLASS_MAGIC};
use crate::error::{ClassReadError, SymbolError};
use crate::insn::{
    FieldInsnNode, IincInsnNode, Insn, InsnHandle, InsnList, InsnNode, IntInsnNode,
    InvokeDynamicInsnNode, InvokeInterfaceInsnNode, JumpInsnNode, LdcInsnNode,
    LookupSwitchInsnNode, MethodInsnNode, MultiANewArrayInsnNode, TableSwitchInsnNode,
    TypeInsnNode, VarInsnNode,
};
use crate::method_code::{
    LineNumberNode, LocalVariableNode, MethodCode, NestedAttribute, TryCatchBlock,
};

pub const CODE: &str = "Code";
pub const LINE_NUMBER_TABLE: &str = "LineNumberTable";
pub const LOCAL_VARIABLE_TABLE: &str = "LocalVariableTable";
pub const LOCAL_VARIABLE_TYPE_TABLE: &str = "LocalVariableTypeTable";
pub const STACK_MAP_TABLE: &str = "StackMapTable";

/// A decoded class file. Everything outside method bodies stays close to the wire format.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<AttributeInfo>,
}

impl ClassFile {
    pub fn name(&self) -> Result<&str, SymbolError> {
        self.constant_pool.class_name(self.this_class)
    }

    pub fn method_name(&self, method: &MethodInfo) -> Result<&str, SymbolError> {
        self.constant_pool.utf8(method.name_index)
    }

    pub fn method_descriptor(&self, method: &MethodInfo) -> Result<&str, SymbolError> {
        self.constant_pool.utf8(method.descriptor_index)
    }

    /// `name` followed by the descriptor, for diagnostics.
    pub fn method_signature(&self, method: &MethodInfo) -> String {
        match (self.method_name(method), self.method_descriptor(method)) {
            (Ok(name), Ok(descriptor)) => format!("{name}{descriptor}"),
            _ => format!("<method #{}>", method.name_index),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

impl MethodInfo {
    pub fn code(&self) -> Option<&CodeAttribute> {
        self.attributes.iter().find_map(|attr| match attr {
            AttributeInfo::Code(code) => Some(code),
            _ => None,
        })
    }

    pub fn code_mut(&mut self) -> Option<&mut CodeAttribute> {
        self.attributes.iter_mut().find_map(|attr| match attr {
            AttributeInfo::Code(code) => Some(code),
            _ => None,
        })
    }

    /// Has a body to rewrite: not abstract, not native, and carries `Code`.
    pub fn is_concrete(&self) -> bool {
        self.access_flags & (ACC_ABSTRACT | ACC_NATIVE) == 0 && self.code().is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeInfo {
    Code(CodeAttribute),
    LineNumberTable {
        name_index: u16,
        entries: Vec<LineNumber>,
    },
    LocalVariableTable {
        name_index: u16,
        entries: Vec<LocalVariable>,
    },
    /// Same layout as `LocalVariableTable`, with signatures in place of descriptors.
    LocalVariableTypeTable {
        name_index: u16,
        entries: Vec<LocalVariable>,
    },
    Raw {
        name_index: u16,
        name: String,
        info: Vec<u8>,
    },
}

impl AttributeInfo {
    pub fn name_index(&self) -> u16 {
        match self {
            AttributeInfo::Code(code) => code.name_index,
            AttributeInfo::LineNumberTable { name_index, .. }
            | AttributeInfo::LocalVariableTable { name_index, .. }
            | AttributeInfo::LocalVariableTypeTable { name_index, .. }
            | AttributeInfo::Raw { name_index, .. } => *name_index,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AttributeInfo::Code(_) => CODE,
            AttributeInfo::LineNumberTable { .. } => LINE_NUMBER_TABLE,
            AttributeInfo::LocalVariableTable { .. } => LOCAL_VARIABLE_TABLE,
            AttributeInfo::LocalVariableTypeTable { .. } => LOCAL_VARIABLE_TYPE_TABLE,
            AttributeInfo::Raw { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodeAttribute {
    pub name_index: u16,
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumber {
    pub start_pc: u16,
    pub line_number: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalVariable {
    pub start_pc: u16,
    pub length: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub index: u16,
}

pub fn read_class_file(bytes: &[u8]) -> Result<ClassFile, ClassReadError> {
    let mut reader = ByteReader::new(bytes);
    let magic = reader.read_u4()?;
    if magic != CLASS_MAGIC {
        return Err(ClassReadError::InvalidMagic(magic));
    }
    let minor_version = reader.read_u2()?;
    let major_version = reader.read_u2()?;
    let constant_pool = read_constant_pool(&mut reader)?;
    let access_flags = reader.read_u2()?;
    let this_class = reader.read_u2()?;
    let super_class = reader.read_u2()?;
    let interfaces = read_u2_table(&mut reader)?;
    let fields = read_fields(&mut reader, &constant_pool)?;
    let methods = read_methods(&mut reader, &constant_pool)?;
    let attributes = read_attributes(&mut reader, &constant_pool)?;
    if reader.remaining() > 0 {
        return Err(ClassReadError::TrailingBytes(reader.remaining()));
    }

    Ok(ClassFile {
        minor_version,
        major_version,
        constant_pool,
        access_flags,
        this_class,
        super_class,
        interfaces,
        fields,
        methods,
        attributes,
    })
}

fn read_constant_pool(reader: &mut ByteReader<'_>) -> Result<ConstantPool, ClassReadError> {
    let count = reader.read_u2()? as usize;
    let mut entries = Vec::with_capacity(count);
    entries.push(Constant::Reserved);

    while entries.len() < count {
        let tag = reader.read_u1()?;
        let entry = match tag {
            1 => {
                let len = reader.read_u2()? as usize;
                let bytes = reader.read_bytes(len)?;
                Constant::Utf8(decode_modified_utf8(bytes)?)
            }
            3 => Constant::Integer(reader.read_u4()? as i32),
            4 => Constant::Float(f32::from_bits(reader.read_u4()?)),
            5 => Constant::Long(reader.read_u8()? as i64),
            6 => Constant::Double(f64::from_bits(reader.read_u8()?)),
            7 => Constant::Class {
                name_index: reader.read_u2()?,
            },
            8 => Constant::String {
                string_index: reader.read_u2()?,
            },
            9 => Constant::Fieldref {
                class_index: reader.read_u2()?,
                name_and_type_index: reader.read_u2()?,
            },
            10 => Constant::Methodref {
                class_index: reader.read_u2()?,
                name_and_type_index: reader.read_u2()?,
            },
            11 => Constant::InterfaceMethodref {
                class_index: reader.read_u2()?,
                name_and_type_index: reader.read_u2()?,
            },
            12 => Constant::NameAndType {
                name_index: reader.read_u2()?,
                descriptor_index: reader.read_u2()?,
            },
            15 => Constant::MethodHandle {
                reference_kind: reader.read_u1()?,
                reference_index: reader.read_u2()?,
            },
            16 => Constant::MethodType {
                descriptor_index: reader.read_u2()?,
            },
            17 => Constant::Dynamic {
                bootstrap_method_attr_index: reader.read_u2()?,
                name_and_type_index: reader.read_u2()?,
            },
            18 => Constant::InvokeDynamic {
                bootstrap_method_attr_index: reader.read_u2()?,
                name_and_type_index: reader.read_u2()?,
            },
            19 => Constant::Module {
                name_index: reader.read_u2()?,
            },
            20 => Constant::Package {
                name_index: reader.read_u2()?,
            },
            _ => return Err(ClassReadError::InvalidConstantPoolTag(tag)),
        };

        let wide = entry.is_wide();
        entries.push(entry);
        if wide {
            entries.push(Constant::Reserved);
        }
    }

    // A wide entry in the last slot overshoots the declared count.
    if entries.len() != count {
        return Err(ClassReadError::InvalidIndex(count as u16));
    }
    Ok(ConstantPool::from_entries(entries))
}

fn read_u2_table(reader: &mut ByteReader<'_>) -> Result<Vec<u16>, ClassReadError> {
    let count = reader.read_u2()? as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(reader.read_u2()?);
    }
    Ok(values)
}

fn read_fields(
    reader: &mut ByteReader<'_>,
    cp: &ConstantPool,
) -> Result<Vec<FieldInfo>, ClassReadError> {
    let count = reader.read_u2()? as usize;
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        fields.push(FieldInfo {
            access_flags: reader.read_u2()?,
            name_index: reader.read_u2()?,
            descriptor_index: reader.read_u2()?,
            attributes: read_attributes(reader, cp)?,
        });
    }
    Ok(fields)
}

fn read_methods(
    reader: &mut ByteReader<'_>,
    cp: &ConstantPool,
) -> Result<Vec<MethodInfo>, ClassReadError> {
    let count = reader.read_u2()? as usize;
    let mut methods = Vec::with_capacity(count);
    for _ in 0..count {
        methods.push(MethodInfo {
            access_flags: reader.read_u2()?,
            name_index: reader.read_u2()?,
            descriptor_index: reader.read_u2()?,
            attributes: read_attributes(reader, cp)?,
        });
    }
    Ok(methods)
}

fn read_attributes(
    reader: &mut ByteReader<'_>,
    cp: &ConstantPool,
) -> Result<Vec<AttributeInfo>, ClassReadError> {
    let count = reader.read_u2()? as usize;
    let mut attributes = Vec::with_capacity(count);
    for _ in 0..count {
        let name_index = reader.read_u2()?;
        let length = reader.read_u4()? as usize;
        let name = cp
            .utf8(name_index)
            .map_err(|_| ClassReadError::InvalidIndex(name_index))?;
        let info = reader.read_bytes(length)?;
        attributes.push(parse_attribute(name_index, name, info, cp)?);
    }
    Ok(attributes)
}

fn parse_attribute(
    name_index: u16,
    name: &str,
    info: &[u8],
    cp: &ConstantPool,
) -> Result<AttributeInfo, ClassReadError> {
    let mut reader = ByteReader::new(info);
    let attribute = match name {
        CODE => {
            let max_stack = reader.read_u2()?;
            let max_locals = reader.read_u2()?;
            let code_length = reader.read_u4()? as usize;
            let code = reader.read_bytes(code_length)?.to_vec();
            let exception_table_length = reader.read_u2()? as usize;
            let mut exception_table = Vec::with_capacity(exception_table_length);
            for _ in 0..exception_table_length {
                exception_table.push(ExceptionTableEntry {
                    start_pc: reader.read_u2()?,
                    end_pc: reader.read_u2()?,
                    handler_pc: reader.read_u2()?,
                    catch_type: reader.read_u2()?,
                });
            }
            let attributes = read_attributes(&mut reader, cp)?;
            AttributeInfo::Code(CodeAttribute {
                name_index,
                max_stack,
                max_locals,
                code,
                exception_table,
                attributes,
            })
        }
        LINE_NUMBER_TABLE => {
            let count = reader.read_u2()? as usize;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                entries.push(LineNumber {
                    start_pc: reader.read_u2()?,
                    line_number: reader.read_u2()?,
                });
            }
            AttributeInfo::LineNumberTable {
                name_index,
                entries,
            }
        }
        LOCAL_VARIABLE_TABLE | LOCAL_VARIABLE_TYPE_TABLE => {
            let count = reader.read_u2()? as usize;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                entries.push(LocalVariable {
                    start_pc: reader.read_u2()?,
                    length: reader.read_u2()?,
                    name_index: reader.read_u2()?,
                    descriptor_index: reader.read_u2()?,
                    index: reader.read_u2()?,
                });
            }
            if name == LOCAL_VARIABLE_TABLE {
                AttributeInfo::LocalVariableTable {
                    name_index,
                    entries,
                }
            } else {
                AttributeInfo::LocalVariableTypeTable {
                    name_index,
                    entries,
                }
            }
        }
        _ => {
            return Ok(AttributeInfo::Raw {
                name_index,
                name: name.to_string(),
                info: info.to_vec(),
            });
        }
    };

    if reader.remaining() > 0 {
        return Err(ClassReadError::InvalidAttribute(format!(
            "{name} has {} unread bytes",
            reader.remaining()
        )));
    }
    Ok(attribute)
}

pub(crate) fn decode_modified_utf8(bytes: &[u8]) -> Result<String, ClassReadError> {
    let mut code_units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let byte = bytes[i];
        if byte == 0 {
            return Err(ClassReadError::Utf8Error("raw nul byte".to_string()));
        } else if byte & 0x80 == 0 {
            code_units.push(byte as u16);
            i += 1;
        } else if byte & 0xE0 == 0xC0 {
            let byte2 = *bytes
                .get(i + 1)
                .ok_or_else(|| ClassReadError::Utf8Error("truncated 2-byte".to_string()))?;
            if byte2 & 0xC0 != 0x80 {
                return Err(ClassReadError::Utf8Error("invalid 2-byte".to_string()));
            }
            code_units.push((((byte & 0x1F) as u16) << 6) | ((byte2 & 0x3F) as u16));
            i += 2;
        } else if byte & 0xF0 == 0xE0 {
            if i + 2 >= bytes.len() {
                return Err(ClassReadError::Utf8Error("truncated 3-byte".to_string()));
            }
            let byte2 = bytes[i + 1];
            let byte3 = bytes[i + 2];
            if byte2 & 0xC0 != 0x80 || byte3 & 0xC0 != 0x80 {
                return Err(ClassReadError::Utf8Error("invalid 3-byte".to_string()));
            }
            code_units.push(
                (((byte & 0x0F) as u16) << 12)
                    | (((byte2 & 0x3F) as u16) << 6)
                    | ((byte3 & 0x3F) as u16),
            );
            i += 3;
        } else {
            return Err(ClassReadError::Utf8Error(
                "invalid leading byte".to_string(),
            ));
        }
    }

    // Supplementary characters arrive as surrogate pairs, which from_utf16 joins.
    String::from_utf16(&code_units)
        .map_err(|_| ClassReadError::Utf8Error("unpaired surrogate".to_string()))
}

/// Lifts a `Code` attribute into an editable [`MethodCode`].
///
/// Branch offsets become handles, as do the exception table and the line number and
/// local variable tables. Every offset they mention must land on an instruction
/// boundary; an exclusive end equal to the code length becomes `None`.
pub fn read_method_code(attribute: &CodeAttribute) -> Result<MethodCode, ClassReadError> {
    // First pass only finds instruction boundaries, so targets resolve to a placeholder.
    let placeholder = InsnHandle::new(0);
    let layout = parse_instructions(&attribute.code, &mut |_, _| Ok(placeholder))?;
    let boundaries: HashMap<usize, InsnHandle> = layout
        .iter()
        .enumerate()
        .map(|(ordinal, (offset, _))| (*offset, InsnHandle::new(ordinal)))
        .collect();

    let code_length = attribute.code.len();
    let at = |offset: usize| -> Option<InsnHandle> { boundaries.get(&offset).copied() };
    let end_at = |offset: usize| -> Result<Option<InsnHandle>, ClassReadError> {
        if offset == code_length {
            Ok(None)
        } else {
            at(offset)
                .map(Some)
                .ok_or_else(|| ClassReadError::InvalidAttribute(format!("range end {offset}")))
        }
    };

    let parsed = parse_instructions(&attribute.code, &mut |offset, target| {
        usize::try_from(target)
            .ok()
            .and_then(at)
            .ok_or(ClassReadError::InvalidBranchTarget { offset, target })
    })?;
    let mut insns = InsnList::new();
    for (_, insn) in parsed {
        insns.push(insn);
    }

    let mut try_catch_blocks = Vec::with_capacity(attribute.exception_table.len());
    for entry in &attribute.exception_table {
        let start = at(entry.start_pc as usize).ok_or_else(|| {
            ClassReadError::InvalidAttribute(format!("exception start {}", entry.start_pc))
        })?;
        let handler = at(entry.handler_pc as usize).ok_or_else(|| {
            ClassReadError::InvalidAttribute(format!("exception handler {}", entry.handler_pc))
        })?;
        try_catch_blocks.push(TryCatchBlock {
            start,
            end: end_at(entry.end_pc as usize)?,
            handler,
            catch_type: entry.catch_type,
        });
    }

    let mut code = MethodCode {
        max_stack: attribute.max_stack,
        max_locals: attribute.max_locals,
        insns,
        try_catch_blocks,
        line_numbers: Vec::new(),
        local_variables: Vec::new(),
        local_variable_types: Vec::new(),
        attributes: Vec::new(),
    };

    let local_nodes = |entries: &[LocalVariable]| -> Result<Vec<LocalVariableNode>, ClassReadError> {
        entries
            .iter()
            .map(|entry| -> Result<LocalVariableNode, ClassReadError> {
                let start = at(entry.start_pc as usize).ok_or_else(|| {
                    ClassReadError::InvalidAttribute(format!("local start {}", entry.start_pc))
                })?;
                Ok(LocalVariableNode {
                    start,
                    end: end_at(entry.start_pc as usize + entry.length as usize)?,
                    name_index: entry.name_index,
                    descriptor_index: entry.descriptor_index,
                    index: entry.index,
                })
            })
            .collect()
    };

    // Repeated debug tables are merged into the first one of their kind.
    let mut seen_lines = false;
    let mut seen_locals = false;
    let mut seen_types = false;
    for attr in &attribute.attributes {
        match attr {
            AttributeInfo::LineNumberTable {
                name_index,
                entries,
            } => {
                for entry in entries {
                    let start = at(entry.start_pc as usize).ok_or_else(|| {
                        ClassReadError::InvalidAttribute(format!("line start {}", entry.start_pc))
                    })?;
                    code.line_numbers.push(LineNumberNode {
                        start,
                        line: entry.line_number,
                    });
                }
                if !std::mem::replace(&mut seen_lines, true) {
                    code.attributes.push(NestedAttribute::LineNumbers {
                        name_index: *name_index,
                    });
                }
            }
            AttributeInfo::LocalVariableTable {
                name_index,
                entries,
            } => {
                code.local_variables.extend(local_nodes(entries)?);
                if !std::mem::replace(&mut seen_locals, true) {
                    code.attributes.push(NestedAttribute::LocalVariables {
                        name_index: *name_index,
                    });
                }
            }
            AttributeInfo::LocalVariableTypeTable {
                name_index,
                entries,
            } => {
                code.local_variable_types.extend(local_nodes(entries)?);
                if !std::mem::replace(&mut seen_types, true) {
                    code.attributes.push(NestedAttribute::LocalVariableTypes {
                        name_index: *name_index,
                    });
                }
            }
            other => code.attributes.push(NestedAttribute::Other(other.clone())),
        }
    }

    Ok(code)
}

type ResolveTarget<'r> = dyn FnMut(usize, i64) -> Result<InsnHandle, ClassReadError> + 'r;

/// Decodes `code` into `(offset, insn)` pairs, turning each absolute branch target into a
/// handle through `resolve`.
fn parse_instructions(
    code: &[u8],
    resolve: &mut ResolveTarget<'_>,
) -> Result<Vec<(usize, Insn)>, ClassReadError> {
    let mut reader = ByteReader::new(code);
    let mut insns = Vec::new();

    while reader.remaining() > 0 {
        let opcode_offset = reader.pos();
        let opcode = reader.read_u1()?;
        let base = opcode_offset as i64;
        let insn = match opcode {
            0x00..=0x0F => Insn::Simple(InsnNode { opcode }),
            0x10 => Insn::Int(IntInsnNode {
                insn: InsnNode { opcode },
                operand: reader.read_i1()? as i32,
            }),
            0x11 => Insn::Int(IntInsnNode {
                insn: InsnNode { opcode },
                operand: reader.read_i2()? as i32,
            }),
            0x12 => Insn::Ldc(LdcInsnNode {
                insn: InsnNode { opcode },
                index: reader.read_u1()? as u16,
            }),
            0x13 | 0x14 => Insn::Ldc(LdcInsnNode {
                insn: InsnNode { opcode },
                index: reader.read_u2()?,
            }),
            0x15..=0x19 | 0x36..=0x3A | 0xA9 => Insn::Var(VarInsnNode {
                insn: InsnNode { opcode },
                var_index: reader.read_u1()? as u16,
            }),
            0x1A..=0x35 | 0x3B..=0x83 => Insn::Simple(InsnNode { opcode }),
            0x84 => Insn::Iinc(IincInsnNode {
                insn: InsnNode { opcode },
                var_index: reader.read_u1()? as u16,
                increment: reader.read_i1()? as i16,
            }),
            0x85..=0x98 => Insn::Simple(InsnNode { opcode }),
            0x99..=0xA8 | 0xC6 | 0xC7 => {
                let delta = reader.read_i2()? as i64;
                Insn::Jump(JumpInsnNode {
                    insn: InsnNode { opcode },
                    target: resolve(opcode_offset, base + delta)?,
                })
            }
            0xAA => {
                reader.align4(opcode_offset)?;
                let default = resolve(opcode_offset, base + reader.read_i4()? as i64)?;
                let low = reader.read_i4()?;
                let high = reader.read_i4()?;
                if high < low {
                    return Err(ClassReadError::InvalidOpcode {
                        opcode,
                        offset: opcode_offset,
                    });
                }
                let count = (high as i64 - low as i64 + 1) as usize;
                let mut targets = Vec::with_capacity(count);
                for _ in 0..count {
                    targets.push(resolve(opcode_offset, base + reader.read_i4()? as i64)?);
                }
                Insn::TableSwitch(TableSwitchInsnNode {
                    insn: InsnNode { opcode },
                    default,
                    low,
                    high,
                    targets,
                })
            }
            0xAB => {
                reader.align4(opcode_offset)?;
                let default = resolve(opcode_offset, base + reader.read_i4()? as i64)?;
                let npairs = reader.read_i4()?;
                if npairs < 0 {
                    return Err(ClassReadError::InvalidOpcode {
                        opcode,
                        offset: opcode_offset,
                    });
                }
                let mut pairs = Vec::with_capacity(npairs as usize);
                for _ in 0..npairs {
                    let key = reader.read_i4()?;
                    let target = resolve(opcode_offset, base + reader.read_i4()? as i64)?;
                    pairs.push((key, target));
                }
                Insn::LookupSwitch(LookupSwitchInsnNode {
                    insn: InsnNode { opcode },
                    default,
                    pairs,
                })
            }
            0xAC..=0xB1 => Insn::Simple(InsnNode { opcode }),
            0xB2..=0xB5 => Insn::Field(FieldInsnNode {
                insn: InsnNode { opcode },
                field_index: reader.read_u2()?,
            }),
            0xB6..=0xB8 => Insn::Method(MethodInsnNode {
                insn: InsnNode { opcode },
                method_index: reader.read_u2()?,
            }),
            0xB9 => {
                let method_index = reader.read_u2()?;
                let count = reader.read_u1()?;
                let _ = reader.read_u1()?;
                Insn::InvokeInterface(InvokeInterfaceInsnNode {
                    insn: InsnNode { opcode },
                    method_index,
                    count,
                })
            }
            0xBA => {
                let method_index = reader.read_u2()?;
                let _ = reader.read_u2()?;
                Insn::InvokeDynamic(InvokeDynamicInsnNode {
                    insn: InsnNode { opcode },
                    method_index,
                })
            }
            0xBB | 0xBD | 0xC0 | 0xC1 => Insn::Type(TypeInsnNode {
                insn: InsnNode { opcode },
                type_index: reader.read_u2()?,
            }),
            0xBC => Insn::Int(IntInsnNode {
                insn: InsnNode { opcode },
                operand: reader.read_u1()? as i32,
            }),
            0xBE | 0xBF | 0xC2 | 0xC3 => Insn::Simple(InsnNode { opcode }),
            0xC4 => read_wide(&mut reader)?,
            0xC5 => Insn::MultiANewArray(MultiANewArrayInsnNode {
                insn: InsnNode { opcode },
                type_index: reader.read_u2()?,
                dimensions: reader.read_u1()?,
            }),
            0xC8 | 0xC9 => {
                let delta = reader.read_i4()? as i64;
                Insn::Jump(JumpInsnNode {
                    insn: InsnNode { opcode },
                    target: resolve(opcode_offset, base + delta)?,
                })
            }
            0xCA | 0xFE | 0xFF => Insn::Simple(InsnNode { opcode }),
            _ => {
                return Err(ClassReadError::InvalidOpcode {
                    opcode,
                    offset: opcode_offset,
                });
            }
        };

        insns.push((opcode_offset, insn));
    }

    Ok(insns)
}

fn read_wide(reader: &mut ByteReader<'_>) -> Result<Insn, ClassReadError> {
    let opcode = reader.read_u1()?;
    match opcode {
        0x15..=0x19 | 0x36..=0x3A | 0xA9 => Ok(Insn::Var(VarInsnNode {
            insn: InsnNode { opcode },
            var_index: reader.read_u2()?,
        })),
        0x84 => Ok(Insn::Iinc(IincInsnNode {
            insn: InsnNode { opcode },
            var_index: reader.read_u2()?,
            increment: reader.read_i2()?,
        })),
        _ => Err(ClassReadError::InvalidOpcode {
            opcode,
            offset: reader.pos().saturating_sub(1),
        }),
    }
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn pos(&self) -> usize {
        self.pos
    }

    /// Skips the 0-3 padding bytes that put switch operands on a 4-byte boundary.
    fn align4(&mut self, opcode_offset: usize) -> Result<(), ClassReadError> {
        let padding = (4 - ((opcode_offset + 1) % 4)) % 4;
        self.read_bytes(padding)?;
        Ok(())
    }

    fn read_u1(&mut self) -> Result<u8, ClassReadError> {
        let value = *self
            .data
            .get(self.pos)
            .ok_or(ClassReadError::UnexpectedEof)?;
        self.pos += 1;
        Ok(value)
    }

    fn read_i1(&mut self) -> Result<i8, ClassReadError> {
        Ok(self.read_u1()? as i8)
    }

    fn read_u2(&mut self) -> Result<u16, ClassReadError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_i2(&mut self) -> Result<i16, ClassReadError> {
        Ok(self.read_u2()? as i16)
    }

    fn read_u4(&mut self) -> Result<u32, ClassReadError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_i4(&mut self) -> Result<i32, ClassReadError> {
        Ok(self.read_u4()? as i32)
    }

    fn read_u8(&mut self) -> Result<u64, ClassReadError> {
        let high = self.read_u4()? as u64;
        let low = self.read_u4()? as u64;
        Ok((high << 32) | low)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ClassReadError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(ClassReadError::UnexpectedEof)?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes;

    fn code_attribute(code: Vec<u8>) -> CodeAttribute {
        CodeAttribute {
            name_index: 1,
            max_stack: 2,
            max_locals: 1,
            code,
            exception_table: Vec::new(),
            attributes: Vec::new(),
        }
    }

    #[test]
    fn test_decode_modified_utf8() {
        assert_eq!(decode_modified_utf8(b"plain").unwrap(), "plain");
        // Embedded nul is written as the two-byte form.
        assert_eq!(decode_modified_utf8(&[0x61, 0xC0, 0x80]).unwrap(), "a\0");
        // U+1F600 as a CESU-8 surrogate pair.
        let emoji = [0xED, 0xA0, 0xBD, 0xED, 0xB8, 0x80];
        assert_eq!(decode_modified_utf8(&emoji).unwrap(), "\u{1F600}");
        assert!(decode_modified_utf8(&[0x00]).is_err());
    }

    #[test]
    fn test_rejects_bad_magic() {
        let err = read_class_file(&[0xCA, 0xFE, 0xBA, 0xBF, 0, 0, 0, 49]).unwrap_err();
        assert!(matches!(err, ClassReadError::InvalidMagic(0xCAFEBABF)));
    }

    #[test]
    fn test_read_method_code_resolves_branches() {
        // 0: iconst_0; 1: ifeq +4 -> 5; 4: nop; 5: return
        let attribute = code_attribute(vec![
            opcodes::ICONST_0,
            opcodes::IFEQ,
            0x00,
            0x04,
            opcodes::NOP,
            opcodes::RETURN,
        ]);
        let code = read_method_code(&attribute).unwrap();
        let handles: Vec<_> = code.insns.handles().collect();

        assert_eq!(handles.len(), 4);
        match code.insns.get(handles[1]) {
            Some(Insn::Jump(jump)) => assert_eq!(jump.target, handles[3]),
            other => panic!("expected jump, got {other:?}"),
        }
    }

    #[test]
    fn test_read_method_code_rejects_mid_instruction_target() {
        // ifeq +2 lands inside its own operand.
        let attribute = code_attribute(vec![opcodes::IFEQ, 0x00, 0x02, opcodes::RETURN]);
        let err = read_method_code(&attribute).unwrap_err();
        assert!(matches!(
            err,
            ClassReadError::InvalidBranchTarget {
                offset: 0,
                target: 2
            }
        ));
    }

    #[test]
    fn test_exception_end_at_code_length_is_open() {
        let mut attribute = code_attribute(vec![opcodes::NOP, opcodes::ATHROW]);
        attribute.exception_table.push(ExceptionTableEntry {
            start_pc: 0,
            end_pc: 2,
            handler_pc: 1,
            catch_type: 0,
        });
        let code = read_method_code(&attribute).unwrap();
        let block = &code.try_catch_blocks[0];

        assert_eq!(block.end, None);
        assert_eq!(Some(block.start), code.insns.first());
        assert_eq!(Some(block.handler), code.insns.last());
    }

    #[test]
    fn test_wide_iinc_is_decoded() {
        let attribute = code_attribute(vec![
            opcodes::WIDE,
            opcodes::IINC,
            0x01,
            0x00,
            0x7F,
            0xFF,
            opcodes::RETURN,
        ]);
        let code = read_method_code(&attribute).unwrap();
        let first = code.insns.first().and_then(|h| code.insns.get(h)).cloned();

        assert_eq!(
            first,
            Some(Insn::Iinc(IincInsnNode {
                insn: opcodes::IINC.into(),
                var_index: 256,
                increment: 0x7FFF,
            }))
        );
    }
}
