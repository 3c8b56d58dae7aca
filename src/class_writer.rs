use std::collections::{HashMap, HashSet, VecDeque};

use crate::class_reader::{
    AttributeInfo, ClassFile, CodeAttribute, ExceptionTableEntry, LineNumber, LocalVariable,
};
use crate::constant_pool::{Constant, ConstantPool};
use crate::constants::CLASS_MAGIC;
use crate::error::ClassWriteError;
use crate::insn::{Insn, InsnHandle};
use crate::method_code::{LocalVariableNode, MethodCode, NestedAttribute};
use crate::opcodes;

/// Encodes `class` into class-file bytes.
///
/// Attributes are written from their decoded form; `Raw` attributes are copied through
/// unchanged, so a class that was read and not modified encodes to the same bytes.
pub fn write_class_file(class: &ClassFile) -> Result<Vec<u8>, ClassWriteError> {
    if class.constant_pool.count() == 0 {
        return Err(ClassWriteError::MissingConstantPool);
    }
    let mut out = Vec::new();
    write_u4(&mut out, CLASS_MAGIC);
    write_u2(&mut out, class.minor_version);
    write_u2(&mut out, class.major_version);
    write_constant_pool(&mut out, &class.constant_pool)?;
    write_u2(&mut out, class.access_flags);
    write_u2(&mut out, class.this_class);
    write_u2(&mut out, class.super_class);
    write_u2(&mut out, class.interfaces.len() as u16);
    for interface in &class.interfaces {
        write_u2(&mut out, *interface);
    }

    write_u2(&mut out, class.fields.len() as u16);
    for field in &class.fields {
        write_u2(&mut out, field.access_flags);
        write_u2(&mut out, field.name_index);
        write_u2(&mut out, field.descriptor_index);
        write_attributes(&mut out, &field.attributes)?;
    }

    write_u2(&mut out, class.methods.len() as u16);
    for method in &class.methods {
        write_u2(&mut out, method.access_flags);
        write_u2(&mut out, method.name_index);
        write_u2(&mut out, method.descriptor_index);
        write_attributes(&mut out, &method.attributes)?;
    }

    write_attributes(&mut out, &class.attributes)?;
    Ok(out)
}

fn write_constant_pool(out: &mut Vec<u8>, cp: &ConstantPool) -> Result<(), ClassWriteError> {
    let count = u16::try_from(cp.count()).map_err(|_| ClassWriteError::InvalidConstantPool)?;
    write_u2(out, count);
    for (_, entry) in cp.iter() {
        write_u1(out, entry.tag());
        match entry {
            Constant::Reserved => return Err(ClassWriteError::InvalidConstantPool),
            Constant::Utf8(value) => {
                let bytes = encode_modified_utf8(value);
                let len =
                    u16::try_from(bytes.len()).map_err(|_| ClassWriteError::InvalidConstantPool)?;
                write_u2(out, len);
                out.extend_from_slice(&bytes);
            }
            Constant::Integer(value) => write_u4(out, *value as u32),
            Constant::Float(value) => write_u4(out, value.to_bits()),
            Constant::Long(value) => write_u8(out, *value as u64),
            Constant::Double(value) => write_u8(out, value.to_bits()),
            Constant::Class { name_index }
            | Constant::Module { name_index }
            | Constant::Package { name_index } => write_u2(out, *name_index),
            Constant::String { string_index } => write_u2(out, *string_index),
            Constant::MethodType { descriptor_index } => write_u2(out, *descriptor_index),
            Constant::Fieldref {
                class_index,
                name_and_type_index,
            }
            | Constant::Methodref {
                class_index,
                name_and_type_index,
            }
            | Constant::InterfaceMethodref {
                class_index,
                name_and_type_index,
            } => {
                write_u2(out, *class_index);
                write_u2(out, *name_and_type_index);
            }
            Constant::NameAndType {
                name_index,
                descriptor_index,
            } => {
                write_u2(out, *name_index);
                write_u2(out, *descriptor_index);
            }
            Constant::MethodHandle {
                reference_kind,
                reference_index,
            } => {
                write_u1(out, *reference_kind);
                write_u2(out, *reference_index);
            }
            Constant::Dynamic {
                bootstrap_method_attr_index,
                name_and_type_index,
            }
            | Constant::InvokeDynamic {
                bootstrap_method_attr_index,
                name_and_type_index,
            } => {
                write_u2(out, *bootstrap_method_attr_index);
                write_u2(out, *name_and_type_index);
            }
        }
    }
    Ok(())
}

/// Java's modified UTF-8: nul takes two bytes and supplementary characters are
/// written as surrogate pairs of three bytes each.
pub(crate) fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}

fn write_attributes(out: &mut Vec<u8>, attributes: &[AttributeInfo]) -> Result<(), ClassWriteError> {
    write_u2(out, attributes.len() as u16);
    for attr in attributes {
        write_attribute(out, attr)?;
    }
    Ok(())
}

fn write_attribute(out: &mut Vec<u8>, attr: &AttributeInfo) -> Result<(), ClassWriteError> {
    let mut info = Vec::new();
    match attr {
        AttributeInfo::Code(code) => {
            write_u2(&mut info, code.max_stack);
            write_u2(&mut info, code.max_locals);
            write_u4(&mut info, code.code.len() as u32);
            info.extend_from_slice(&code.code);
            write_u2(&mut info, code.exception_table.len() as u16);
            for entry in &code.exception_table {
                write_u2(&mut info, entry.start_pc);
                write_u2(&mut info, entry.end_pc);
                write_u2(&mut info, entry.handler_pc);
                write_u2(&mut info, entry.catch_type);
            }
            write_attributes(&mut info, &code.attributes)?;
        }
        AttributeInfo::LineNumberTable { entries, .. } => {
            write_u2(&mut info, entries.len() as u16);
            for entry in entries {
                write_u2(&mut info, entry.start_pc);
                write_u2(&mut info, entry.line_number);
            }
        }
        AttributeInfo::LocalVariableTable { entries, .. }
        | AttributeInfo::LocalVariableTypeTable { entries, .. } => {
            write_u2(&mut info, entries.len() as u16);
            for entry in entries {
                write_u2(&mut info, entry.start_pc);
                write_u2(&mut info, entry.length);
                write_u2(&mut info, entry.name_index);
                write_u2(&mut info, entry.descriptor_index);
                write_u2(&mut info, entry.index);
            }
        }
        AttributeInfo::Raw { info: raw, .. } => info.extend_from_slice(raw),
    }
    write_u2(out, attr.name_index());
    write_u4(out, info.len() as u32);
    out.extend_from_slice(&info);
    Ok(())
}

/// Final placement of every live instruction.
struct Layout {
    order: Vec<InsnHandle>,
    offsets: HashMap<InsnHandle, usize>,
    /// `GOTO`/`JSR` that need the four-byte form.
    widened: HashSet<InsnHandle>,
    length: usize,
}

impl Layout {
    fn offset(&self, handle: InsnHandle) -> Result<usize, ClassWriteError> {
        self.offsets
            .get(&handle)
            .copied()
            .ok_or(ClassWriteError::DeadHandle(handle))
    }

    fn end_offset(&self, handle: Option<InsnHandle>) -> Result<usize, ClassWriteError> {
        match handle {
            Some(handle) => self.offset(handle),
            None => Ok(self.length),
        }
    }
}

fn layout(code: &MethodCode) -> Result<Layout, ClassWriteError> {
    let order: Vec<InsnHandle> = code.insns.handles().collect();
    let mut widened = HashSet::new();

    // Widening only ever grows instructions, so this settles.
    loop {
        let mut offsets = HashMap::with_capacity(order.len());
        let mut pc = 0usize;
        for handle in &order {
            offsets.insert(*handle, pc);
            let insn = code
                .insns
                .get(*handle)
                .ok_or(ClassWriteError::DeadHandle(*handle))?;
            pc += insn_size(insn, pc, widened.contains(handle));
        }

        let mut grew = false;
        for handle in &order {
            let Some(Insn::Jump(jump)) = code.insns.get(*handle) else {
                continue;
            };
            let opcode = jump.insn.opcode;
            if matches!(opcode, opcodes::GOTO_W | opcodes::JSR_W) || widened.contains(handle) {
                continue;
            }
            let target = *offsets
                .get(&jump.target)
                .ok_or(ClassWriteError::DeadHandle(jump.target))?;
            let delta = target as i64 - offsets[handle] as i64;
            if i16::try_from(delta).is_err() {
                match opcode {
                    opcodes::GOTO | opcodes::JSR => {
                        widened.insert(*handle);
                        grew = true;
                    }
                    _ => {
                        return Err(ClassWriteError::BranchOutOfRange {
                            opcode,
                            offset: delta,
                        });
                    }
                }
            }
        }

        if !grew {
            if pc > u16::MAX as usize {
                return Err(ClassWriteError::CodeTooLarge(pc));
            }
            return Ok(Layout {
                order,
                offsets,
                widened,
                length: pc,
            });
        }
    }
}

fn switch_padding(offset: usize) -> usize {
    (4 - ((offset + 1) % 4)) % 4
}

fn needs_wide_var(var_index: u16) -> bool {
    var_index > u8::MAX as u16
}

fn needs_wide_iinc(var_index: u16, increment: i16) -> bool {
    needs_wide_var(var_index) || i8::try_from(increment).is_err()
}

fn insn_size(insn: &Insn, offset: usize, widened: bool) -> usize {
    match insn {
        Insn::Simple(_) => 1,
        Insn::Int(node) => match node.insn.opcode {
            opcodes::SIPUSH => 3,
            _ => 2,
        },
        Insn::Var(node) => {
            if needs_wide_var(node.var_index) {
                4
            } else {
                2
            }
        }
        Insn::Iinc(node) => {
            if needs_wide_iinc(node.var_index, node.increment) {
                6
            } else {
                3
            }
        }
        Insn::Ldc(node) => {
            if node.insn.opcode == opcodes::LDC && node.index <= u8::MAX as u16 {
                2
            } else {
                3
            }
        }
        Insn::Type(_) | Insn::Field(_) | Insn::Method(_) => 3,
        Insn::InvokeInterface(_) | Insn::InvokeDynamic(_) => 5,
        Insn::MultiANewArray(_) => 4,
        Insn::Jump(node) => {
            if widened || matches!(node.insn.opcode, opcodes::GOTO_W | opcodes::JSR_W) {
                5
            } else {
                3
            }
        }
        Insn::TableSwitch(node) => 1 + switch_padding(offset) + 12 + 4 * node.targets.len(),
        Insn::LookupSwitch(node) => 1 + switch_padding(offset) + 8 + 8 * node.pairs.len(),
    }
}

/// Encodes `code` into a `Code` attribute. The instruction forms are chosen by operand
/// size, so a `LDC` whose index no longer fits a byte becomes `LDC_W` and an out-of-range
/// `GOTO` becomes `GOTO_W`. Conditional branches have no long form and fail instead.
pub fn write_method_code(code: &MethodCode, name_index: u16) -> Result<CodeAttribute, ClassWriteError> {
    let layout = layout(code)?;
    let mut bytes = Vec::with_capacity(layout.length);

    for handle in &layout.order {
        let offset = bytes.len();
        let insn = code
            .insns
            .get(*handle)
            .ok_or(ClassWriteError::DeadHandle(*handle))?;
        let relative = |target: InsnHandle| -> Result<i64, ClassWriteError> {
            Ok(layout.offset(target)? as i64 - offset as i64)
        };
        match insn {
            Insn::Simple(node) => write_u1(&mut bytes, node.opcode),
            Insn::Int(node) => {
                write_u1(&mut bytes, node.insn.opcode);
                match node.insn.opcode {
                    opcodes::SIPUSH => write_i2(&mut bytes, node.operand as i16),
                    opcodes::BIPUSH => write_i1(&mut bytes, node.operand as i8),
                    _ => write_u1(&mut bytes, node.operand as u8),
                }
            }
            Insn::Var(node) => {
                if needs_wide_var(node.var_index) {
                    write_u1(&mut bytes, opcodes::WIDE);
                    write_u1(&mut bytes, node.insn.opcode);
                    write_u2(&mut bytes, node.var_index);
                } else {
                    write_u1(&mut bytes, node.insn.opcode);
                    write_u1(&mut bytes, node.var_index as u8);
                }
            }
            Insn::Iinc(node) => {
                if needs_wide_iinc(node.var_index, node.increment) {
                    write_u1(&mut bytes, opcodes::WIDE);
                    write_u1(&mut bytes, opcodes::IINC);
                    write_u2(&mut bytes, node.var_index);
                    write_i2(&mut bytes, node.increment);
                } else {
                    write_u1(&mut bytes, opcodes::IINC);
                    write_u1(&mut bytes, node.var_index as u8);
                    write_i1(&mut bytes, node.increment as i8);
                }
            }
            Insn::Ldc(node) => match node.insn.opcode {
                opcodes::LDC if node.index <= u8::MAX as u16 => {
                    write_u1(&mut bytes, opcodes::LDC);
                    write_u1(&mut bytes, node.index as u8);
                }
                opcodes::LDC | opcodes::LDC_W => {
                    write_u1(&mut bytes, opcodes::LDC_W);
                    write_u2(&mut bytes, node.index);
                }
                opcode => {
                    write_u1(&mut bytes, opcode);
                    write_u2(&mut bytes, node.index);
                }
            },
            Insn::Type(node) => {
                write_u1(&mut bytes, node.insn.opcode);
                write_u2(&mut bytes, node.type_index);
            }
            Insn::Field(node) => {
                write_u1(&mut bytes, node.insn.opcode);
                write_u2(&mut bytes, node.field_index);
            }
            Insn::Method(node) => {
                write_u1(&mut bytes, node.insn.opcode);
                write_u2(&mut bytes, node.method_index);
            }
            Insn::InvokeInterface(node) => {
                write_u1(&mut bytes, node.insn.opcode);
                write_u2(&mut bytes, node.method_index);
                write_u1(&mut bytes, node.count);
                write_u1(&mut bytes, 0);
            }
            Insn::InvokeDynamic(node) => {
                write_u1(&mut bytes, node.insn.opcode);
                write_u2(&mut bytes, node.method_index);
                write_u2(&mut bytes, 0);
            }
            Insn::MultiANewArray(node) => {
                write_u1(&mut bytes, node.insn.opcode);
                write_u2(&mut bytes, node.type_index);
                write_u1(&mut bytes, node.dimensions);
            }
            Insn::Jump(node) => {
                let delta = relative(node.target)?;
                let opcode = node.insn.opcode;
                if layout.widened.contains(handle) || matches!(opcode, opcodes::GOTO_W | opcodes::JSR_W) {
                    let long_form = match opcode {
                        opcodes::GOTO => opcodes::GOTO_W,
                        opcodes::JSR => opcodes::JSR_W,
                        other => other,
                    };
                    write_u1(&mut bytes, long_form);
                    write_i4(&mut bytes, delta as i32);
                } else {
                    write_u1(&mut bytes, opcode);
                    write_i2(&mut bytes, delta as i16);
                }
            }
            Insn::TableSwitch(node) => {
                write_u1(&mut bytes, node.insn.opcode);
                write_switch_padding(&mut bytes, offset);
                write_i4(&mut bytes, relative(node.default)? as i32);
                write_i4(&mut bytes, node.low);
                write_i4(&mut bytes, node.high);
                for target in &node.targets {
                    write_i4(&mut bytes, relative(*target)? as i32);
                }
            }
            Insn::LookupSwitch(node) => {
                write_u1(&mut bytes, node.insn.opcode);
                write_switch_padding(&mut bytes, offset);
                write_i4(&mut bytes, relative(node.default)? as i32);
                write_i4(&mut bytes, node.pairs.len() as i32);
                for (key, target) in &node.pairs {
                    write_i4(&mut bytes, *key);
                    write_i4(&mut bytes, relative(*target)? as i32);
                }
            }
        }
    }

    let mut exception_table = Vec::with_capacity(code.try_catch_blocks.len());
    for block in &code.try_catch_blocks {
        exception_table.push(ExceptionTableEntry {
            start_pc: layout.offset(block.start)? as u16,
            end_pc: layout.end_offset(block.end)? as u16,
            handler_pc: layout.offset(block.handler)? as u16,
            catch_type: block.catch_type,
        });
    }

    let mut attributes = Vec::with_capacity(code.attributes.len());
    for nested in &code.attributes {
        let attr = match nested {
            NestedAttribute::LineNumbers { name_index } => {
                let mut entries = Vec::with_capacity(code.line_numbers.len());
                for node in &code.line_numbers {
                    entries.push(LineNumber {
                        start_pc: layout.offset(node.start)? as u16,
                        line_number: node.line,
                    });
                }
                AttributeInfo::LineNumberTable {
                    name_index: *name_index,
                    entries,
                }
            }
            NestedAttribute::LocalVariables { name_index } => AttributeInfo::LocalVariableTable {
                name_index: *name_index,
                entries: local_entries(&layout, &code.local_variables)?,
            },
            NestedAttribute::LocalVariableTypes { name_index } => {
                AttributeInfo::LocalVariableTypeTable {
                    name_index: *name_index,
                    entries: local_entries(&layout, &code.local_variable_types)?,
                }
            }
            NestedAttribute::Other(other) => other.clone(),
        };
        attributes.push(attr);
    }

    Ok(CodeAttribute {
        name_index,
        max_stack: code.max_stack,
        max_locals: code.max_locals,
        code: bytes,
        exception_table,
        attributes,
    })
}

fn local_entries(
    layout: &Layout,
    nodes: &[LocalVariableNode],
) -> Result<Vec<LocalVariable>, ClassWriteError> {
    nodes
        .iter()
        .map(|node| {
            let start = layout.offset(node.start)?;
            let end = layout.end_offset(node.end)?;
            Ok(LocalVariable {
                start_pc: start as u16,
                length: end.saturating_sub(start) as u16,
                name_index: node.name_index,
                descriptor_index: node.descriptor_index,
                index: node.index,
            })
        })
        .collect()
}

/// Computes the operand stack depth a method body needs, in slots.
///
/// Walks every path reachable from the first instruction and from each exception
/// handler (entered with the thrown reference on the stack). A subroutine entered by
/// `JSR` starts with its return address pushed; the instruction after the `JSR`
/// resumes with the depth the caller had.
pub fn compute_max_stack(code: &MethodCode, cp: &ConstantPool) -> Result<u16, ClassWriteError> {
    let order: Vec<InsnHandle> = code.insns.handles().collect();
    let Some(first) = order.first().copied() else {
        return Ok(0);
    };
    let position: HashMap<InsnHandle, usize> = order
        .iter()
        .enumerate()
        .map(|(position, handle)| (*handle, position))
        .collect();
    let handlers = build_exception_handlers(code, &position, order.len())?;

    let mut depths: HashMap<InsnHandle, usize> = HashMap::new();
    let mut worklist = VecDeque::new();
    let mut max_stack = 0usize;

    enqueue(first, 0, &mut depths, &mut worklist)?;
    while let Some(handle) = worklist.pop_front() {
        let depth = depths[&handle];
        let insn = code
            .insns
            .get(handle)
            .ok_or(ClassWriteError::DeadHandle(handle))?;
        let (pops, pushes) = stack_effect(insn, cp)?;
        if pops > depth {
            return Err(ClassWriteError::StackAnalysis(format!(
                "stack underflow at {handle} ({insn})"
            )));
        }
        let after = depth - pops + pushes;
        max_stack = max_stack.max(after);

        let index = position[&handle];
        for handler in handlers.iter().filter(|handler| handler.covers(index)) {
            max_stack = max_stack.max(1);
            enqueue(handler.handler, 1, &mut depths, &mut worklist)?;
        }

        let next = code.insns.next(handle);
        let opcode = insn.opcode();
        match insn {
            Insn::Jump(jump) if matches!(opcode, opcodes::JSR | opcodes::JSR_W) => {
                enqueue(jump.target, after, &mut depths, &mut worklist)?;
                if let Some(next) = next {
                    enqueue(next, depth, &mut depths, &mut worklist)?;
                }
            }
            Insn::Jump(jump) => {
                enqueue(jump.target, after, &mut depths, &mut worklist)?;
                if !matches!(opcode, opcodes::GOTO | opcodes::GOTO_W) {
                    if let Some(next) = next {
                        enqueue(next, after, &mut depths, &mut worklist)?;
                    }
                }
            }
            Insn::TableSwitch(_) | Insn::LookupSwitch(_) => {
                for target in insn.targets() {
                    enqueue(target, after, &mut depths, &mut worklist)?;
                }
            }
            _ if ends_flow(opcode) => {}
            _ => {
                if let Some(next) = next {
                    enqueue(next, after, &mut depths, &mut worklist)?;
                }
            }
        }
    }

    u16::try_from(max_stack)
        .map_err(|_| ClassWriteError::StackAnalysis(format!("max stack {max_stack} overflows")))
}

fn enqueue(
    handle: InsnHandle,
    depth: usize,
    depths: &mut HashMap<InsnHandle, usize>,
    worklist: &mut VecDeque<InsnHandle>,
) -> Result<(), ClassWriteError> {
    match depths.get(&handle) {
        Some(existing) if *existing == depth => Ok(()),
        Some(existing) => Err(ClassWriteError::StackAnalysis(format!(
            "inconsistent stack depth at {handle}: {existing} and {depth}"
        ))),
        None => {
            depths.insert(handle, depth);
            worklist.push_back(handle);
            Ok(())
        }
    }
}

struct ExceptionHandlerInfo {
    start: usize,
    end: usize,
    handler: InsnHandle,
}

impl ExceptionHandlerInfo {
    fn covers(&self, position: usize) -> bool {
        position >= self.start && position < self.end
    }
}

fn build_exception_handlers(
    code: &MethodCode,
    position: &HashMap<InsnHandle, usize>,
    length: usize,
) -> Result<Vec<ExceptionHandlerInfo>, ClassWriteError> {
    let lookup = |handle: InsnHandle| {
        position
            .get(&handle)
            .copied()
            .ok_or(ClassWriteError::DeadHandle(handle))
    };
    code.try_catch_blocks
        .iter()
        .map(|block| {
            Ok(ExceptionHandlerInfo {
                start: lookup(block.start)?,
                end: match block.end {
                    Some(end) => lookup(end)?,
                    None => length,
                },
                handler: block.handler,
            })
        })
        .collect()
}

fn ends_flow(opcode: u8) -> bool {
    matches!(
        opcode,
        opcodes::IRETURN
            | opcodes::LRETURN
            | opcodes::FRETURN
            | opcodes::DRETURN
            | opcodes::ARETURN
            | opcodes::RETURN
            | opcodes::ATHROW
            | opcodes::RET
    )
}

/// `(popped, pushed)` operand stack slots for one instruction.
fn stack_effect(insn: &Insn, cp: &ConstantPool) -> Result<(usize, usize), ClassWriteError> {
    let opcode = insn.opcode();
    let effect = match insn {
        Insn::Ldc(node) => (0, ldc_slots(opcode, node.index, cp)?),
        Insn::Field(node) => {
            let member = cp
                .field_ref(node.field_index)
                .map_err(|err| ClassWriteError::StackAnalysis(err.to_string()))?;
            let size = parse_field_descriptor(member.descriptor)?.slots();
            match opcode {
                opcodes::GETSTATIC => (0, size),
                opcodes::PUTSTATIC => (size, 0),
                opcodes::GETFIELD => (1, size),
                _ => (1 + size, 0),
            }
        }
        Insn::Method(node) => {
            let member = cp
                .any_member_ref(node.method_index)
                .map_err(|err| ClassWriteError::StackAnalysis(err.to_string()))?;
            let (params, ret) = parse_method_descriptor(member.descriptor)?;
            let args: usize = params.iter().map(FieldType::slots).sum();
            let receiver = usize::from(opcode != opcodes::INVOKESTATIC);
            (args + receiver, ret.slots())
        }
        Insn::InvokeInterface(node) => {
            let member = cp
                .any_member_ref(node.method_index)
                .map_err(|err| ClassWriteError::StackAnalysis(err.to_string()))?;
            let (params, ret) = parse_method_descriptor(member.descriptor)?;
            (params.iter().map(FieldType::slots).sum::<usize>() + 1, ret.slots())
        }
        Insn::InvokeDynamic(node) => {
            let descriptor = dynamic_descriptor(node.method_index, cp)?;
            let (params, ret) = parse_method_descriptor(descriptor)?;
            (params.iter().map(FieldType::slots).sum(), ret.slots())
        }
        Insn::MultiANewArray(node) => (node.dimensions as usize, 1),
        _ => simple_stack_effect(opcode)?,
    };
    Ok(effect)
}

fn simple_stack_effect(opcode: u8) -> Result<(usize, usize), ClassWriteError> {
    let effect = match opcode {
        opcodes::NOP | opcodes::IINC | opcodes::GOTO | opcodes::GOTO_W | opcodes::RET => (0, 0),
        opcodes::ACONST_NULL..=opcodes::ICONST_5 => (0, 1),
        opcodes::LCONST_0 | opcodes::LCONST_1 => (0, 2),
        opcodes::FCONST_0..=opcodes::FCONST_2 => (0, 1),
        opcodes::DCONST_0 | opcodes::DCONST_1 => (0, 2),
        opcodes::BIPUSH | opcodes::SIPUSH => (0, 1),
        opcodes::ILOAD | opcodes::FLOAD | opcodes::ALOAD => (0, 1),
        opcodes::LLOAD | opcodes::DLOAD => (0, 2),
        opcodes::ILOAD_0..=opcodes::ILOAD_3 => (0, 1),
        opcodes::LLOAD_0..=opcodes::LLOAD_3 => (0, 2),
        opcodes::FLOAD_0..=opcodes::FLOAD_3 => (0, 1),
        opcodes::DLOAD_0..=opcodes::DLOAD_3 => (0, 2),
        opcodes::ALOAD_0..=opcodes::ALOAD_3 => (0, 1),
        opcodes::LALOAD | opcodes::DALOAD => (2, 2),
        opcodes::IALOAD..=opcodes::SALOAD => (2, 1),
        opcodes::ISTORE | opcodes::FSTORE | opcodes::ASTORE => (1, 0),
        opcodes::LSTORE | opcodes::DSTORE => (2, 0),
        opcodes::ISTORE_0..=opcodes::ISTORE_3 => (1, 0),
        opcodes::LSTORE_0..=opcodes::LSTORE_3 => (2, 0),
        opcodes::FSTORE_0..=opcodes::FSTORE_3 => (1, 0),
        opcodes::DSTORE_0..=opcodes::DSTORE_3 => (2, 0),
        opcodes::ASTORE_0..=opcodes::ASTORE_3 => (1, 0),
        opcodes::LASTORE | opcodes::DASTORE => (4, 0),
        opcodes::IASTORE..=opcodes::SASTORE => (3, 0),
        opcodes::POP => (1, 0),
        opcodes::POP2 => (2, 0),
        opcodes::DUP => (1, 2),
        opcodes::DUP_X1 => (2, 3),
        opcodes::DUP_X2 => (3, 4),
        opcodes::DUP2 => (2, 4),
        opcodes::DUP2_X1 => (3, 5),
        opcodes::DUP2_X2 => (4, 6),
        opcodes::SWAP => (2, 2),
        // add, sub, mul, div, rem cycle through int, long, float, double.
        opcodes::IADD..=opcodes::DREM => match (opcode - opcodes::IADD) % 4 {
            1 | 3 => (4, 2),
            _ => (2, 1),
        },
        opcodes::INEG | opcodes::FNEG => (1, 1),
        opcodes::LNEG | opcodes::DNEG => (2, 2),
        opcodes::ISHL | opcodes::ISHR | opcodes::IUSHR => (2, 1),
        opcodes::LSHL | opcodes::LSHR | opcodes::LUSHR => (3, 2),
        opcodes::IAND | opcodes::IOR | opcodes::IXOR => (2, 1),
        opcodes::LAND | opcodes::LOR | opcodes::LXOR => (4, 2),
        opcodes::I2L | opcodes::I2D | opcodes::F2L | opcodes::F2D => (1, 2),
        opcodes::I2F | opcodes::F2I | opcodes::I2B | opcodes::I2C | opcodes::I2S => (1, 1),
        opcodes::L2I | opcodes::L2F | opcodes::D2I | opcodes::D2F => (2, 1),
        opcodes::L2D | opcodes::D2L => (2, 2),
        opcodes::LCMP | opcodes::DCMPL | opcodes::DCMPG => (4, 1),
        opcodes::FCMPL | opcodes::FCMPG => (2, 1),
        opcodes::IFEQ..=opcodes::IFLE | opcodes::IFNULL | opcodes::IFNONNULL => (1, 0),
        opcodes::IF_ICMPEQ..=opcodes::IF_ACMPNE => (2, 0),
        opcodes::JSR | opcodes::JSR_W => (0, 1),
        opcodes::TABLESWITCH | opcodes::LOOKUPSWITCH => (1, 0),
        opcodes::IRETURN | opcodes::FRETURN | opcodes::ARETURN => (1, 0),
        opcodes::LRETURN | opcodes::DRETURN => (2, 0),
        opcodes::RETURN => (0, 0),
        opcodes::NEW => (0, 1),
        opcodes::NEWARRAY | opcodes::ANEWARRAY | opcodes::ARRAYLENGTH => (1, 1),
        opcodes::CHECKCAST | opcodes::INSTANCEOF => (1, 1),
        opcodes::ATHROW | opcodes::MONITORENTER | opcodes::MONITOREXIT => (1, 0),
        opcodes::BREAKPOINT | opcodes::IMPDEP1 | opcodes::IMPDEP2 => (0, 0),
        _ => {
            return Err(ClassWriteError::StackAnalysis(format!(
                "no stack effect for opcode 0x{opcode:02X}"
            )));
        }
    };
    Ok(effect)
}

fn ldc_slots(opcode: u8, index: u16, cp: &ConstantPool) -> Result<usize, ClassWriteError> {
    let entry = cp
        .entry(index)
        .map_err(|err| ClassWriteError::StackAnalysis(err.to_string()))?;
    let slots = match entry {
        Constant::Long(_) | Constant::Double(_) => 2,
        Constant::Dynamic {
            name_and_type_index,
            ..
        } => {
            let (_, descriptor) = cp
                .name_and_type(*name_and_type_index)
                .map_err(|err| ClassWriteError::StackAnalysis(err.to_string()))?;
            parse_field_descriptor(descriptor)?.slots()
        }
        _ if opcode == opcodes::LDC2_W => 2,
        _ => 1,
    };
    Ok(slots)
}

fn dynamic_descriptor(index: u16, cp: &ConstantPool) -> Result<&str, ClassWriteError> {
    match cp.get(index) {
        Some(Constant::InvokeDynamic {
            name_and_type_index,
            ..
        }) => cp
            .name_and_type(*name_and_type_index)
            .map(|(_, descriptor)| descriptor)
            .map_err(|err| ClassWriteError::StackAnalysis(err.to_string())),
        _ => Err(ClassWriteError::StackAnalysis(format!(
            "constant {index} is not an InvokeDynamic entry"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Float,
    Long,
    Double,
    Object,
    Array,
    Void,
}

impl FieldType {
    fn slots(&self) -> usize {
        match self {
            FieldType::Void => 0,
            FieldType::Long | FieldType::Double => 2,
            _ => 1,
        }
    }
}

fn parse_field_descriptor(desc: &str) -> Result<FieldType, ClassWriteError> {
    let mut chars = desc.chars().peekable();
    let ty = parse_field_type(&mut chars)?;
    if chars.next().is_some() {
        return Err(ClassWriteError::StackAnalysis(format!(
            "bad field descriptor {desc}"
        )));
    }
    Ok(ty)
}

fn parse_method_descriptor(desc: &str) -> Result<(Vec<FieldType>, FieldType), ClassWriteError> {
    let mut chars = desc.chars().peekable();
    if chars.next() != Some('(') {
        return Err(ClassWriteError::StackAnalysis(format!(
            "bad method descriptor {desc}"
        )));
    }
    let mut params = Vec::new();
    loop {
        match chars.peek() {
            Some(')') => {
                chars.next();
                break;
            }
            Some(_) => params.push(parse_field_type(&mut chars)?),
            None => {
                return Err(ClassWriteError::StackAnalysis(format!(
                    "unterminated method descriptor {desc}"
                )));
            }
        }
    }
    let ret = match chars.peek() {
        Some('V') => {
            chars.next();
            FieldType::Void
        }
        _ => parse_field_type(&mut chars)?,
    };
    Ok((params, ret))
}

fn parse_field_type<I>(chars: &mut std::iter::Peekable<I>) -> Result<FieldType, ClassWriteError>
where
    I: Iterator<Item = char>,
{
    match chars.next() {
        Some('Z') => Ok(FieldType::Boolean),
        Some('B') => Ok(FieldType::Byte),
        Some('C') => Ok(FieldType::Char),
        Some('S') => Ok(FieldType::Short),
        Some('I') => Ok(FieldType::Int),
        Some('F') => Ok(FieldType::Float),
        Some('J') => Ok(FieldType::Long),
        Some('D') => Ok(FieldType::Double),
        Some('L') => {
            for ch in chars.by_ref() {
                if ch == ';' {
                    return Ok(FieldType::Object);
                }
            }
            Err(ClassWriteError::StackAnalysis(
                "unterminated class descriptor".to_string(),
            ))
        }
        Some('[') => {
            parse_field_type(chars)?;
            Ok(FieldType::Array)
        }
        other => Err(ClassWriteError::StackAnalysis(format!(
            "bad field descriptor character {other:?}"
        ))),
    }
}

fn write_u1(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

fn write_u2(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_u4(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_u8(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_i1(out: &mut Vec<u8>, value: i8) {
    out.push(value as u8);
}

fn write_i2(out: &mut Vec<u8>, value: i16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_i4(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_switch_padding(out: &mut Vec<u8>, opcode_offset: usize) {
    out.resize(out.len() + switch_padding(opcode_offset), 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class_reader::read_class_file;
    use crate::insn::{InsnList, InsnNode, JumpInsnNode, LdcInsnNode, VarInsnNode};
    use crate::method_code::TryCatchBlock;

    fn code_from(insns: InsnList) -> MethodCode {
        MethodCode::new(0, 4, insns)
    }

    #[test]
    fn test_encode_modified_utf8() {
        assert_eq!(encode_modified_utf8("abc"), b"abc");
        assert_eq!(encode_modified_utf8("\0"), vec![0xC0, 0x80]);
        assert_eq!(
            encode_modified_utf8("\u{1F600}"),
            vec![0xED, 0xA0, 0xBD, 0xED, 0xB8, 0x80]
        );
    }

    #[test]
    fn test_minimal_class_round_trip() {
        let mut pool = ConstantPool::new();
        let this_class = pool.add_class("Hello").unwrap();
        let super_class = pool.add_class("java/lang/Object").unwrap();
        pool.push(Constant::Double(1.5)).unwrap();
        pool.add_utf8("caf\u{e9}\0").unwrap();
        let class = ClassFile {
            minor_version: 0,
            major_version: 49,
            constant_pool: pool,
            access_flags: 0x0021,
            this_class,
            super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
        };

        let bytes = write_class_file(&class).unwrap();
        assert_eq!(&bytes[0..4], &[0xCA, 0xFE, 0xBA, 0xBE]);
        let decoded = read_class_file(&bytes).unwrap();
        assert_eq!(decoded, class);
    }

    #[test]
    fn test_far_goto_is_widened() {
        let mut insns = InsnList::new();
        let jump = insns.push(Insn::Jump(JumpInsnNode {
            insn: opcodes::GOTO.into(),
            target: InsnHandle::new(0),
        }));
        for _ in 0..40_000 {
            insns.push(InsnNode::from(opcodes::NOP));
        }
        let target = insns.push(InsnNode::from(opcodes::RETURN));
        if let Some(Insn::Jump(node)) = insns.get_mut(jump) {
            node.target = target;
        }

        let attribute = write_method_code(&code_from(insns), 1).unwrap();
        assert_eq!(attribute.code[0], opcodes::GOTO_W);
        assert_eq!(attribute.code.len(), 5 + 40_000 + 1);
        assert_eq!(&attribute.code[1..5], &(40_005i32).to_be_bytes());
    }

    #[test]
    fn test_far_conditional_branch_is_an_error() {
        let mut insns = InsnList::new();
        insns.push(InsnNode::from(opcodes::ICONST_0));
        let jump = insns.push(Insn::Jump(JumpInsnNode {
            insn: opcodes::IFEQ.into(),
            target: InsnHandle::new(0),
        }));
        for _ in 0..40_000 {
            insns.push(InsnNode::from(opcodes::NOP));
        }
        let target = insns.push(InsnNode::from(opcodes::RETURN));
        if let Some(Insn::Jump(node)) = insns.get_mut(jump) {
            node.target = target;
        }

        let err = write_method_code(&code_from(insns), 1).unwrap_err();
        assert!(matches!(
            err,
            ClassWriteError::BranchOutOfRange {
                opcode: opcodes::IFEQ,
                ..
            }
        ));
    }

    #[test]
    fn test_operand_width_selects_wide_forms() {
        let mut insns = InsnList::new();
        insns.push(Insn::Ldc(LdcInsnNode {
            insn: opcodes::LDC.into(),
            index: 300,
        }));
        insns.push(Insn::Var(VarInsnNode {
            insn: opcodes::ISTORE.into(),
            var_index: 260,
        }));
        insns.push(InsnNode::from(opcodes::RETURN));

        let attribute = write_method_code(&code_from(insns), 1).unwrap();
        assert_eq!(
            attribute.code,
            vec![
                opcodes::LDC_W,
                0x01,
                0x2C,
                opcodes::WIDE,
                opcodes::ISTORE,
                0x01,
                0x04,
                opcodes::RETURN
            ]
        );
    }

    #[test]
    fn test_dead_branch_target_is_reported() {
        let mut insns = InsnList::new();
        let stale = InsnHandle::new(99);
        insns.push(Insn::Jump(JumpInsnNode {
            insn: opcodes::GOTO.into(),
            target: stale,
        }));

        let err = write_method_code(&code_from(insns), 1).unwrap_err();
        assert!(matches!(err, ClassWriteError::DeadHandle(handle) if handle == stale));
    }

    #[test]
    fn test_compute_max_stack_counts_wide_values_and_calls() {
        let mut pool = ConstantPool::new();
        let method = pool
            .add_method_ref("java/lang/Math", "max", "(JJ)J")
            .unwrap();
        let mut insns = InsnList::new();
        insns.push(InsnNode::from(opcodes::LCONST_0));
        insns.push(InsnNode::from(opcodes::LCONST_1));
        insns.push(Insn::Method(crate::insn::MethodInsnNode {
            insn: opcodes::INVOKESTATIC.into(),
            method_index: method,
        }));
        insns.push(InsnNode::from(opcodes::LRETURN));

        assert_eq!(compute_max_stack(&code_from(insns), &pool).unwrap(), 4);
    }

    #[test]
    fn test_compute_max_stack_enters_handlers_with_one_slot() {
        let pool = ConstantPool::new();
        let mut insns = InsnList::new();
        let start = insns.push(InsnNode::from(opcodes::NOP));
        let end = insns.push(InsnNode::from(opcodes::RETURN));
        let handler = insns.push(InsnNode::from(opcodes::ATHROW));
        let mut code = code_from(insns);
        code.try_catch_blocks.push(TryCatchBlock {
            start,
            end: Some(end),
            handler,
            catch_type: 0,
        });

        assert_eq!(compute_max_stack(&code, &pool).unwrap(), 1);
    }

    #[test]
    fn test_compute_max_stack_rejects_underflow() {
        let pool = ConstantPool::new();
        let insns: InsnList = [opcodes::POP, opcodes::RETURN]
            .into_iter()
            .map(InsnNode::from)
            .collect();

        assert!(matches!(
            compute_max_stack(&code_from(insns), &pool),
            Err(ClassWriteError::StackAnalysis(_))
        ));
    }
}
