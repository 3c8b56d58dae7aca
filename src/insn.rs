use std::fmt;

use crate::opcodes;

/// Stable identity of one instruction slot in an [`InsnList`].
///
/// Handles are never reused: deleting an instruction retires its handle for good,
/// so a stale handle is always detectable with [`InsnList::is_live`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InsnHandle(u32);

impl InsnHandle {
    pub(crate) fn new(index: usize) -> Self {
        InsnHandle(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InsnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsnNode {
    pub opcode: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntInsnNode {
    pub insn: InsnNode,
    pub operand: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarInsnNode {
    pub insn: InsnNode,
    pub var_index: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeInsnNode {
    pub insn: InsnNode,
    pub type_index: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInsnNode {
    pub insn: InsnNode,
    pub field_index: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodInsnNode {
    pub insn: InsnNode,
    pub method_index: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvokeInterfaceInsnNode {
    pub insn: InsnNode,
    pub method_index: u16,
    pub count: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvokeDynamicInsnNode {
    pub insn: InsnNode,
    pub method_index: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpInsnNode {
    pub insn: InsnNode,
    pub target: InsnHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LdcInsnNode {
    pub insn: InsnNode,
    pub index: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IincInsnNode {
    pub insn: InsnNode,
    pub var_index: u16,
    pub increment: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSwitchInsnNode {
    pub insn: InsnNode,
    pub default: InsnHandle,
    pub low: i32,
    pub high: i32,
    pub targets: Vec<InsnHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupSwitchInsnNode {
    pub insn: InsnNode,
    pub default: InsnHandle,
    pub pairs: Vec<(i32, InsnHandle)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiANewArrayInsnNode {
    pub insn: InsnNode,
    pub type_index: u16,
    pub dimensions: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn {
    Simple(InsnNode),
    Int(IntInsnNode),
    Var(VarInsnNode),
    Type(TypeInsnNode),
    Field(FieldInsnNode),
    Method(MethodInsnNode),
    InvokeInterface(InvokeInterfaceInsnNode),
    InvokeDynamic(InvokeDynamicInsnNode),
    Jump(JumpInsnNode),
    Ldc(LdcInsnNode),
    Iinc(IincInsnNode),
    TableSwitch(TableSwitchInsnNode),
    LookupSwitch(LookupSwitchInsnNode),
    MultiANewArray(MultiANewArrayInsnNode),
}

impl Insn {
    pub fn opcode(&self) -> u8 {
        match self {
            Insn::Simple(node) => node.opcode,
            Insn::Int(node) => node.insn.opcode,
            Insn::Var(node) => node.insn.opcode,
            Insn::Type(node) => node.insn.opcode,
            Insn::Field(node) => node.insn.opcode,
            Insn::Method(node) => node.insn.opcode,
            Insn::InvokeInterface(node) => node.insn.opcode,
            Insn::InvokeDynamic(node) => node.insn.opcode,
            Insn::Jump(node) => node.insn.opcode,
            Insn::Ldc(node) => node.insn.opcode,
            Insn::Iinc(node) => node.insn.opcode,
            Insn::TableSwitch(node) => node.insn.opcode,
            Insn::LookupSwitch(node) => node.insn.opcode,
            Insn::MultiANewArray(node) => node.insn.opcode,
        }
    }

    /// The constant pool index this instruction refers to, if any.
    pub fn constant_index(&self) -> Option<u16> {
        match self {
            Insn::Type(node) => Some(node.type_index),
            Insn::Field(node) => Some(node.field_index),
            Insn::Method(node) => Some(node.method_index),
            Insn::InvokeInterface(node) => Some(node.method_index),
            Insn::InvokeDynamic(node) => Some(node.method_index),
            Insn::Ldc(node) => Some(node.index),
            Insn::MultiANewArray(node) => Some(node.type_index),
            _ => None,
        }
    }

    /// Every branch target held by this instruction.
    pub fn targets(&self) -> Vec<InsnHandle> {
        match self {
            Insn::Jump(node) => vec![node.target],
            Insn::TableSwitch(node) => {
                let mut targets = Vec::with_capacity(node.targets.len() + 1);
                targets.push(node.default);
                targets.extend(node.targets.iter().copied());
                targets
            }
            Insn::LookupSwitch(node) => {
                let mut targets = Vec::with_capacity(node.pairs.len() + 1);
                targets.push(node.default);
                targets.extend(node.pairs.iter().map(|(_, target)| *target));
                targets
            }
            _ => Vec::new(),
        }
    }

    /// Rewrites every branch target equal to `from` into `to`. Returns how many were changed.
    pub fn retarget(&mut self, from: InsnHandle, to: InsnHandle) -> usize {
        let mut swap = |target: &mut InsnHandle| {
            if *target == from {
                *target = to;
                1
            } else {
                0
            }
        };
        match self {
            Insn::Jump(node) => swap(&mut node.target),
            Insn::TableSwitch(node) => {
                swap(&mut node.default) + node.targets.iter_mut().map(&mut swap).sum::<usize>()
            }
            Insn::LookupSwitch(node) => {
                swap(&mut node.default)
                    + node
                        .pairs
                        .iter_mut()
                        .map(|(_, target)| swap(target))
                        .sum::<usize>()
            }
            _ => 0,
        }
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = opcodes::mnemonic(self.opcode()).unwrap_or("???");
        match self {
            Insn::Simple(_) => write!(f, "{name}"),
            Insn::Int(node) => write!(f, "{name} {}", node.operand),
            Insn::Var(node) => write!(f, "{name} {}", node.var_index),
            Insn::Iinc(node) => write!(f, "{name} {} {}", node.var_index, node.increment),
            Insn::Jump(node) => write!(f, "{name} -> {}", node.target),
            Insn::TableSwitch(node) => write!(f, "{name} {}..{}", node.low, node.high),
            Insn::LookupSwitch(node) => write!(f, "{name} [{}]", node.pairs.len()),
            other => match other.constant_index() {
                Some(index) => write!(f, "{name} #{index}"),
                None => write!(f, "{name}"),
            },
        }
    }
}

impl From<u8> for InsnNode {
    fn from(opcode: u8) -> Self {
        InsnNode { opcode }
    }
}

impl From<InsnNode> for Insn {
    fn from(value: InsnNode) -> Self {
        Insn::Simple(value)
    }
}

impl From<IntInsnNode> for Insn {
    fn from(value: IntInsnNode) -> Self {
        Insn::Int(value)
    }
}

impl From<VarInsnNode> for Insn {
    fn from(value: VarInsnNode) -> Self {
        Insn::Var(value)
    }
}

impl From<TypeInsnNode> for Insn {
    fn from(value: TypeInsnNode) -> Self {
        Insn::Type(value)
    }
}

impl From<FieldInsnNode> for Insn {
    fn from(value: FieldInsnNode) -> Self {
        Insn::Field(value)
    }
}

impl From<MethodInsnNode> for Insn {
    fn from(value: MethodInsnNode) -> Self {
        Insn::Method(value)
    }
}

impl From<JumpInsnNode> for Insn {
    fn from(value: JumpInsnNode) -> Self {
        Insn::Jump(value)
    }
}

impl From<LdcInsnNode> for Insn {
    fn from(value: LdcInsnNode) -> Self {
        Insn::Ldc(value)
    }
}

impl From<IincInsnNode> for Insn {
    fn from(value: IincInsnNode) -> Self {
        Insn::Iinc(value)
    }
}

#[derive(Debug, Clone)]
struct Slot {
    insn: Insn,
    prev: Option<InsnHandle>,
    next: Option<InsnHandle>,
    live: bool,
}

/// Doubly linked instruction sequence stored in an arena.
///
/// Branch instructions hold [`InsnHandle`]s, not offsets, so inserting and unlinking
/// never shifts anyone else's target. Keeping targets pointed at live slots is the
/// job of the editor in [`crate::editor`]; this type only maintains the links.
#[derive(Debug, Clone, Default)]
pub struct InsnList {
    slots: Vec<Slot>,
    head: Option<InsnHandle>,
    tail: Option<InsnHandle>,
    len: usize,
}

impl InsnList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn first(&self) -> Option<InsnHandle> {
        self.head
    }

    pub fn last(&self) -> Option<InsnHandle> {
        self.tail
    }

    pub fn is_live(&self, handle: InsnHandle) -> bool {
        self.slots
            .get(handle.index())
            .map(|slot| slot.live)
            .unwrap_or(false)
    }

    pub fn get(&self, handle: InsnHandle) -> Option<&Insn> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.live)
            .map(|slot| &slot.insn)
    }

    pub fn get_mut(&mut self, handle: InsnHandle) -> Option<&mut Insn> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.live)
            .map(|slot| &mut slot.insn)
    }

    pub fn next(&self, handle: InsnHandle) -> Option<InsnHandle> {
        self.slots.get(handle.index()).and_then(|slot| slot.next)
    }

    pub fn prev(&self, handle: InsnHandle) -> Option<InsnHandle> {
        self.slots.get(handle.index()).and_then(|slot| slot.prev)
    }

    /// Appends `insn` at the end and returns its handle.
    pub fn push<T: Into<Insn>>(&mut self, insn: T) -> InsnHandle {
        let handle = self.allocate(insn.into());
        self.link_after(self.tail, handle);
        handle
    }

    /// Links a fresh instruction in front of `before`.
    pub(crate) fn link_before(&mut self, before: InsnHandle, insn: Insn) -> InsnHandle {
        let handle = self.allocate(insn);
        let prev = self.prev(before);
        self.link_after(prev, handle);
        handle
    }

    fn allocate(&mut self, insn: Insn) -> InsnHandle {
        let handle = InsnHandle(self.slots.len() as u32);
        self.slots.push(Slot {
            insn,
            prev: None,
            next: None,
            live: true,
        });
        handle
    }

    fn link_after(&mut self, prev: Option<InsnHandle>, handle: InsnHandle) {
        let next = match prev {
            Some(prev) => self.slots[prev.index()].next,
            None => self.head,
        };
        self.slots[handle.index()].prev = prev;
        self.slots[handle.index()].next = next;
        match prev {
            Some(prev) => self.slots[prev.index()].next = Some(handle),
            None => self.head = Some(handle),
        }
        match next {
            Some(next) => self.slots[next.index()].prev = Some(handle),
            None => self.tail = Some(handle),
        }
        self.len += 1;
    }

    /// Unlinks the live span `from..=to` and retires its handles.
    pub(crate) fn unlink(&mut self, from: InsnHandle, to: InsnHandle) {
        let before = self.prev(from);
        let after = self.next(to);
        let mut cursor = Some(from);
        while let Some(handle) = cursor {
            let slot = &mut self.slots[handle.index()];
            slot.live = false;
            self.len -= 1;
            cursor = if handle == to { None } else { slot.next };
        }
        match before {
            Some(before) => self.slots[before.index()].next = after,
            None => self.head = after,
        }
        match after {
            Some(after) => self.slots[after.index()].prev = before,
            None => self.tail = before,
        }
    }

    /// The handles of the span `from..=to` in program order, or `None` if the span is
    /// not a forward range of live instructions.
    pub fn span(&self, from: InsnHandle, to: InsnHandle) -> Option<Vec<InsnHandle>> {
        if !self.is_live(from) || !self.is_live(to) {
            return None;
        }
        let mut handles = Vec::new();
        let mut cursor = Some(from);
        while let Some(handle) = cursor {
            handles.push(handle);
            if handle == to {
                return Some(handles);
            }
            cursor = self.next(handle);
        }
        None
    }

    pub fn handles(&self) -> Handles<'_> {
        Handles {
            list: self,
            cursor: self.head,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (InsnHandle, &Insn)> + '_ {
        self.handles().map(move |handle| (handle, &self.slots[handle.index()].insn))
    }

    /// The opcodes in program order.
    pub fn opcodes(&self) -> Vec<u8> {
        self.iter().map(|(_, insn)| insn.opcode()).collect()
    }
}

pub struct Handles<'a> {
    list: &'a InsnList,
    cursor: Option<InsnHandle>,
}

impl Iterator for Handles<'_> {
    type Item = InsnHandle;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.cursor?;
        self.cursor = self.list.next(current);
        Some(current)
    }
}

impl<T: Into<Insn>> FromIterator<T> for InsnList {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut list = InsnList::new();
        for insn in iter {
            list.push(insn);
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_iterate_in_order() {
        let list: InsnList = [opcodes::ICONST_0, opcodes::ICONST_1, opcodes::IADD]
            .into_iter()
            .map(InsnNode::from)
            .collect();

        assert_eq!(list.len(), 3);
        assert_eq!(
            list.opcodes(),
            vec![opcodes::ICONST_0, opcodes::ICONST_1, opcodes::IADD]
        );
    }

    #[test]
    fn test_unlink_retires_handles() {
        let mut list = InsnList::new();
        let a = list.push(InsnNode::from(opcodes::NOP));
        let b = list.push(InsnNode::from(opcodes::ICONST_1));
        let c = list.push(InsnNode::from(opcodes::POP));
        let d = list.push(InsnNode::from(opcodes::RETURN));

        list.unlink(b, c);

        assert_eq!(list.len(), 2);
        assert!(!list.is_live(b));
        assert!(!list.is_live(c));
        assert_eq!(list.next(a), Some(d));
        assert_eq!(list.prev(d), Some(a));
        assert_eq!(list.handles().collect::<Vec<_>>(), vec![a, d]);
    }

    #[test]
    fn test_link_before_head() {
        let mut list = InsnList::new();
        let a = list.push(InsnNode::from(opcodes::RETURN));
        let b = list.link_before(a, InsnNode::from(opcodes::NOP).into());

        assert_eq!(list.first(), Some(b));
        assert_eq!(list.handles().collect::<Vec<_>>(), vec![b, a]);
    }

    #[test]
    fn test_span_rejects_backwards_range() {
        let mut list = InsnList::new();
        let a = list.push(InsnNode::from(opcodes::NOP));
        let b = list.push(InsnNode::from(opcodes::NOP));

        assert_eq!(list.span(a, b), Some(vec![a, b]));
        assert_eq!(list.span(b, a), None);
    }

    #[test]
    fn test_retarget_switch_targets() {
        let mut list = InsnList::new();
        let a = list.push(InsnNode::from(opcodes::NOP));
        let b = list.push(InsnNode::from(opcodes::NOP));
        let mut switch = Insn::LookupSwitch(LookupSwitchInsnNode {
            insn: opcodes::LOOKUPSWITCH.into(),
            default: a,
            pairs: vec![(1, a), (2, b)],
        });

        assert_eq!(switch.retarget(a, b), 2);
        assert_eq!(switch.targets(), vec![b, b, b]);
    }
}
