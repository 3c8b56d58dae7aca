/// Builds a `Vec<Insn>` from a compact bracketed syntax.
///
/// Operands are raw: constant pool indices for symbolic instructions and an
/// [`InsnHandle`](crate::insn::InsnHandle) expression for jumps.
///
/// * `[OPCODE]` for instructions without operands
/// * `[int BIPUSH 10]`
/// * `[var ALOAD 4]`
/// * `[type NEW 5]`
/// * `[field PUTFIELD 12]`
/// * `[method INVOKEVIRTUAL 9]`
/// * `[ldc LDC 3]`
/// * `[jump GOTO handle]`
/// * `[iinc 1, 5]`
///
/// ```rust
/// use class_downgrader::{insns, opcodes, insn::Insn};
///
/// let code = insns! {
///     [ldc LDC 2]
///     [method INVOKEVIRTUAL 7]
///     [var ISTORE 1]
///     [iinc 1, -1]
///     [RETURN]
/// };
///
/// assert_eq!(code.len(), 5);
/// assert_eq!(code[1].opcode(), opcodes::INVOKEVIRTUAL);
/// assert!(matches!(&code[3], Insn::Iinc(node) if node.increment == -1));
/// ```
#[macro_export]
macro_rules! insns {
    ( $( [ $($instruction:tt)+ ] )* ) => {
        {
            #[allow(unused_mut)]
            let mut list: ::std::vec::Vec<$crate::insn::Insn> = ::std::vec::Vec::new();
            $(
                list.push($crate::insns!(@one $($instruction)+));
            )*
            list
        }
    };

    (@one $opcode:ident) => {
        $crate::insn::Insn::Simple($crate::insn::InsnNode { opcode: $crate::opcodes::$opcode })
    };

    (@one int $opcode:ident $operand:expr) => {
        $crate::insn::Insn::Int($crate::insn::IntInsnNode {
            insn: $crate::insn::InsnNode { opcode: $crate::opcodes::$opcode },
            operand: $operand as i32,
        })
    };

    (@one var $opcode:ident $index:expr) => {
        $crate::insn::Insn::Var($crate::insn::VarInsnNode {
            insn: $crate::insn::InsnNode { opcode: $crate::opcodes::$opcode },
            var_index: $index as u16,
        })
    };

    (@one type $opcode:ident $index:expr) => {
        $crate::insn::Insn::Type($crate::insn::TypeInsnNode {
            insn: $crate::insn::InsnNode { opcode: $crate::opcodes::$opcode },
            type_index: $index as u16,
        })
    };

    (@one field $opcode:ident $index:expr) => {
        $crate::insn::Insn::Field($crate::insn::FieldInsnNode {
            insn: $crate::insn::InsnNode { opcode: $crate::opcodes::$opcode },
            field_index: $index as u16,
        })
    };

    (@one method $opcode:ident $index:expr) => {
        $crate::insn::Insn::Method($crate::insn::MethodInsnNode {
            insn: $crate::insn::InsnNode { opcode: $crate::opcodes::$opcode },
            method_index: $index as u16,
        })
    };

    (@one ldc $opcode:ident $index:expr) => {
        $crate::insn::Insn::Ldc($crate::insn::LdcInsnNode {
            insn: $crate::insn::InsnNode { opcode: $crate::opcodes::$opcode },
            index: $index as u16,
        })
    };

    (@one jump $opcode:ident $target:expr) => {
        $crate::insn::Insn::Jump($crate::insn::JumpInsnNode {
            insn: $crate::insn::InsnNode { opcode: $crate::opcodes::$opcode },
            target: $target,
        })
    };

    (@one iinc $var:expr, $incr:expr) => {
        $crate::insn::Insn::Iinc($crate::insn::IincInsnNode {
            insn: $crate::insn::InsnNode { opcode: $crate::opcodes::IINC },
            var_index: $var as u16,
            increment: $incr as i16,
        })
    };
}

#[cfg(test)]
mod tests {
    use crate::insn::{Insn, InsnList};
    use crate::opcodes;

    #[test]
    fn test_insns_macro_expansion() {
        let mut list = InsnList::new();
        let target = list.push(crate::insn::InsnNode::from(opcodes::RETURN));

        let insns = insns! {
            [NOP]
            [int BIPUSH 42]
            [var ALOAD 1]
            [type NEW 5]
            [field GETSTATIC 6]
            [method INVOKESPECIAL 7]
            [ldc LDC_W 300]
            [jump IFNE target]
            [iinc 2, 1]
            [RETURN]
        };

        assert_eq!(insns.len(), 10);
        assert_eq!(
            insns.iter().map(Insn::opcode).collect::<Vec<_>>(),
            vec![
                opcodes::NOP,
                opcodes::BIPUSH,
                opcodes::ALOAD,
                opcodes::NEW,
                opcodes::GETSTATIC,
                opcodes::INVOKESPECIAL,
                opcodes::LDC_W,
                opcodes::IFNE,
                opcodes::IINC,
                opcodes::RETURN
            ]
        );
        assert!(matches!(&insns[1], Insn::Int(node) if node.operand == 42));
        assert_eq!(insns[4].constant_index(), Some(6));
        assert_eq!(insns[6].constant_index(), Some(300));
        assert_eq!(insns[7].targets(), vec![target]);
    }
}
