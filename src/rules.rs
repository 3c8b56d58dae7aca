//! Structural rewrites applied to method bodies.
//!
//! Each rule pairs a [`Pattern`] with a constant pool check and a transform built
//! from the editor primitives. Rules never introduce new control flow.

use std::collections::BTreeMap;

use crate::constant_pool::{Constant, ConstantPool};
use crate::constants::CONSTRUCTOR_NAME;
use crate::error::{EditError, RetargetFailure, SymbolError};
use crate::insn::{Insn, InsnHandle, InsnList, InsnNode, MethodInsnNode, TypeInsnNode};
use crate::method_code::MethodCode;
use crate::opcodes;
use crate::pattern::{InstructionFinder, Pattern, Token};

const INTEGER: &str = "java/lang/Integer";
const INTEGER_VALUE_OF: &str = "(I)Ljava/lang/Integer;";
const INT_CONSTRUCTOR: &str = "(I)V";

pub trait RewriteRule {
    /// Stable identifier, also used as the configuration key.
    fn name(&self) -> &'static str;

    fn pattern(&self) -> &Pattern;

    /// Whether the rule runs on a method with this name at all.
    fn applies_to(&self, _method_name: &str) -> bool {
        true
    }

    /// Allocates constants the transform will need. Runs once per unit, before any
    /// method is searched.
    fn prepare(&self, _pool: &mut ConstantPool) -> Result<(), SymbolError> {
        Ok(())
    }

    /// Symbolic check of an opcode-level match.
    fn accept(&self, pool: &ConstantPool, insns: &InsnList, matched: &[InsnHandle]) -> bool;

    fn transform(
        &self,
        pool: &ConstantPool,
        code: &mut MethodCode,
        matched: &[InsnHandle],
    ) -> Result<(), EditError>;
}

fn constant_index(insns: &InsnList, handle: InsnHandle) -> Option<u16> {
    insns.get(handle).and_then(Insn::constant_index)
}

/// Folds a `desiredAssertionStatus` guard into a constant `true`.
///
/// ```text
/// LDC <class>                      ICONST_1
/// INVOKEVIRTUAL desiredAssertionStatus
/// IFNE L1                   =>
/// ICONST_1
/// GOTO L2
/// L1: ICONST_0
/// L2:
/// ```
#[derive(Debug, Clone)]
pub struct AssertionGuard {
    pattern: Pattern,
}

impl AssertionGuard {
    pub const NAME: &'static str = "assertion_guard";

    pub fn new() -> Self {
        const LOADS: &[u8] = &[opcodes::LDC, opcodes::LDC_W];
        Self {
            pattern: Pattern::new(vec![
                Token::AnyOf(LOADS),
                Token::Op(opcodes::INVOKEVIRTUAL),
                Token::Op(opcodes::IFNE),
                Token::Op(opcodes::ICONST_1),
                Token::Op(opcodes::GOTO),
                Token::Op(opcodes::ICONST_0),
            ]),
        }
    }
}

impl Default for AssertionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl RewriteRule for AssertionGuard {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    fn accept(&self, pool: &ConstantPool, insns: &InsnList, matched: &[InsnHandle]) -> bool {
        let loads_class = constant_index(insns, matched[0])
            .is_some_and(|index| matches!(pool.get(index), Some(Constant::Class { .. })));
        loads_class
            && constant_index(insns, matched[1])
                .and_then(|index| pool.method_ref(index).ok())
                .is_some_and(|member| member.name == "desiredAssertionStatus")
    }

    fn transform(
        &self,
        _pool: &ConstantPool,
        code: &mut MethodCode,
        matched: &[InsnHandle],
    ) -> Result<(), EditError> {
        code.delete(matched[1], matched[5])?;
        code.replace(matched[0], InsnNode::from(opcodes::ICONST_1).into())?;
        Ok(())
    }
}

/// Moves the superclass constructor call in front of the `this$0` store, which
/// older verifiers reject on an uninitialized `this`.
///
/// `ALOAD_0 ALOAD_1 PUTFIELD this$0 ALOAD_0 INVOKESPECIAL` becomes
/// `ALOAD_0 INVOKESPECIAL ALOAD_0 ALOAD_1 PUTFIELD this$0`.
#[derive(Debug, Clone)]
pub struct OuterThisReorder {
    pattern: Pattern,
}

impl OuterThisReorder {
    pub const NAME: &'static str = "outer_this_reorder";

    pub fn new() -> Self {
        Self {
            pattern: Pattern::new(vec![
                Token::Op(opcodes::ALOAD_0),
                Token::Op(opcodes::ALOAD_1),
                Token::Op(opcodes::PUTFIELD),
                Token::Op(opcodes::ALOAD_0),
                Token::Op(opcodes::INVOKESPECIAL),
            ]),
        }
    }
}

impl Default for OuterThisReorder {
    fn default() -> Self {
        Self::new()
    }
}

impl RewriteRule for OuterThisReorder {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    fn applies_to(&self, method_name: &str) -> bool {
        method_name == CONSTRUCTOR_NAME
    }

    fn accept(&self, pool: &ConstantPool, insns: &InsnList, matched: &[InsnHandle]) -> bool {
        constant_index(insns, matched[2])
            .and_then(|index| pool.field_ref(index).ok())
            .is_some_and(|member| member.name == "this$0")
    }

    fn transform(
        &self,
        _pool: &ConstantPool,
        code: &mut MethodCode,
        matched: &[InsnHandle],
    ) -> Result<(), EditError> {
        let moved: Vec<Insn> = [matched[3], matched[4]]
            .iter()
            .map(|&handle| code.insns.get(handle).cloned().ok_or(EditError::NotLive(handle)))
            .collect::<Result<_, _>>()?;
        code.delete(matched[3], matched[4])?;
        let inserted = code.insert_before(matched[0], moved)?;
        // Jumps into the window land on the moved call; protected ranges keep their bounds.
        code.redirect_entries(matched[0], inserted[0])?;
        Ok(())
    }
}

/// Expands `Integer.valueOf(int)` into an explicit `new Integer(int)`.
///
/// The value is already on the stack, so the new reference is tucked under it:
/// `NEW Integer; DUP_X1; SWAP; INVOKESPECIAL Integer.<init>(I)V`.
#[derive(Debug, Clone)]
pub struct BoxingExpansion {
    pattern: Pattern,
}

impl BoxingExpansion {
    pub const NAME: &'static str = "boxing_expansion";

    pub fn new() -> Self {
        Self {
            pattern: Pattern::new(vec![Token::Op(opcodes::INVOKESTATIC)]),
        }
    }
}

impl Default for BoxingExpansion {
    fn default() -> Self {
        Self::new()
    }
}

impl RewriteRule for BoxingExpansion {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    fn prepare(&self, pool: &mut ConstantPool) -> Result<(), SymbolError> {
        if pool
            .find_method_ref(INTEGER, "valueOf", INTEGER_VALUE_OF)
            .is_some()
        {
            pool.add_method_ref(INTEGER, CONSTRUCTOR_NAME, INT_CONSTRUCTOR)?;
        }
        Ok(())
    }

    fn accept(&self, pool: &ConstantPool, insns: &InsnList, matched: &[InsnHandle]) -> bool {
        let is_value_of = constant_index(insns, matched[0])
            .and_then(|index| pool.method_ref(index).ok())
            .is_some_and(|member| {
                member.owner == INTEGER
                    && member.name == "valueOf"
                    && member.descriptor == INTEGER_VALUE_OF
            });
        is_value_of
            && pool.find_class(INTEGER).is_some()
            && pool
                .find_method_ref(INTEGER, CONSTRUCTOR_NAME, INT_CONSTRUCTOR)
                .is_some()
    }

    fn transform(
        &self,
        pool: &ConstantPool,
        code: &mut MethodCode,
        matched: &[InsnHandle],
    ) -> Result<(), EditError> {
        // `accept` already saw both entries, so a miss here means the pool changed
        // underneath us; leave the call alone.
        let (Some(class_index), Some(constructor)) = (
            pool.find_class(INTEGER),
            pool.find_method_ref(INTEGER, CONSTRUCTOR_NAME, INT_CONSTRUCTOR),
        ) else {
            return Ok(());
        };
        let prefix = vec![
            Insn::Type(TypeInsnNode {
                insn: InsnNode::from(opcodes::NEW),
                type_index: class_index,
            }),
            InsnNode::from(opcodes::DUP_X1).into(),
            InsnNode::from(opcodes::SWAP).into(),
        ];
        let inserted = code.insert_before(matched[0], prefix)?;
        code.replace(
            matched[0],
            Insn::Method(MethodInsnNode {
                insn: InsnNode::from(opcodes::INVOKESPECIAL),
                method_index: constructor,
            }),
        )?;
        code.redirect(matched[0], inserted[0])?;
        Ok(())
    }
}

/// Which rules a [`RuleSet`] runs. Rule order is fixed regardless of which are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct RuleToggles {
    pub assertion_guard: bool,
    pub outer_this_reorder: bool,
    pub boxing_expansion: bool,
}

impl Default for RuleToggles {
    fn default() -> Self {
        Self {
            assertion_guard: true,
            outer_this_reorder: true,
            boxing_expansion: false,
        }
    }
}

/// How many matches each rule rewrote, keyed by rule name.
pub type RuleCounts = BTreeMap<&'static str, usize>;

pub struct RuleSet {
    rules: Vec<Box<dyn RewriteRule>>,
}

impl std::fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|rule| rule.name()))
            .finish()
    }
}

impl RuleSet {
    pub fn new(rules: Vec<Box<dyn RewriteRule>>) -> Self {
        Self { rules }
    }

    pub fn from_toggles(toggles: RuleToggles) -> Self {
        let mut rules: Vec<Box<dyn RewriteRule>> = Vec::new();
        if toggles.assertion_guard {
            rules.push(Box::new(AssertionGuard::new()));
        }
        if toggles.outer_this_reorder {
            rules.push(Box::new(OuterThisReorder::new()));
        }
        if toggles.boxing_expansion {
            rules.push(Box::new(BoxingExpansion::new()));
        }
        Self { rules }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }

    pub fn prepare(&self, pool: &mut ConstantPool) -> Result<(), SymbolError> {
        self.rules.iter().try_for_each(|rule| rule.prepare(pool))
    }

    /// Runs every applicable rule over `code`, in order.
    ///
    /// Each rule searches the list as the previous rule left it. On the first failed
    /// transform the error is returned and `code` may hold partial edits; callers keep
    /// a copy to roll back to. `method` only labels log lines and failures.
    pub fn apply(
        &self,
        method: &str,
        method_name: &str,
        pool: &ConstantPool,
        code: &mut MethodCode,
    ) -> Result<RuleCounts, RetargetFailure> {
        let mut counts = RuleCounts::new();
        for rule in self.rules.iter().filter(|rule| rule.applies_to(method_name)) {
            let constraint =
                |insns: &InsnList, matched: &[InsnHandle]| rule.accept(pool, insns, matched);
            let matches = InstructionFinder::new(&code.insns).search(rule.pattern(), &constraint);

            for matched in matches {
                rule.transform(pool, code, &matched)
                    .map_err(|source| RetargetFailure {
                        rule: rule.name(),
                        method: method.to_string(),
                        matched: matched.clone(),
                        source,
                    })?;
                log::debug!("{}: rewrote {} at {}", rule.name(), method, matched[0]);
                *counts.entry(rule.name()).or_default() += 1;
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insns;

    struct Fixture {
        pool: ConstantPool,
        class: u16,
        desired: u16,
        outer: u16,
        super_init: u16,
    }

    fn fixture() -> Fixture {
        let mut pool = ConstantPool::new();
        let class = pool.add_class("p/Outer").unwrap();
        let desired = pool
            .add_method_ref("java/lang/Class", "desiredAssertionStatus", "()Z")
            .unwrap();
        let outer = pool
            .add_field_ref("p/Outer$Inner", "this$0", "Lp/Outer;")
            .unwrap();
        let super_init = pool
            .add_method_ref("java/lang/Object", "<init>", "()V")
            .unwrap();
        Fixture {
            pool,
            class,
            desired,
            outer,
            super_init,
        }
    }

    fn code(insns: Vec<Insn>) -> MethodCode {
        MethodCode::new(4, 4, insns.into_iter().collect())
    }

    fn assertion_guard_code(f: &Fixture) -> (MethodCode, Vec<InsnHandle>) {
        let mut code = code(insns! {
            [ldc LDC_W f.class]
            [method INVOKEVIRTUAL f.desired]
            [ICONST_0]
            [ISTORE_1]
            [RETURN]
        });
        let mut handles: Vec<InsnHandle> = code.insns.handles().collect();
        let (zero, store) = (handles[2], handles[3]);
        // Forward branches go in once their targets exist.
        let jumps = insns! {
            [jump IFNE zero]
            [ICONST_1]
            [jump GOTO store]
        };
        let inserted = code.insert_before(zero, jumps).unwrap();
        handles.splice(2..2, inserted);
        (code, handles)
    }

    #[test]
    fn test_toggles_select_rules_in_fixed_order() {
        assert_eq!(
            RuleSet::from_toggles(RuleToggles::default()).names(),
            vec![AssertionGuard::NAME, OuterThisReorder::NAME]
        );
        let all = RuleToggles {
            assertion_guard: true,
            outer_this_reorder: true,
            boxing_expansion: true,
        };
        assert_eq!(
            RuleSet::from_toggles(all).names(),
            vec![AssertionGuard::NAME, OuterThisReorder::NAME, BoxingExpansion::NAME]
        );
        let only_boxing = RuleToggles {
            assertion_guard: false,
            outer_this_reorder: false,
            boxing_expansion: true,
        };
        assert_eq!(
            RuleSet::from_toggles(only_boxing).names(),
            vec![BoxingExpansion::NAME]
        );
    }

    #[test]
    fn test_assertion_guard_collapses_to_constant() {
        let f = fixture();
        let (mut code, handles) = assertion_guard_code(&f);
        let rules = RuleSet::new(vec![Box::new(AssertionGuard::new())]);

        let counts = rules.apply("C.m()V", "m", &f.pool, &mut code).unwrap();

        assert_eq!(counts.get(AssertionGuard::NAME), Some(&1));
        assert_eq!(code.insns.len(), 3);
        assert_eq!(
            code.insns.opcodes(),
            vec![opcodes::ICONST_1, opcodes::ISTORE_1, opcodes::RETURN]
        );
        assert_eq!(code.insns.first(), Some(handles[0]));
        assert!(code.dangling_references().is_empty());
    }

    #[test]
    fn test_assertion_guard_needs_class_constant() {
        let mut f = fixture();
        let text = f.pool.add_string("not a class").unwrap();
        let mut code = code(insns! {
            [ldc LDC text]
            [method INVOKEVIRTUAL f.desired]
            [RETURN]
        });

        let rule = AssertionGuard::new();
        let found = InstructionFinder::new(&code.insns).search(
            rule.pattern(),
            &|insns: &InsnList, matched: &[InsnHandle]| rule.accept(&f.pool, insns, matched),
        );

        assert!(found.is_empty());
        let before = code.insns.opcodes();
        RuleSet::new(vec![Box::new(rule)])
            .apply("C.m()V", "m", &f.pool, &mut code)
            .unwrap();
        assert_eq!(code.insns.opcodes(), before);
    }

    fn reorder_code(f: &Fixture) -> MethodCode {
        code(insns! {
            [ALOAD_0]
            [ALOAD_1]
            [field PUTFIELD f.outer]
            [ALOAD_0]
            [method INVOKESPECIAL f.super_init]
            [RETURN]
        })
    }

    #[test]
    fn test_outer_this_reorder_moves_super_call_first() {
        let f = fixture();
        let mut code = reorder_code(&f);
        let original: Vec<InsnHandle> = code.insns.handles().collect();
        code.line_numbers.push(crate::method_code::LineNumberNode {
            start: original[0],
            line: 7,
        });

        let counts = RuleSet::from_toggles(RuleToggles::default())
            .apply("p/Outer$Inner.<init>(Lp/Outer;)V", "<init>", &f.pool, &mut code)
            .unwrap();

        assert_eq!(counts.get(OuterThisReorder::NAME), Some(&1));
        assert_eq!(
            code.insns.opcodes(),
            vec![
                opcodes::ALOAD_0,
                opcodes::INVOKESPECIAL,
                opcodes::ALOAD_0,
                opcodes::ALOAD_1,
                opcodes::PUTFIELD,
                opcodes::RETURN
            ]
        );
        let first = code.insns.first().unwrap();
        assert_eq!(code.line_numbers[0].start, first);
        assert!(code.dangling_references().is_empty());
    }

    #[test]
    fn test_outer_this_reorder_does_not_widen_protected_range() {
        let f = fixture();
        let mut code = reorder_code(&f);
        let original: Vec<InsnHandle> = code.insns.handles().collect();
        code.try_catch_blocks.push(crate::method_code::TryCatchBlock {
            start: original[0],
            end: Some(original[3]),
            handler: original[5],
            catch_type: 0,
        });

        RuleSet::from_toggles(RuleToggles::default())
            .apply("p/Outer$Inner.<init>(Lp/Outer;)V", "<init>", &f.pool, &mut code)
            .unwrap();

        // The range still covers exactly the `this$0` store.
        let block = &code.try_catch_blocks[0];
        assert_eq!(block.start, original[0]);
        assert_eq!(block.end, Some(original[5]));
        let covered: Vec<u8> = code
            .insns
            .iter()
            .skip_while(|(handle, _)| *handle != block.start)
            .take_while(|(handle, _)| Some(*handle) != block.end)
            .map(|(_, insn)| insn.opcode())
            .collect();
        assert_eq!(
            covered,
            vec![opcodes::ALOAD_0, opcodes::ALOAD_1, opcodes::PUTFIELD]
        );
    }

    #[test]
    fn test_outer_this_reorder_skips_other_methods_and_fields() {
        let mut f = fixture();
        let mut code = reorder_code(&f);
        let rules = RuleSet::from_toggles(RuleToggles::default());

        rules.apply("C.m()V", "m", &f.pool, &mut code).unwrap();
        assert_eq!(code.insns.opcodes()[1], opcodes::ALOAD_1);

        let other = f.pool.add_field_ref("p/Outer$Inner", "val$x", "I").unwrap();
        let mut code = code_with_field(&f, other);
        rules.apply("C.<init>()V", "<init>", &f.pool, &mut code).unwrap();
        assert_eq!(code.insns.opcodes()[1], opcodes::ALOAD_1);
    }

    fn code_with_field(f: &Fixture, field: u16) -> MethodCode {
        code(insns! {
            [ALOAD_0]
            [ALOAD_1]
            [field PUTFIELD field]
            [ALOAD_0]
            [method INVOKESPECIAL f.super_init]
            [RETURN]
        })
    }

    #[test]
    fn test_failed_transform_reports_match() {
        let f = fixture();
        // Nothing follows the window, and a branch into it has nowhere to go.
        let mut code = code(insns! {
            [ALOAD_0]
            [ALOAD_1]
            [field PUTFIELD f.outer]
            [ALOAD_0]
            [method INVOKESPECIAL f.super_init]
        });
        let handles: Vec<InsnHandle> = code.insns.handles().collect();
        code.insert_before(
            handles[0],
            insns! { [jump GOTO handles[3]] },
        )
        .unwrap();

        let failure = RuleSet::from_toggles(RuleToggles::default())
            .apply("C.<init>()V", "<init>", &f.pool, &mut code)
            .unwrap_err();

        assert_eq!(failure.rule, OuterThisReorder::NAME);
        assert_eq!(failure.matched, handles);
        assert!(matches!(failure.source, EditError::TargetLost { .. }));
    }

    #[test]
    fn test_boxing_expansion_uses_prepared_constants() {
        let mut pool = ConstantPool::new();
        let value_of = pool
            .add_method_ref(INTEGER, "valueOf", INTEGER_VALUE_OF)
            .unwrap();
        let rules = RuleSet::from_toggles(RuleToggles {
            boxing_expansion: true,
            ..RuleToggles::default()
        });
        rules.prepare(&mut pool).unwrap();
        let mut code = code(insns! {
            [ILOAD_1]
            [method INVOKESTATIC value_of]
            [ARETURN]
        });

        let counts = rules.apply("C.box(I)Ljava/lang/Integer;", "box", &pool, &mut code).unwrap();

        assert_eq!(counts.get(BoxingExpansion::NAME), Some(&1));
        assert_eq!(
            code.insns.opcodes(),
            vec![
                opcodes::ILOAD_1,
                opcodes::NEW,
                opcodes::DUP_X1,
                opcodes::SWAP,
                opcodes::INVOKESPECIAL,
                opcodes::ARETURN
            ]
        );
        let constructor = pool
            .find_method_ref(INTEGER, CONSTRUCTOR_NAME, INT_CONSTRUCTOR)
            .unwrap();
        let invoke = code.insns.iter().nth(4).unwrap().1;
        assert_eq!(invoke.constant_index(), Some(constructor));
    }

    #[test]
    fn test_boxing_prepare_leaves_unrelated_pool_alone() {
        let mut pool = ConstantPool::new();
        pool.add_utf8("unrelated").unwrap();
        let count = pool.count();

        BoxingExpansion::new().prepare(&mut pool).unwrap();

        assert_eq!(pool.count(), count);
    }
}
