use std::fs;
use std::path::Path;

use class_downgrader::batch::{self, BatchOptions, BatchPolicy, UnitStatus};
use class_downgrader::builder::{ClassFileBuilder, MethodBuilder};
use class_downgrader::class_reader::{read_class_file, ClassFile};
use class_downgrader::class_writer::write_class_file;
use class_downgrader::constant_pool::Constant;
use class_downgrader::constants::{ACC_PUBLIC, ACC_STATIC, V1_3, V1_5};
use class_downgrader::insn::InsnHandle;
use class_downgrader::method_code::{MethodCode, TryCatchBlock};
use class_downgrader::{insns, opcodes};
use class_downgrader::{DowngradeConfig, Downgrader, Status};

fn downgrader() -> Downgrader {
    Downgrader::new(DowngradeConfig::default()).unwrap()
}

/// `static { $assertionsDisabled = !Sample.class.desiredAssertionStatus(); }` with a
/// catch-all handler around the guard.
fn assertion_class(major: u16) -> ClassFile {
    let mut class = ClassFileBuilder::new("p/Sample", "java/lang/Object");
    class.version(major, 0);
    let pool = class.pool();
    let sample = pool.add_class("p/Sample").unwrap();
    let desired = pool
        .add_method_ref("java/lang/Class", "desiredAssertionStatus", "()Z")
        .unwrap();
    let disabled = pool
        .add_field_ref("p/Sample", "$assertionsDisabled", "Z")
        .unwrap();

    let mut code = MethodCode::new(
        2,
        0,
        insns! {
            [ldc LDC_W sample]
            [method INVOKEVIRTUAL desired]
            [ICONST_0]
            [field PUTSTATIC disabled]
            [RETURN]
            [ATHROW]
        }
        .into_iter()
        .collect(),
    );
    let handles: Vec<InsnHandle> = code.insns.handles().collect();
    let (zero, store, handler) = (handles[2], handles[3], handles[5]);
    code.insert_before(
        zero,
        insns! {
            [jump IFNE zero]
            [ICONST_1]
            [jump GOTO store]
        },
    )
    .unwrap();
    code.try_catch_blocks.push(TryCatchBlock {
        start: handles[0],
        end: Some(store),
        handler,
        catch_type: 0,
    });

    class.add_method(MethodBuilder::new(ACC_STATIC, "<clinit>", "()V").code(code));
    class.build().unwrap()
}

/// An inner class constructor storing `this$0` before calling `super()`.
fn inner_class(major: u16) -> ClassFile {
    let mut class = ClassFileBuilder::new("p/Outer$Inner", "java/lang/Object");
    class.version(major, 0);
    let pool = class.pool();
    let outer = pool
        .add_field_ref("p/Outer$Inner", "this$0", "Lp/Outer;")
        .unwrap();
    let init = pool
        .add_method_ref("java/lang/Object", "<init>", "()V")
        .unwrap();
    let code = MethodCode::new(
        2,
        2,
        insns! {
            [ALOAD_0]
            [ALOAD_1]
            [field PUTFIELD outer]
            [ALOAD_0]
            [method INVOKESPECIAL init]
            [RETURN]
        }
        .into_iter()
        .collect(),
    );
    class.add_method(MethodBuilder::new(0, "<init>", "(Lp/Outer;)V").code(code));
    class.build().unwrap()
}

fn string_class(major: u16) -> ClassFile {
    let mut class = ClassFileBuilder::new("p/Strings", "java/lang/Object");
    class.version(major, 0);
    let pool = class.pool();
    pool.add_method_ref(
        "java/lang/StringBuilder",
        "append",
        "(I)Ljava/lang/StringBuilder;",
    )
    .unwrap();
    pool.add_class("java/lang/AssertionError").unwrap();
    class.build().unwrap()
}

fn decoded_method(class: &ClassFile, index: usize) -> MethodCode {
    MethodCode::decode(class.methods[index].code().unwrap()).unwrap()
}

fn assert_references_live(class: &ClassFile) {
    for method in class.methods.iter().filter(|method| method.is_concrete()) {
        let code = MethodCode::decode(method.code().unwrap()).unwrap();
        assert!(code.dangling_references().is_empty());
    }
}

#[test]
fn test_builder_text_is_substituted() {
    let mut class = string_class(V1_5);

    downgrader().downgrade(&mut class).unwrap();

    let pool = &class.constant_pool;
    assert!(pool.find_utf8("java/lang/StringBuffer").is_some());
    assert!(pool.find_utf8("(I)Ljava/lang/StringBuffer;").is_some());
    assert!(pool.find_utf8("java/lang/Error").is_some());
}

#[test]
fn test_no_substitution_key_survives() {
    let config = DowngradeConfig::default();
    let mut class = string_class(V1_5);

    Downgrader::new(config.clone())
        .unwrap()
        .downgrade(&mut class)
        .unwrap();

    for (_, entry) in class.constant_pool.iter() {
        if let Constant::Utf8(text) = entry {
            assert!(!config.substitutions.contains_key(text), "{text} left behind");
        }
    }
}

#[test]
fn test_version_is_stamped_down() {
    let mut class = string_class(V1_5);

    let outcome = downgrader().downgrade(&mut class).unwrap();

    assert!(outcome.changed());
    assert_eq!(class.major_version, V1_3);
}

#[test]
fn test_class_at_target_is_byte_identical() {
    let mut class = assertion_class(V1_3);
    let bytes = write_class_file(&class).unwrap();

    let outcome = downgrader().downgrade(&mut class).unwrap();

    assert_eq!(outcome.status, Status::Unchanged);
    assert!(!outcome.changed());
    assert_eq!(write_class_file(&class).unwrap(), bytes);
}

#[test]
fn test_second_run_reports_unchanged() {
    let mut class = inner_class(V1_5);
    let downgrader = downgrader();

    assert!(downgrader.downgrade(&mut class).unwrap().changed());
    let once = write_class_file(&class).unwrap();
    let second = downgrader.downgrade(&mut class).unwrap();

    assert_eq!(second.status, Status::Unchanged);
    assert_eq!(write_class_file(&class).unwrap(), once);
}

#[test]
fn test_super_call_moves_before_outer_store() {
    let mut class = inner_class(V1_5);
    let before = decoded_method(&class, 0);

    downgrader().downgrade(&mut class).unwrap();

    let after = decoded_method(&class, 0);
    assert_eq!(
        after.insns.opcodes(),
        vec![
            opcodes::ALOAD_0,
            opcodes::INVOKESPECIAL,
            opcodes::ALOAD_0,
            opcodes::ALOAD_1,
            opcodes::PUTFIELD,
            opcodes::RETURN
        ]
    );
    let mut original: Vec<_> = before.insns.iter().map(|(_, insn)| insn.clone()).collect();
    let mut rewritten: Vec<_> = after.insns.iter().map(|(_, insn)| insn.clone()).collect();
    original.sort_by_key(|insn| (insn.opcode(), insn.constant_index()));
    rewritten.sort_by_key(|insn| (insn.opcode(), insn.constant_index()));
    assert_eq!(original, rewritten);
}

#[test]
fn test_assertion_guard_becomes_constant_true() {
    let mut class = assertion_class(V1_5);
    let before = decoded_method(&class, 0);

    let outcome = downgrader().downgrade(&mut class).unwrap();

    let after = decoded_method(&class, 0);
    assert_eq!(outcome.stats.rules.get("assertion_guard"), Some(&1));
    assert_eq!(after.insns.len(), before.insns.len() - 5);
    assert_eq!(
        after.insns.opcodes(),
        vec![
            opcodes::ICONST_1,
            opcodes::PUTSTATIC,
            opcodes::RETURN,
            opcodes::ATHROW
        ]
    );
    let block = after.try_catch_blocks[0];
    assert_eq!(Some(block.start), after.insns.first());
    assert_eq!(block.end, after.insns.next(block.start));
    assert_eq!(Some(block.handler), after.insns.last());
    assert_references_live(&class);
}

#[test]
fn test_wide_constants_keep_their_slots() {
    let mut builder = ClassFileBuilder::new("p/Wide", "java/lang/Object");
    let wide = builder.pool().push(Constant::Long(0x0102_0304_0506_0708)).unwrap();
    let text = builder.pool().add_utf8("java/lang/StringBuilder").unwrap();
    let mut class = builder.build().unwrap();

    downgrader().downgrade(&mut class).unwrap();
    let decoded = read_class_file(&write_class_file(&class).unwrap()).unwrap();

    assert_eq!(text, wide + 2);
    assert_eq!(
        decoded.constant_pool.get(wide),
        Some(&Constant::Long(0x0102_0304_0506_0708))
    );
    assert_eq!(decoded.constant_pool.get(wide + 1), None);
    assert_eq!(
        decoded.constant_pool.utf8(text).unwrap(),
        "java/lang/StringBuffer"
    );
}

#[test]
fn test_downgraded_classes_survive_the_codec() {
    for mut class in [assertion_class(V1_5), inner_class(V1_5), string_class(V1_5)] {
        downgrader().downgrade(&mut class).unwrap();

        let bytes = write_class_file(&class).unwrap();
        let decoded = read_class_file(&bytes).unwrap();

        assert_eq!(decoded, class);
        assert_references_live(&decoded);
    }
}

fn write_fixture(dir: &Path, name: &str, class: &ClassFile) -> Vec<u8> {
    let bytes = write_class_file(class).unwrap();
    fs::write(dir.join(name), &bytes).unwrap();
    bytes
}

#[test]
fn test_batch_rewrites_tree_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("p");
    fs::create_dir(&nested).unwrap();
    write_fixture(&nested, "Inner.class", &inner_class(V1_5));
    let old = write_fixture(dir.path(), "Old.class", &string_class(V1_3));

    let report = batch::run(&[dir.path()], &downgrader(), BatchOptions::default()).unwrap();

    assert!(!report.has_failures());
    assert_eq!(report.units.len(), 2);
    assert_eq!(fs::read(dir.path().join("Old.class")).unwrap(), old);
    let rewritten = read_class_file(&fs::read(nested.join("Inner.class")).unwrap()).unwrap();
    assert_eq!(rewritten.major_version, V1_3);
}

#[test]
fn test_batch_policy_decides_what_follows_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("A.class"), b"not a class").unwrap();
    let original = write_fixture(dir.path(), "B.class", &inner_class(V1_5));

    let aborted = batch::run(&[dir.path()], &downgrader(), BatchOptions::default()).unwrap();

    assert_eq!(aborted.units.len(), 1);
    assert!(matches!(aborted.units[0].status, UnitStatus::Failed(_)));
    assert_eq!(fs::read(dir.path().join("B.class")).unwrap(), original);

    let options = BatchOptions {
        policy: BatchPolicy::Continue,
        dry_run: false,
    };
    let continued = batch::run(&[dir.path()], &downgrader(), options).unwrap();

    assert!(continued.has_failures());
    assert_eq!(continued.units.len(), 2);
    assert!(matches!(continued.units[1].status, UnitStatus::Downgraded));
    let rewritten = read_class_file(&fs::read(dir.path().join("B.class")).unwrap()).unwrap();
    assert_eq!(rewritten.major_version, V1_3);
}

#[test]
fn test_dry_run_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let original = write_fixture(dir.path(), "Inner.class", &inner_class(V1_5));
    let options = BatchOptions {
        policy: BatchPolicy::AbortOnError,
        dry_run: true,
    };

    let report = batch::run(&[dir.path()], &downgrader(), options).unwrap();

    assert!(matches!(report.units[0].status, UnitStatus::Downgraded));
    assert_eq!(fs::read(dir.path().join("Inner.class")).unwrap(), original);
}

#[test]
fn test_public_method_without_rules_is_left_as_is() {
    let mut builder = ClassFileBuilder::new("p/Plain", "java/lang/Object");
    let code = MethodCode::new(1, 1, insns! { [ICONST_0] [IRETURN] }.into_iter().collect());
    builder.add_method(MethodBuilder::new(ACC_PUBLIC, "zero", "()I").code(code));
    let mut class = builder.build().unwrap();
    let body = class.methods[0].code().unwrap().clone();

    let outcome = downgrader().downgrade(&mut class).unwrap();

    assert_eq!(outcome.stats.methods_rewritten, 0);
    assert_eq!(class.methods[0].code().unwrap(), &body);
}
