//! Assembles [`ClassFile`] values from parts, mostly for fixtures.
//!
//! Symbolic operands are pool indices, so callers allocate constants through
//! [`ClassFileBuilder::pool`] first and then build method bodies around them:
//!
//! ```rust
//! use class_downgrader::builder::{ClassFileBuilder, MethodBuilder};
//! use class_downgrader::constants::ACC_PUBLIC;
//! use class_downgrader::insns;
//! use class_downgrader::method_code::MethodCode;
//!
//! let mut class = ClassFileBuilder::new("p/Hello", "java/lang/Object");
//! let value_of = class
//!     .pool()
//!     .add_method_ref("java/lang/Integer", "valueOf", "(I)Ljava/lang/Integer;")
//!     .unwrap();
//! let body = insns! {
//!     [ICONST_1]
//!     [method INVOKESTATIC value_of]
//!     [ARETURN]
//! };
//! class.add_method(
//!     MethodBuilder::new(ACC_PUBLIC, "one", "()Ljava/lang/Integer;")
//!         .code(MethodCode::new(1, 1, body.into_iter().collect())),
//! );
//!
//! let class = class.build().unwrap();
//! assert_eq!(class.methods.len(), 1);
//! ```

use crate::class_reader::{
    AttributeInfo, ClassFile, FieldInfo, MethodInfo, CODE, LINE_NUMBER_TABLE,
    LOCAL_VARIABLE_TABLE, LOCAL_VARIABLE_TYPE_TABLE,
};
use crate::constant_pool::ConstantPool;
use crate::constants::{ACC_PUBLIC, ACC_SUPER, V1_5};
use crate::error::Error;
use crate::method_code::{MethodCode, NestedAttribute};

pub struct ClassFileBuilder {
    minor_version: u16,
    major_version: u16,
    access_flags: u16,
    name: String,
    super_name: Option<String>,
    interfaces: Vec<String>,
    fields: Vec<FieldBuilder>,
    methods: Vec<MethodBuilder>,
    pool: ConstantPool,
}

impl ClassFileBuilder {
    pub fn new(name: &str, super_name: &str) -> Self {
        Self {
            minor_version: 0,
            major_version: V1_5,
            access_flags: ACC_PUBLIC | ACC_SUPER,
            name: name.to_string(),
            super_name: Some(super_name.to_string()),
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            pool: ConstantPool::new(),
        }
    }

    pub fn version(&mut self, major: u16, minor: u16) -> &mut Self {
        self.major_version = major;
        self.minor_version = minor;
        self
    }

    pub fn add_interface(&mut self, name: &str) -> &mut Self {
        self.interfaces.push(name.to_string());
        self
    }

    pub fn add_field(&mut self, field: FieldBuilder) -> &mut Self {
        self.fields.push(field);
        self
    }

    pub fn add_method(&mut self, method: MethodBuilder) -> &mut Self {
        self.methods.push(method);
        self
    }

    /// The pool the class will be built with.
    pub fn pool(&mut self) -> &mut ConstantPool {
        &mut self.pool
    }

    /// Resolves names into the pool and encodes every method body.
    pub fn build(mut self) -> Result<ClassFile, Error> {
        let pool = &mut self.pool;
        let this_class = pool.add_class(&self.name)?;
        let super_class = match self.super_name.as_deref() {
            Some(name) => pool.add_class(name)?,
            None => 0,
        };

        let mut interfaces = Vec::with_capacity(self.interfaces.len());
        for name in &self.interfaces {
            interfaces.push(pool.add_class(name)?);
        }

        let mut fields = Vec::with_capacity(self.fields.len());
        for field in self.fields {
            fields.push(FieldInfo {
                access_flags: field.access_flags,
                name_index: pool.add_utf8(&field.name)?,
                descriptor_index: pool.add_utf8(&field.descriptor)?,
                attributes: Vec::new(),
            });
        }

        let mut methods = Vec::with_capacity(self.methods.len());
        for method in self.methods {
            methods.push(method.build(pool)?);
        }

        Ok(ClassFile {
            minor_version: self.minor_version,
            major_version: self.major_version,
            constant_pool: self.pool,
            access_flags: self.access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes: Vec::new(),
        })
    }
}

pub struct FieldBuilder {
    access_flags: u16,
    name: String,
    descriptor: String,
}

impl FieldBuilder {
    pub fn new(access_flags: u16, name: &str, descriptor: &str) -> Self {
        Self {
            access_flags,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }
}

pub struct MethodBuilder {
    access_flags: u16,
    name: String,
    descriptor: String,
    code: Option<MethodCode>,
    attributes: Vec<AttributeInfo>,
}

impl MethodBuilder {
    pub fn new(access_flags: u16, name: &str, descriptor: &str) -> Self {
        Self {
            access_flags,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            code: None,
            attributes: Vec::new(),
        }
    }

    /// Gives the method a body. Without one it is written with no `Code` attribute.
    pub fn code(mut self, code: MethodCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn attribute(mut self, attr: AttributeInfo) -> Self {
        self.attributes.push(attr);
        self
    }

    fn build(self, pool: &mut ConstantPool) -> Result<MethodInfo, Error> {
        let name_index = pool.add_utf8(&self.name)?;
        let descriptor_index = pool.add_utf8(&self.descriptor)?;
        let mut attributes = Vec::with_capacity(self.attributes.len() + 1);
        if let Some(mut code) = self.code {
            attach_debug_tables(&mut code, pool)?;
            let code_name = pool.add_utf8(CODE)?;
            attributes.push(AttributeInfo::Code(code.encode(code_name)?));
        }
        attributes.extend(self.attributes);
        Ok(MethodInfo {
            access_flags: self.access_flags,
            name_index,
            descriptor_index,
            attributes,
        })
    }
}

/// Debug entries only reach the encoder through a table placeholder, so add the
/// placeholders a hand-built body is missing.
fn attach_debug_tables(code: &mut MethodCode, pool: &mut ConstantPool) -> Result<(), Error> {
    let has = |code: &MethodCode, wanted: fn(&NestedAttribute) -> bool| {
        code.attributes.iter().any(wanted)
    };
    if !code.line_numbers.is_empty()
        && !has(code, |attr| matches!(attr, NestedAttribute::LineNumbers { .. }))
    {
        let name_index = pool.add_utf8(LINE_NUMBER_TABLE)?;
        code.attributes.push(NestedAttribute::LineNumbers { name_index });
    }
    if !code.local_variables.is_empty()
        && !has(code, |attr| matches!(attr, NestedAttribute::LocalVariables { .. }))
    {
        let name_index = pool.add_utf8(LOCAL_VARIABLE_TABLE)?;
        code.attributes.push(NestedAttribute::LocalVariables { name_index });
    }
    if !code.local_variable_types.is_empty()
        && !has(code, |attr| matches!(attr, NestedAttribute::LocalVariableTypes { .. }))
    {
        let name_index = pool.add_utf8(LOCAL_VARIABLE_TYPE_TABLE)?;
        code.attributes.push(NestedAttribute::LocalVariableTypes { name_index });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class_reader::read_class_file;
    use crate::class_writer::write_class_file;
    use crate::constants::ACC_ABSTRACT;
    use crate::insns;
    use crate::method_code::LineNumberNode;
    use crate::opcodes;

    #[test]
    fn test_built_class_survives_the_codec() {
        let mut class = ClassFileBuilder::new("p/Sample", "java/lang/Object");
        class.add_interface("java/io/Serializable");
        class.add_field(FieldBuilder::new(0, "count", "I"));
        let mut code = MethodCode::new(1, 1, insns! { [ICONST_0] [IRETURN] }.into_iter().collect());
        let first = code.insns.first().unwrap();
        code.line_numbers.push(LineNumberNode { start: first, line: 3 });
        class.add_method(MethodBuilder::new(ACC_PUBLIC, "zero", "()I").code(code));
        class.add_method(MethodBuilder::new(ACC_PUBLIC | ACC_ABSTRACT, "run", "()V"));

        let built = class.build().unwrap();
        let bytes = write_class_file(&built).unwrap();
        let decoded = read_class_file(&bytes).unwrap();

        assert_eq!(decoded, built);
        assert_eq!(decoded.name().unwrap(), "p/Sample");
        assert_eq!(decoded.major_version, V1_5);
        let zero = &decoded.methods[0];
        assert_eq!(zero.code().unwrap().code, vec![opcodes::ICONST_0, opcodes::IRETURN]);
        assert!(matches!(
            zero.code().unwrap().attributes.as_slice(),
            [AttributeInfo::LineNumberTable { entries, .. }] if entries[0].line_number == 3
        ));
        assert!(!decoded.methods[1].is_concrete());
    }
}
