//! Indexed view over a class file's constant pool.
//!
//! Index 0 and the slot after every `Long`/`Double` hold [`Constant::Reserved`], so
//! positions in the backing vector are exactly the 1-based indices that instructions
//! and other entries refer to. Entries are only ever mutated in place or appended.

use std::fmt;

use crate::error::SymbolError;

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// Index 0, and the second slot of a wide entry.
    Reserved,
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class {
        name_index: u16,
    },
    String {
        string_index: u16,
    },
    Fieldref {
        class_index: u16,
        name_and_type_index: u16,
    },
    Methodref {
        class_index: u16,
        name_and_type_index: u16,
    },
    InterfaceMethodref {
        class_index: u16,
        name_and_type_index: u16,
    },
    NameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    MethodHandle {
        reference_kind: u8,
        reference_index: u16,
    },
    MethodType {
        descriptor_index: u16,
    },
    Dynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    InvokeDynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    Module {
        name_index: u16,
    },
    Package {
        name_index: u16,
    },
}

impl Constant {
    pub fn tag(&self) -> u8 {
        match self {
            Constant::Reserved => 0,
            Constant::Utf8(_) => 1,
            Constant::Integer(_) => 3,
            Constant::Float(_) => 4,
            Constant::Long(_) => 5,
            Constant::Double(_) => 6,
            Constant::Class { .. } => 7,
            Constant::String { .. } => 8,
            Constant::Fieldref { .. } => 9,
            Constant::Methodref { .. } => 10,
            Constant::InterfaceMethodref { .. } => 11,
            Constant::NameAndType { .. } => 12,
            Constant::MethodHandle { .. } => 15,
            Constant::MethodType { .. } => 16,
            Constant::Dynamic { .. } => 17,
            Constant::InvokeDynamic { .. } => 18,
            Constant::Module { .. } => 19,
            Constant::Package { .. } => 20,
        }
    }

    /// `Long` and `Double` occupy two indices.
    pub fn is_wide(&self) -> bool {
        matches!(self, Constant::Long(_) | Constant::Double(_))
    }
}

/// A field or method reference with every index resolved to text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberRef<'a> {
    pub owner: &'a str,
    pub name: &'a str,
    pub descriptor: &'a str,
}

impl fmt::Display for MemberRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.owner, self.name, self.descriptor)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstantPool {
    entries: Vec<Constant>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    pub fn new() -> Self {
        Self {
            entries: vec![Constant::Reserved],
        }
    }

    /// Builds a pool from entries already laid out by index (slot 0 included).
    pub fn from_entries(entries: Vec<Constant>) -> Self {
        if entries.is_empty() {
            return Self::new();
        }
        Self { entries }
    }

    /// The `constant_pool_count` value: one more than the highest index.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, index: u16) -> Option<&Constant> {
        match self.entries.get(index as usize) {
            Some(Constant::Reserved) | None => None,
            Some(entry) => Some(entry),
        }
    }

    pub fn get_mut(&mut self, index: u16) -> Option<&mut Constant> {
        match self.entries.get_mut(index as usize) {
            Some(Constant::Reserved) | None => None,
            Some(entry) => Some(entry),
        }
    }

    pub fn entry(&self, index: u16) -> Result<&Constant, SymbolError> {
        self.get(index).ok_or(SymbolError::InvalidIndex(index))
    }

    /// Usable indices in ascending order. Reserved slots (including the one
    /// shadowed by each wide entry) are never yielded.
    pub fn indices(&self) -> impl Iterator<Item = u16> + '_ {
        let mut index = 1usize;
        std::iter::from_fn(move || {
            while index < self.entries.len() {
                let current = index;
                let entry = &self.entries[current];
                index += if entry.is_wide() { 2 } else { 1 };
                if !matches!(entry, Constant::Reserved) {
                    return Some(current as u16);
                }
            }
            None
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &Constant)> + '_ {
        self.indices().map(|index| (index, &self.entries[index as usize]))
    }

    /// Raw slots, `Reserved` included, for encoding.
    pub fn slots(&self) -> &[Constant] {
        &self.entries
    }

    pub fn utf8(&self, index: u16) -> Result<&str, SymbolError> {
        match self.entry(index)? {
            Constant::Utf8(value) => Ok(value.as_str()),
            _ => Err(SymbolError::UnexpectedKind {
                index,
                expected: "Utf8",
            }),
        }
    }

    pub fn class_name(&self, index: u16) -> Result<&str, SymbolError> {
        match self.entry(index)? {
            Constant::Class { name_index } => self.utf8(*name_index),
            _ => Err(SymbolError::UnexpectedKind {
                index,
                expected: "Class",
            }),
        }
    }

    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str), SymbolError> {
        match self.entry(index)? {
            Constant::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            _ => Err(SymbolError::UnexpectedKind {
                index,
                expected: "NameAndType",
            }),
        }
    }

    /// Resolves a `Fieldref`.
    pub fn field_ref(&self, index: u16) -> Result<MemberRef<'_>, SymbolError> {
        match self.entry(index)? {
            Constant::Fieldref {
                class_index,
                name_and_type_index,
            } => self.member(*class_index, *name_and_type_index),
            _ => Err(SymbolError::UnexpectedKind {
                index,
                expected: "Fieldref",
            }),
        }
    }

    /// Resolves a `Methodref` (class methods only, not interface methods).
    pub fn method_ref(&self, index: u16) -> Result<MemberRef<'_>, SymbolError> {
        match self.entry(index)? {
            Constant::Methodref {
                class_index,
                name_and_type_index,
            } => self.member(*class_index, *name_and_type_index),
            _ => Err(SymbolError::UnexpectedKind {
                index,
                expected: "Methodref",
            }),
        }
    }

    /// Resolves any of `Fieldref`, `Methodref` or `InterfaceMethodref`.
    pub fn any_member_ref(&self, index: u16) -> Result<MemberRef<'_>, SymbolError> {
        match self.entry(index)? {
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
            } => self.member(*class_index, *name_and_type_index),
            _ => Err(SymbolError::UnexpectedKind {
                index,
                expected: "member reference",
            }),
        }
    }

    fn member(&self, class_index: u16, name_and_type_index: u16) -> Result<MemberRef<'_>, SymbolError> {
        let owner = self.class_name(class_index)?;
        let (name, descriptor) = self.name_and_type(name_and_type_index)?;
        Ok(MemberRef {
            owner,
            name,
            descriptor,
        })
    }

    pub fn find_utf8(&self, value: &str) -> Option<u16> {
        self.iter().find_map(|(index, entry)| match entry {
            Constant::Utf8(existing) if existing == value => Some(index),
            _ => None,
        })
    }

    pub fn find_class(&self, name: &str) -> Option<u16> {
        self.iter().find_map(|(index, entry)| match entry {
            Constant::Class { name_index } if self.utf8(*name_index).ok() == Some(name) => {
                Some(index)
            }
            _ => None,
        })
    }

    /// Returns the index of a `Utf8` entry holding `value`, appending one if needed.
    pub fn add_utf8(&mut self, value: &str) -> Result<u16, SymbolError> {
        if let Some(index) = self.find_utf8(value) {
            return Ok(index);
        }
        self.push(Constant::Utf8(value.to_string()))
    }

    /// Returns the index of a `Class` entry naming `name`, appending it (and its
    /// `Utf8`) if needed.
    pub fn add_class(&mut self, name: &str) -> Result<u16, SymbolError> {
        if let Some(index) = self.find_class(name) {
            return Ok(index);
        }
        let name_index = self.add_utf8(name)?;
        self.push(Constant::Class { name_index })
    }

    pub fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, SymbolError> {
        let existing = self.iter().find_map(|(index, entry)| match entry {
            Constant::NameAndType { .. } if self.name_and_type(index).ok() == Some((name, descriptor)) => {
                Some(index)
            }
            _ => None,
        });
        if let Some(index) = existing {
            return Ok(index);
        }
        let name_index = self.add_utf8(name)?;
        let descriptor_index = self.add_utf8(descriptor)?;
        self.push(Constant::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    pub fn find_method_ref(&self, owner: &str, name: &str, descriptor: &str) -> Option<u16> {
        let wanted = MemberRef {
            owner,
            name,
            descriptor,
        };
        self.iter().find_map(|(index, entry)| match entry {
            Constant::Methodref { .. } if self.method_ref(index).ok() == Some(wanted) => Some(index),
            _ => None,
        })
    }

    pub fn add_method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, SymbolError> {
        if let Some(index) = self.find_method_ref(owner, name, descriptor) {
            return Ok(index);
        }
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.push(Constant::Methodref {
            class_index,
            name_and_type_index,
        })
    }

    pub fn add_field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, SymbolError> {
        let wanted = MemberRef {
            owner,
            name,
            descriptor,
        };
        let existing = self.iter().find_map(|(index, entry)| match entry {
            Constant::Fieldref { .. } if self.field_ref(index).ok() == Some(wanted) => Some(index),
            _ => None,
        });
        if let Some(index) = existing {
            return Ok(index);
        }
        let class_index = self.add_class(owner)?;
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        self.push(Constant::Fieldref {
            class_index,
            name_and_type_index,
        })
    }

    pub fn add_string(&mut self, value: &str) -> Result<u16, SymbolError> {
        let existing = self.iter().find_map(|(index, entry)| match entry {
            Constant::String { string_index } if self.utf8(*string_index).ok() == Some(value) => {
                Some(index)
            }
            _ => None,
        });
        if let Some(index) = existing {
            return Ok(index);
        }
        let string_index = self.add_utf8(value)?;
        self.push(Constant::String { string_index })
    }

    /// Appends `entry` unconditionally, reserving the following slot for wide entries.
    pub fn push(&mut self, entry: Constant) -> Result<u16, SymbolError> {
        let slots = if entry.is_wide() { 2 } else { 1 };
        if self.entries.len() + slots > u16::MAX as usize {
            return Err(SymbolError::PoolOverflow);
        }
        let index = self.entries.len() as u16;
        let wide = entry.is_wide();
        self.entries.push(entry);
        if wide {
            self.entries.push(Constant::Reserved);
        }
        Ok(index)
    }
}
