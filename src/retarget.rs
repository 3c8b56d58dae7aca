use serde::Deserialize;

use crate::constant_pool::{Constant, ConstantPool};
use crate::error::{ConfigError, SymbolError};

/// One `owner.name descriptor` call site and the class that should own it instead.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetargetEntry {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
    pub new_owner: String,
}

impl RetargetEntry {
    pub fn new(owner: &str, name: &str, descriptor: &str, new_owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            new_owner: new_owner.to_string(),
        }
    }

    fn matches(&self, owner: &str, name: &str, descriptor: &str) -> bool {
        self.owner == owner && self.name == name && self.descriptor == descriptor
    }
}

/// Points matching `Methodref` entries at a different owner class.
///
/// Only the `class_index` of the matching entry changes. The original `Class` entry stays
/// in the pool for anything else that uses it, and interface method references are never
/// considered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSiteRetargeter {
    entries: Vec<RetargetEntry>,
}

impl CallSiteRetargeter {
    pub fn new(entries: Vec<RetargetEntry>) -> Result<Self, ConfigError> {
        for (position, entry) in entries.iter().enumerate() {
            if [&entry.owner, &entry.name, &entry.descriptor, &entry.new_owner]
                .iter()
                .any(|field| field.is_empty())
            {
                return Err(ConfigError::IncompleteRetarget {
                    owner: entry.owner.clone(),
                    name: entry.name.clone(),
                    descriptor: entry.descriptor.clone(),
                });
            }
            if entries[..position]
                .iter()
                .any(|other| other.matches(&entry.owner, &entry.name, &entry.descriptor))
            {
                return Err(ConfigError::DuplicateRetarget {
                    owner: entry.owner.clone(),
                    name: entry.name.clone(),
                    descriptor: entry.descriptor.clone(),
                });
            }
        }
        Ok(Self { entries })
    }

    /// Retargets every matching `Methodref` and returns how many were changed.
    ///
    /// A `Methodref` that cannot be resolved, or a pool with no room for the new owner's
    /// `Class` entry, fails the whole pass. Entries rewritten before the failure stay
    /// rewritten, so callers discard the pool on error.
    pub fn apply(&self, pool: &mut ConstantPool) -> Result<usize, SymbolError> {
        if self.entries.is_empty() {
            return Ok(0);
        }
        let method_refs: Vec<u16> = pool
            .iter()
            .filter(|(_, entry)| matches!(entry, Constant::Methodref { .. }))
            .map(|(index, _)| index)
            .collect();

        let mut retargeted = 0;
        for index in method_refs {
            let new_owner = {
                let member = pool.method_ref(index)?;
                match self
                    .entries
                    .iter()
                    .find(|entry| entry.matches(member.owner, member.name, member.descriptor))
                {
                    Some(entry) => {
                        log::debug!("retargeting #{index} {member} to {}", entry.new_owner);
                        entry.new_owner.as_str()
                    }
                    None => continue,
                }
            };
            let class_index = pool.add_class(new_owner)?;
            if let Some(Constant::Methodref {
                class_index: owner, ..
            }) = pool.get_mut(index)
            {
                *owner = class_index;
                retargeted += 1;
            }
        }
        Ok(retargeted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOXING: &str = "macromedia/asc/util/Boxing";

    fn integer_value_of() -> CallSiteRetargeter {
        CallSiteRetargeter::new(vec![RetargetEntry::new(
            "java/lang/Integer",
            "valueOf",
            "(I)Ljava/lang/Integer;",
            BOXING,
        )])
        .unwrap()
    }

    #[test]
    fn test_retargets_matching_method_ref() {
        let mut pool = ConstantPool::new();
        let index = pool
            .add_method_ref("java/lang/Integer", "valueOf", "(I)Ljava/lang/Integer;")
            .unwrap();
        let original_owner = pool.find_class("java/lang/Integer").unwrap();

        assert_eq!(integer_value_of().apply(&mut pool).unwrap(), 1);

        let member = pool.method_ref(index).unwrap();
        assert_eq!(member.owner, BOXING);
        assert_eq!(member.name, "valueOf");
        assert_eq!(
            pool.class_name(original_owner).unwrap(),
            "java/lang/Integer"
        );
    }

    #[test]
    fn test_other_descriptors_are_left_alone() {
        let mut pool = ConstantPool::new();
        let index = pool
            .add_method_ref(
                "java/lang/Integer",
                "valueOf",
                "(Ljava/lang/String;)Ljava/lang/Integer;",
            )
            .unwrap();
        let count = pool.count();

        assert_eq!(integer_value_of().apply(&mut pool).unwrap(), 0);
        assert_eq!(pool.method_ref(index).unwrap().owner, "java/lang/Integer");
        assert_eq!(pool.count(), count);
    }

    #[test]
    fn test_reuses_existing_owner_class() {
        let mut pool = ConstantPool::new();
        let boxing = pool.add_class(BOXING).unwrap();
        let index = pool
            .add_method_ref("java/lang/Integer", "valueOf", "(I)Ljava/lang/Integer;")
            .unwrap();
        let count = pool.count();

        integer_value_of().apply(&mut pool).unwrap();

        assert_eq!(pool.count(), count);
        assert!(matches!(
            pool.get(index),
            Some(Constant::Methodref { class_index, .. }) if *class_index == boxing
        ));
    }

    #[test]
    fn test_unresolvable_method_ref_is_an_error() {
        let mut pool = ConstantPool::new();
        pool.push(Constant::Methodref {
            class_index: 40,
            name_and_type_index: 41,
        })
        .unwrap();

        assert_eq!(
            integer_value_of().apply(&mut pool),
            Err(SymbolError::InvalidIndex(40))
        );
    }

    #[test]
    fn test_rejects_duplicate_entries() {
        let entry = RetargetEntry::new("a/A", "m", "()V", "b/B");
        assert!(matches!(
            CallSiteRetargeter::new(vec![entry.clone(), entry]),
            Err(ConfigError::DuplicateRetarget { .. })
        ));
    }
}
