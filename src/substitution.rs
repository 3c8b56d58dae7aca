use std::collections::BTreeMap;

use crate::constant_pool::{Constant, ConstantPool};
use crate::error::ConfigError;

/// Exact-match rewrites of `Utf8` constants.
///
/// No replacement may itself be a key, so one pass reaches a fixed point and running the
/// table twice changes nothing the second time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubstitutionTable {
    entries: BTreeMap<String, String>,
}

impl SubstitutionTable {
    pub fn new<I, K, V>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let entries: BTreeMap<String, String> = entries
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        for (key, replacement) in &entries {
            if key.is_empty() {
                return Err(ConfigError::EmptyKey);
            }
            if entries.contains_key(replacement) {
                return Err(ConfigError::ChainedSubstitution {
                    key: key.clone(),
                    replacement: replacement.clone(),
                });
            }
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Rewrites every matching `Utf8` entry in place and returns how many changed.
    /// Wide numeric entries and their reserved slots are never visited as text.
    pub fn apply(&self, pool: &mut ConstantPool) -> usize {
        if self.entries.is_empty() {
            return 0;
        }
        let indices: Vec<u16> = pool.indices().collect();
        let mut rewritten = 0;
        for index in indices {
            if let Some(Constant::Utf8(value)) = pool.get_mut(index) {
                if let Some(replacement) = self.entries.get(value.as_str()) {
                    log::trace!("constant #{index}: {value} -> {replacement}");
                    *value = replacement.clone();
                    rewritten += 1;
                }
            }
        }
        rewritten
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_rewrites_exact_matches_only() {
        let table = SubstitutionTable::new([("java/lang/StringBuilder", "java/lang/StringBuffer")])
            .unwrap();
        let mut pool = ConstantPool::new();
        let exact = pool.add_utf8("java/lang/StringBuilder").unwrap();
        let longer = pool.add_utf8("Ljava/lang/StringBuilder;").unwrap();

        assert_eq!(table.apply(&mut pool), 1);
        assert_eq!(pool.utf8(exact).unwrap(), "java/lang/StringBuffer");
        assert_eq!(pool.utf8(longer).unwrap(), "Ljava/lang/StringBuilder;");
    }

    #[test]
    fn test_second_apply_is_a_no_op() {
        let table = SubstitutionTable::new([("a", "b"), ("c", "d")]).unwrap();
        let mut pool = ConstantPool::new();
        pool.add_utf8("a").unwrap();
        pool.add_utf8("c").unwrap();

        assert_eq!(table.apply(&mut pool), 2);
        let after_first = pool.clone();
        assert_eq!(table.apply(&mut pool), 0);
        assert_eq!(pool, after_first);
    }

    #[test]
    fn test_skips_wide_entries() {
        let table = SubstitutionTable::new([("x", "y")]).unwrap();
        let mut pool = ConstantPool::new();
        pool.push(Constant::Long(42)).unwrap();
        let text = pool.add_utf8("x").unwrap();
        pool.push(Constant::Double(2.0)).unwrap();

        assert_eq!(table.apply(&mut pool), 1);
        assert_eq!(text, 3);
        assert_eq!(pool.get(1), Some(&Constant::Long(42)));
        assert_eq!(pool.get(4), Some(&Constant::Double(2.0)));
        assert_eq!(pool.count(), 6);
    }

    #[test]
    fn test_rejects_chained_and_empty_keys() {
        assert!(matches!(
            SubstitutionTable::new([("a", "b"), ("b", "c")]),
            Err(ConfigError::ChainedSubstitution { .. })
        ));
        assert!(matches!(
            SubstitutionTable::new([("", "b")]),
            Err(ConfigError::EmptyKey)
        ));
    }
}
