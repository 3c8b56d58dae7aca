//! Downgrade settings, loadable from TOML.
//!
//! ```toml
//! target_major = 47
//!
//! [substitutions]
//! "java/lang/StringBuilder" = "java/lang/StringBuffer"
//!
//! [[retargets]]
//! owner = "java/lang/Integer"
//! name = "valueOf"
//! descriptor = "(I)Ljava/lang/Integer;"
//! new_owner = "macromedia/asc/util/Boxing"
//!
//! [rules]
//! boxing_expansion = true
//! ```
//!
//! Every key is optional; anything missing takes its default.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::constants::V1_3;
use crate::error::ConfigError;
use crate::retarget::RetargetEntry;
use crate::rules::RuleToggles;

const BOXING: &str = "macromedia/asc/util/Boxing";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DowngradeConfig {
    /// Classes at or below this major version are left alone; others are stamped to it.
    pub target_major: u16,
    pub substitutions: BTreeMap<String, String>,
    pub retargets: Vec<RetargetEntry>,
    pub rules: RuleToggles,
}

impl Default for DowngradeConfig {
    fn default() -> Self {
        Self {
            target_major: V1_3,
            substitutions: default_substitutions(),
            retargets: default_retargets(),
            rules: RuleToggles::default(),
        }
    }
}

impl DowngradeConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }
}

fn default_substitutions() -> BTreeMap<String, String> {
    let mut table = BTreeMap::new();
    table.insert(
        "java/lang/StringBuilder".to_string(),
        "java/lang/StringBuffer".to_string(),
    );
    for argument in ["Ljava/lang/String;", "Ljava/lang/Object;", "I", "C", "Z", "D", "J"] {
        table.insert(
            format!("({argument})Ljava/lang/StringBuilder;"),
            format!("({argument})Ljava/lang/StringBuffer;"),
        );
    }
    table.insert(
        "java/lang/AssertionError".to_string(),
        "java/lang/Error".to_string(),
    );
    table
}

fn default_retargets() -> Vec<RetargetEntry> {
    vec![
        RetargetEntry::new("java/lang/Integer", "valueOf", "(I)Ljava/lang/Integer;", BOXING),
        RetargetEntry::new("java/lang/Double", "valueOf", "(D)Ljava/lang/Double;", BOXING),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tables() {
        let config = DowngradeConfig::default();

        assert_eq!(config.target_major, 47);
        assert_eq!(config.substitutions.len(), 9);
        assert_eq!(
            config.substitutions["(J)Ljava/lang/StringBuilder;"],
            "(J)Ljava/lang/StringBuffer;"
        );
        assert_eq!(config.retargets.len(), 2);
        assert!(config.rules.assertion_guard);
        assert!(!config.rules.boxing_expansion);
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(
            DowngradeConfig::from_toml_str("").unwrap(),
            DowngradeConfig::default()
        );
    }

    #[test]
    fn test_partial_document_overrides_only_given_keys() {
        let config = DowngradeConfig::from_toml_str(
            r#"
            [substitutions]
            "a/Old" = "a/New"

            [rules]
            boxing_expansion = true
            "#,
        )
        .unwrap();

        assert_eq!(config.substitutions.len(), 1);
        assert_eq!(config.retargets, default_retargets());
        assert!(config.rules.boxing_expansion);
        assert!(config.rules.outer_this_reorder);
    }

    #[test]
    fn test_retarget_entries_parse() {
        let config = DowngradeConfig::from_toml_str(
            r#"
            retargets = [
                { owner = "a/A", name = "m", descriptor = "()V", new_owner = "b/B" },
            ]
            "#,
        )
        .unwrap();

        assert_eq!(config.retargets, vec![RetargetEntry::new("a/A", "m", "()V", "b/B")]);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        assert!(matches!(
            DowngradeConfig::from_toml_str("target = 47"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let missing = Path::new("/nonexistent/downgrader.toml");
        assert!(matches!(
            DowngradeConfig::load(missing),
            Err(ConfigError::Io { .. })
        ));
    }
}
