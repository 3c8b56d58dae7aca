//! The per-class rewrite engine.
//!
//! A class above the target version goes through the constant pool passes, then
//! every concrete method goes through the rule set, and finally the class is
//! stamped with the target version. Work happens on a copy that replaces the
//! caller's class only when the whole unit succeeds.

use std::fmt;

use crate::class_reader::{ClassFile, STACK_MAP_TABLE};
use crate::class_writer::compute_max_stack;
use crate::config::DowngradeConfig;
use crate::error::{ConfigError, DowngradeError, RetargetFailure};
use crate::method_code::MethodCode;
use crate::retarget::CallSiteRetargeter;
use crate::rules::{RuleCounts, RuleSet};
use crate::substitution::SubstitutionTable;

/// Decides whether a class needs downgrading at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionGate {
    target: u16,
}

impl VersionGate {
    pub fn new(target: u16) -> Self {
        Self { target }
    }

    pub fn target(&self) -> u16 {
        self.target
    }

    pub fn admits(&self, class: &ClassFile) -> bool {
        class.major_version > self.target
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// At or below the target version; nothing was touched.
    Unchanged,
    Downgraded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DowngradeStats {
    pub retargeted: usize,
    pub substituted: usize,
    pub rules: RuleCounts,
    pub methods_rewritten: usize,
    pub methods_rolled_back: usize,
}

impl fmt::Display for DowngradeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} retargeted, {} substituted, {} method(s) rewritten",
            self.retargeted, self.substituted, self.methods_rewritten
        )?;
        for (rule, count) in &self.rules {
            write!(f, ", {rule}: {count}")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Outcome {
    pub status: Status,
    pub stats: DowngradeStats,
    /// Rule failures. Each one left its method exactly as it was decoded.
    pub failures: Vec<RetargetFailure>,
}

impl Outcome {
    fn unchanged() -> Self {
        Self {
            status: Status::Unchanged,
            stats: DowngradeStats::default(),
            failures: Vec::new(),
        }
    }

    pub fn changed(&self) -> bool {
        self.status == Status::Downgraded
    }
}

/// Validated, immutable downgrade settings.
#[derive(Debug)]
pub struct Downgrader {
    gate: VersionGate,
    substitutions: SubstitutionTable,
    retargeter: CallSiteRetargeter,
    rules: RuleSet,
}

impl Downgrader {
    pub fn new(config: DowngradeConfig) -> Result<Self, ConfigError> {
        let rules = RuleSet::from_toggles(config.rules);
        log::debug!("enabled rules: [{}]", rules.names().join(", "));
        Ok(Self {
            gate: VersionGate::new(config.target_major),
            substitutions: SubstitutionTable::new(config.substitutions)?,
            retargeter: CallSiteRetargeter::new(config.retargets)?,
            rules,
        })
    }

    /// Replaces the configured rule set, e.g. with rules defined outside this crate.
    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        log::debug!("rule set replaced: [{}]", rules.names().join(", "));
        self.rules = rules;
        self
    }

    pub fn gate(&self) -> VersionGate {
        self.gate
    }

    /// Downgrades `class` in place.
    ///
    /// On `Err` the class is exactly as it was passed in. A rule failure inside a
    /// method is not an error for the unit: that method keeps its original body and
    /// the failure is reported in [`Outcome::failures`].
    pub fn downgrade(&self, class: &mut ClassFile) -> Result<Outcome, DowngradeError> {
        if !self.gate.admits(class) {
            log::debug!(
                "skipping class at version {} (target {})",
                class.major_version,
                self.gate.target()
            );
            return Ok(Outcome::unchanged());
        }

        let mut work = class.clone();
        let class_name = work.name()?.to_string();
        let mut stats = DowngradeStats {
            retargeted: self.retargeter.apply(&mut work.constant_pool)?,
            substituted: self.substitutions.apply(&mut work.constant_pool),
            ..DowngradeStats::default()
        };
        self.rules.prepare(&mut work.constant_pool)?;

        let mut failures = Vec::new();
        for position in 0..work.methods.len() {
            let method = &work.methods[position];
            let Some(attribute) = method.code().filter(|_| method.is_concrete()) else {
                continue;
            };
            let name = work.method_name(method)?.to_string();
            let signature = format!("{class_name}.{}", work.method_signature(method));
            let code_name = attribute.name_index;
            let mut code =
                MethodCode::decode(attribute).map_err(|source| DowngradeError::DecodeCode {
                    method: signature.clone(),
                    source,
                })?;

            let counts = match self
                .rules
                .apply(&signature, &name, &work.constant_pool, &mut code)
            {
                Ok(counts) => counts,
                Err(failure) => {
                    log::error!("{failure}: {}; keeping original body", failure.source);
                    stats.methods_rolled_back += 1;
                    failures.push(failure);
                    continue;
                }
            };
            if counts.is_empty() {
                continue;
            }
            if log::log_enabled!(log::Level::Debug) {
                for (referrer, handle) in code.dangling_references() {
                    log::debug!("{signature}: {referrer:?} still points at removed {handle:?}");
                }
            }

            let encoded = compute_max_stack(&code, &work.constant_pool)
                .and_then(|max_stack| {
                    code.max_stack = max_stack;
                    code.encode(code_name)
                })
                .map_err(|source| DowngradeError::EncodeCode {
                    method: signature.clone(),
                    source,
                })?;
            if let Some(slot) = work.methods[position].code_mut() {
                *slot = encoded;
            }
            for (rule, count) in counts {
                *stats.rules.entry(rule).or_default() += count;
            }
            stats.methods_rewritten += 1;
        }

        for method in &mut work.methods {
            if let Some(code) = method.code_mut() {
                code.attributes.retain(|attr| attr.name() != STACK_MAP_TABLE);
            }
        }
        let from = work.major_version;
        work.major_version = self.gate.target();
        *class = work;

        log::info!(
            "{class_name}: {from} -> {}, {stats}",
            self.gate.target()
        );
        Ok(Outcome {
            status: Status::Downgraded,
            stats,
            failures,
        })
    }
}
