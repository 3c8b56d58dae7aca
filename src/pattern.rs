//! Opcode-sequence search over an [`InsnList`].

use std::fmt;

use crate::insn::{InsnHandle, InsnList};
use crate::opcodes;

/// One position in a [`Pattern`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Op(u8),
    AnyOf(&'static [u8]),
}

impl Token {
    pub fn matches(&self, opcode: u8) -> bool {
        match self {
            Token::Op(expected) => *expected == opcode,
            Token::AnyOf(alternatives) => alternatives.contains(&opcode),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = |opcode: &u8| opcodes::mnemonic(*opcode).unwrap_or("???").to_uppercase();
        match self {
            Token::Op(opcode) => write!(f, "{}", name(opcode)),
            Token::AnyOf(alternatives) => {
                let names: Vec<String> = alternatives.iter().map(name).collect();
                write!(f, "({})", names.join("|"))
            }
        }
    }
}

/// A fixed-length sequence of tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    tokens: Vec<Token>,
}

impl Pattern {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, token) in self.tokens.iter().enumerate() {
            if position > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{token}")?;
        }
        Ok(())
    }
}

/// Decides whether an opcode-level match is a real one.
pub trait Constraint {
    fn accept(&self, insns: &InsnList, matched: &[InsnHandle]) -> bool;
}

impl<F> Constraint for F
where
    F: Fn(&InsnList, &[InsnHandle]) -> bool,
{
    fn accept(&self, insns: &InsnList, matched: &[InsnHandle]) -> bool {
        self(insns, matched)
    }
}

/// Accepts every opcode-level match.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoConstraint;

impl Constraint for NoConstraint {
    fn accept(&self, _insns: &InsnList, _matched: &[InsnHandle]) -> bool {
        true
    }
}

pub struct InstructionFinder<'a> {
    insns: &'a InsnList,
}

impl<'a> InstructionFinder<'a> {
    pub fn new(insns: &'a InsnList) -> Self {
        Self { insns }
    }

    /// Scans once, left to right, for windows whose opcodes fit `pattern` and that
    /// `constraint` accepts.
    ///
    /// Windows never overlap. After an accepted window the scan resumes just past it;
    /// after a rejected one it resumes at the next instruction.
    pub fn search(&self, pattern: &Pattern, constraint: &dyn Constraint) -> Vec<Vec<InsnHandle>> {
        let handles: Vec<InsnHandle> = self.insns.handles().collect();
        let opcodes: Vec<u8> = self.insns.opcodes();
        let width = pattern.len();
        let mut matches = Vec::new();
        if width == 0 {
            return matches;
        }

        let mut start = 0;
        while start + width <= handles.len() {
            let fits = pattern
                .tokens()
                .iter()
                .zip(&opcodes[start..start + width])
                .all(|(token, opcode)| token.matches(*opcode));
            if fits {
                let window = &handles[start..start + width];
                if constraint.accept(self.insns, window) {
                    matches.push(window.to_vec());
                    start += width;
                    continue;
                }
            }
            start += 1;
        }
        matches
    }
}
