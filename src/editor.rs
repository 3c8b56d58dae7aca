//! Reference-preserving edits on a [`MethodCode`].
//!
//! Anything that names an instruction (branch and switch targets, exception ranges and
//! handlers, line numbers, local variable ranges) is kept pointing at a live
//! instruction. Every edit either completes or leaves the method untouched.

use std::collections::HashSet;

use crate::error::EditError;
use crate::insn::{Insn, InsnHandle};
use crate::method_code::{LocalVariableNode, MethodCode};

/// Where a reference to an instruction is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Referrer {
    /// A branch or switch instruction.
    Insn(InsnHandle),
    /// Entry in the exception table, by position.
    TryCatch(usize),
    LineNumber(usize),
    LocalVariable(usize),
    LocalVariableType(usize),
}

impl MethodCode {
    /// Links `insns` in front of `before`, in order, and returns their new handles.
    /// References to `before` are left alone.
    pub fn insert_before(
        &mut self,
        before: InsnHandle,
        insns: Vec<Insn>,
    ) -> Result<Vec<InsnHandle>, EditError> {
        if !self.insns.is_live(before) {
            return Err(EditError::NotLive(before));
        }
        Ok(insns
            .into_iter()
            .map(|insn| self.insns.link_before(before, insn))
            .collect())
    }

    /// Swaps the instruction at `handle` for `insn`, keeping the handle and every
    /// reference to it. Returns the previous instruction.
    pub fn replace(&mut self, handle: InsnHandle, insn: Insn) -> Result<Insn, EditError> {
        let slot = self
            .insns
            .get_mut(handle)
            .ok_or(EditError::NotLive(handle))?;
        Ok(std::mem::replace(slot, insn))
    }

    /// Moves every reference to `from` onto `to`. Returns how many were moved.
    pub fn redirect(&mut self, from: InsnHandle, to: InsnHandle) -> Result<usize, EditError> {
        self.redirect_refs(from, to, true)
    }

    /// Like [`redirect`](Self::redirect) for the places control enters at `from`
    /// (branch and switch targets, exception handlers, line numbers). Exception and
    /// local variable ranges keep their bounds.
    pub fn redirect_entries(
        &mut self,
        from: InsnHandle,
        to: InsnHandle,
    ) -> Result<usize, EditError> {
        self.redirect_refs(from, to, false)
    }

    fn redirect_refs(
        &mut self,
        from: InsnHandle,
        to: InsnHandle,
        ranges: bool,
    ) -> Result<usize, EditError> {
        if !self.insns.is_live(to) {
            return Err(EditError::NotLive(to));
        }
        let handles: Vec<InsnHandle> = self.insns.handles().collect();
        let mut moved = 0;
        for handle in handles {
            if let Some(insn) = self.insns.get_mut(handle) {
                moved += insn.retarget(from, to);
            }
        }

        let mut swap = |slot: &mut InsnHandle| {
            if *slot == from {
                *slot = to;
                moved += 1;
            }
        };
        for block in &mut self.try_catch_blocks {
            swap(&mut block.handler);
            if ranges {
                swap(&mut block.start);
                if let Some(end) = block.end.as_mut() {
                    swap(end);
                }
            }
        }
        for line in &mut self.line_numbers {
            swap(&mut line.start);
        }
        if !ranges {
            return Ok(moved);
        }
        for local in self
            .local_variables
            .iter_mut()
            .chain(self.local_variable_types.iter_mut())
        {
            swap(&mut local.start);
            if let Some(end) = local.end.as_mut() {
                swap(end);
            }
        }
        Ok(moved)
    }

    /// Removes the instructions `from..=to`.
    ///
    /// References into the span move to the first instruction after it. An exclusive
    /// range end with nothing after the span becomes the end of the code, and a range
    /// left empty is dropped along with its entry. A branch target or exception handler
    /// with nowhere to go fails the edit with [`EditError::TargetLost`].
    pub fn delete(&mut self, from: InsnHandle, to: InsnHandle) -> Result<(), EditError> {
        let span = self.insns.span(from, to).ok_or_else(|| {
            if !self.insns.is_live(from) {
                EditError::NotLive(from)
            } else if !self.insns.is_live(to) {
                EditError::NotLive(to)
            } else {
                EditError::InvalidSpan { from, to }
            }
        })?;
        let doomed: HashSet<InsnHandle> = span.into_iter().collect();
        let successor = self.insns.next(to);
        let moved = |handle: InsnHandle| -> Option<InsnHandle> {
            if doomed.contains(&handle) {
                successor
            } else {
                Some(handle)
            }
        };
        let moved_end = |end: Option<InsnHandle>| end.and_then(moved);

        if successor.is_none() {
            let mut lost: Option<InsnHandle> = None;
            let mut referrers = 0;
            let mut note = |target: InsnHandle| {
                lost.get_or_insert(target);
                referrers += 1;
            };
            for (handle, insn) in self.insns.iter() {
                if doomed.contains(&handle) {
                    continue;
                }
                insn.targets()
                    .into_iter()
                    .filter(|target| doomed.contains(target))
                    .for_each(&mut note);
            }
            for block in &self.try_catch_blocks {
                let survives = moved(block.start)
                    .is_some_and(|start| Some(start) != moved_end(block.end));
                if survives && doomed.contains(&block.handler) {
                    note(block.handler);
                }
            }
            if let Some(handle) = lost {
                return Err(EditError::TargetLost { handle, referrers });
            }
        }

        self.insns.unlink(from, to);

        if let Some(successor) = successor {
            let handles: Vec<InsnHandle> = self.insns.handles().collect();
            for handle in handles {
                if let Some(insn) = self.insns.get_mut(handle) {
                    for target in insn.targets() {
                        if doomed.contains(&target) {
                            insn.retarget(target, successor);
                        }
                    }
                }
            }
        }

        self.try_catch_blocks.retain_mut(|block| {
            let Some(start) = moved(block.start) else {
                return false;
            };
            let end = moved_end(block.end);
            if Some(start) == end {
                return false;
            }
            block.start = start;
            block.end = end;
            // Surviving blocks have a live handler, checked above.
            block.handler = moved(block.handler).unwrap_or(block.handler);
            true
        });

        self.line_numbers.retain_mut(|line| match moved(line.start) {
            Some(start) => {
                line.start = start;
                true
            }
            None => false,
        });

        let shift_local = |local: &mut LocalVariableNode| -> bool {
            let Some(start) = moved(local.start) else {
                return false;
            };
            let end = moved_end(local.end);
            if Some(start) == end {
                return false;
            }
            local.start = start;
            local.end = end;
            true
        };
        self.local_variables.retain_mut(|local| shift_local(local));
        self.local_variable_types.retain_mut(|local| shift_local(local));

        Ok(())
    }

    /// Every reference to an instruction that is no longer live.
    pub fn dangling_references(&self) -> Vec<(Referrer, InsnHandle)> {
        let mut dangling = Vec::new();
        let mut check = |referrer: Referrer, handle: InsnHandle| {
            if !self.insns.is_live(handle) {
                dangling.push((referrer, handle));
            }
        };

        for (handle, insn) in self.insns.iter() {
            for target in insn.targets() {
                check(Referrer::Insn(handle), target);
            }
        }
        for (position, block) in self.try_catch_blocks.iter().enumerate() {
            check(Referrer::TryCatch(position), block.start);
            check(Referrer::TryCatch(position), block.handler);
            if let Some(end) = block.end {
                check(Referrer::TryCatch(position), end);
            }
        }
        for (position, line) in self.line_numbers.iter().enumerate() {
            check(Referrer::LineNumber(position), line.start);
        }
        for (position, local) in self.local_variables.iter().enumerate() {
            check(Referrer::LocalVariable(position), local.start);
            if let Some(end) = local.end {
                check(Referrer::LocalVariable(position), end);
            }
        }
        for (position, local) in self.local_variable_types.iter().enumerate() {
            check(Referrer::LocalVariableType(position), local.start);
            if let Some(end) = local.end {
                check(Referrer::LocalVariableType(position), end);
            }
        }
        dangling
    }
}
