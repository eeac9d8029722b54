//! Flow-sensitive operand stack verification.
//!
//! Walks every reachable path through a code object, applying each
//! instruction's fallthrough and branch stack effects, and checks that the
//! depth never goes negative and agrees wherever paths join.

use crate::code::{BytecodeError, Code, Instruction};
use crate::opcode::Op;
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Errors reported by [`verify`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Decode(#[from] BytecodeError),

    #[error("stack underflow at offset {offset} ({op})")]
    Underflow { offset: usize, op: Op },

    #[error("inconsistent stack depth at offset {offset}: {expected} != {found}")]
    DepthMismatch {
        offset: usize,
        expected: usize,
        found: usize,
    },

    #[error("jump at offset {offset} targets {target}, which is not an instruction boundary")]
    BadTarget { offset: usize, target: usize },

    #[error("execution falls off the end after offset {offset}")]
    FallsOffEnd { offset: usize },
}

/// Stack facts gathered by [`verify`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StackProfile {
    /// Deepest operand stack on any path.
    pub max_depth: usize,
    /// `(offset, depth)` for every reachable `Ret`, depth measured before it
    /// executes.
    pub returns: Vec<(usize, usize)>,
}

/// Verify the operand stack discipline of `code`.
///
/// Only `code` itself is checked; nested code objects are verified
/// separately.
pub fn verify(code: &Code) -> Result<StackProfile, VerifyError> {
    let instrs: Vec<Instruction> = code.decode().collect::<Result<_, _>>()?;
    if instrs.is_empty() {
        return Ok(StackProfile::default());
    }

    let index: FxHashMap<usize, usize> = instrs
        .iter()
        .enumerate()
        .map(|(i, instr)| (instr.offset, i))
        .collect();

    let mut depths: Vec<Option<usize>> = vec![None; instrs.len()];
    let mut worklist = vec![0usize];
    let mut profile = StackProfile::default();
    depths[0] = Some(0);

    let merge = |depths: &mut Vec<Option<usize>>,
                     worklist: &mut Vec<usize>,
                     at: usize,
                     depth: usize|
     -> Result<(), VerifyError> {
        match depths[at] {
            None => {
                depths[at] = Some(depth);
                worklist.push(at);
                Ok(())
            }
            Some(expected) if expected == depth => Ok(()),
            Some(expected) => Err(VerifyError::DepthMismatch {
                offset: instrs[at].offset,
                expected,
                found: depth,
            }),
        }
    };

    while let Some(i) = worklist.pop() {
        let instr = instrs[i];
        let Some(depth) = depths[i] else { continue };
        profile.max_depth = profile.max_depth.max(depth);

        let apply = |effect: i32| -> Result<usize, VerifyError> {
            let next = depth as i64 + effect as i64;
            if next < 0 {
                return Err(VerifyError::Underflow {
                    offset: instr.offset,
                    op: instr.op,
                });
            }
            Ok(next as usize)
        };

        if instr.op == Op::Ret {
            profile.returns.push((instr.offset, depth));
        }

        let after = apply(instr.op.stack_effect(instr.arg))?;
        profile.max_depth = profile.max_depth.max(after);

        if let Some(taken) = instr.op.branch_effect() {
            let target = instr.arg as usize;
            let Some(&t) = index.get(&target) else {
                return Err(VerifyError::BadTarget {
                    offset: instr.offset,
                    target,
                });
            };
            let branch_depth = apply(taken)?;
            profile.max_depth = profile.max_depth.max(branch_depth);
            merge(&mut depths, &mut worklist, t, branch_depth)?;
        }

        if !instr.op.is_terminator() {
            if i + 1 >= instrs.len() {
                return Err(VerifyError::FallsOffEnd {
                    offset: instr.offset,
                });
            }
            merge(&mut depths, &mut worklist, i + 1, after)?;
        }
    }

    profile.returns.sort_unstable();
    Ok(profile)
}
