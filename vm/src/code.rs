//! Global code store.
//!
//! All script functions share one instruction array and one constant pool.
//! Loading appends and never moves existing code, so a script function's
//! offset stays valid for the lifetime of the process.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

use crate::instruction::Instruction;
use crate::value::Value;

struct CodeStore {
    instructions: Vec<Instruction>,
    constants: Vec<Arc<Value>>,
}

static CODE: RwLock<CodeStore> = RwLock::new(CodeStore {
    instructions: Vec::new(),
    constants: Vec::new(),
});

/// Append `instructions` and `constants`, returning the offset of the first
/// instruction. `PushConstant` indices are local to `constants` and are
/// relocated to the shared pool.
pub fn load(instructions: &[Instruction], constants: Vec<Value>) -> usize {
    let mut code = CODE.write();
    let offset = code.instructions.len();
    let constant_base = code.constants.len() as u32;

    code.instructions.extend(instructions.iter().map(|instruction| match *instruction {
        Instruction::PushConstant { index } => Instruction::PushConstant {
            index: index + constant_base,
        },
        other => other,
    }));
    code.constants.extend(constants.into_iter().map(Arc::new));

    log::debug!(
        "[VM Code] Loaded {} instructions at {} ({} constants)",
        instructions.len(),
        offset,
        code.constants.len() - constant_base as usize
    );
    offset
}

/// Append an entry point for code loaded later and return its offset.
///
/// Until [`link`] points it at the function body, the entry returns
/// immediately.
pub fn reserve_entry() -> usize {
    let mut code = CODE.write();
    code.instructions.push(Instruction::Return);
    code.instructions.len() - 1
}

/// Turn the entry point at `entry` into a jump to `target`. Returns `false`
/// if `entry` is not a reserved entry point.
pub fn link(entry: usize, target: usize) -> bool {
    let Ok(offset) = i32::try_from(target as i64 - entry as i64) else {
        return false;
    };
    let mut code = CODE.write();
    match code.instructions.get_mut(entry) {
        Some(instruction @ Instruction::Return) => {
            *instruction = Instruction::Jump { offset };
            log::trace!("[VM Code] Linked entry {} to {}", entry, target);
            true
        }
        _ => false,
    }
}

/// The instruction at `index`.
pub fn fetch(index: usize) -> Option<Instruction> {
    CODE.read().instructions.get(index).copied()
}

/// The constant at `index` of the shared pool.
pub fn constant(index: usize) -> Option<Arc<Value>> {
    CODE.read().constants.get(index).cloned()
}

/// Number of loaded instructions.
pub fn len() -> usize {
    CODE.read().instructions.len()
}
