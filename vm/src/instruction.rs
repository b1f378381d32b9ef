//! VM instruction set.
//!
//! Instructions operate on the value stack of the current frame. Slots are
//! addressed either from the frame base or from the stack top, see
//! [`StackOffset`].

use core::fmt;

use crate::function::FunctionHandle;

/// Address of a value stack slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackOffset {
    /// Slot `n` counted from the current frame's base.
    Frame(u32),
    /// Slot counted from the top: `Top(-1)` is the topmost value.
    Top(i32),
}

impl fmt::Display for StackOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackOffset::Frame(position) => write!(f, "frame[{}]", position),
            StackOffset::Top(offset) => write!(f, "top[{}]", offset),
        }
    }
}

/// A single VM instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    // ========================================================================
    // Stack
    // ========================================================================
    /// Push `count` empty slots.
    Push { count: u32 },

    /// Push a copy of a constant.
    PushConstant { index: u32 },

    /// Push a copy of another slot.
    PushStackValue { position: StackOffset },

    /// Replace `destination` with a copy of `source`.
    AssignStackValue {
        source: StackOffset,
        destination: StackOffset,
    },

    /// Byte-copy a trivially copyable value from `source` to `destination`.
    CopyTrivialValue {
        source: StackOffset,
        destination: StackOffset,
    },

    /// Destroy and pop the top `count` values.
    Pop { count: u32 },

    // ========================================================================
    // Control
    // ========================================================================
    /// Call a function. The top `output_count + input_count` slots hold the
    /// output slots followed by the inputs.
    FunctionCall {
        handle: FunctionHandle,
        input_count: u16,
        output_count: u16,
    },

    /// Continue at this instruction's index plus `offset`.
    Jump { offset: i32 },

    /// Pop a boolean; if it is false continue at this instruction's index
    /// plus `offset`.
    JumpIfFalse { offset: i32 },

    /// Return from the current script function.
    Return,

    // ========================================================================
    // Memory
    // ========================================================================
    /// Advance the `MemoryAddress` in slot `position` by `delta` bytes.
    OffsetAddress { position: StackOffset, delta: u32 },
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Push { count } => write!(f, "push {}", count),
            Instruction::PushConstant { index } => write!(f, "push_constant #{}", index),
            Instruction::PushStackValue { position } => write!(f, "push_stack_value {}", position),
            Instruction::AssignStackValue {
                source,
                destination,
            } => write!(f, "assign {} -> {}", source, destination),
            Instruction::CopyTrivialValue {
                source,
                destination,
            } => write!(f, "copy_trivial {} -> {}", source, destination),
            Instruction::Pop { count } => write!(f, "pop {}", count),
            Instruction::FunctionCall {
                handle,
                input_count,
                output_count,
            } => write!(
                f,
                "call {:?} ({} in, {} out)",
                handle, input_count, output_count
            ),
            Instruction::Jump { offset } => write!(f, "jump {:+}", offset),
            Instruction::JumpIfFalse { offset } => write!(f, "jump_if_false {:+}", offset),
            Instruction::Return => f.write_str("return"),
            Instruction::OffsetAddress { position, delta } => {
                write!(f, "offset_address {} +{}", position, delta)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_display() {
        assert_eq!(Instruction::Push { count: 2 }.to_string(), "push 2");
        assert_eq!(Instruction::Jump { offset: -3 }.to_string(), "jump -3");
        assert_eq!(Instruction::JumpIfFalse { offset: 4 }.to_string(), "jump_if_false +4");
        assert_eq!(
            Instruction::AssignStackValue {
                source: StackOffset::Top(-1),
                destination: StackOffset::Frame(0),
            }
            .to_string(),
            "assign top[-1] -> frame[0]"
        );
        assert_eq!(
            Instruction::FunctionCall {
                handle: FunctionHandle::Script(7),
                input_count: 2,
                output_count: 1,
            }
            .to_string(),
            "call Script(7) (2 in, 1 out)"
        );
    }
}
