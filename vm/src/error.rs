//! VM error types.

use alloc::string::String;

use crate::type_id::TypeId;

/// Errors raised while registering or removing types, functions and modules.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Invalid type id: {0}")]
    InvalidTypeId(TypeId),

    #[error("Module already registered: {0}")]
    ModuleExists(String),

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Type {name} already registered in module {module}")]
    DuplicateType { module: String, name: String },

    #[error("Type {name} not found in module {module}")]
    TypeNotFound { module: String, name: String },

    #[error("Function {name} already registered in module {module}")]
    DuplicateFunction { module: String, name: String },

    #[error("Function {name} not found in module {module}")]
    FunctionNotFound { module: String, name: String },

    #[error("Function {name} in module {module} was not declared for later definition")]
    FunctionNotDeclared { module: String, name: String },

    #[error("Type {type_name} has no {function} function")]
    MissingLifecycleFunction {
        type_name: String,
        function: &'static str,
    },

    #[error("Type {0} has an invalid memory layout")]
    InvalidLayout(String),

    #[error("Type table is full")]
    TypeTableFull,
}

/// Argument mismatches detected at a `Function::call` boundary, before any
/// instruction is dispatched.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Expected {expected} inputs, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("Input {index}: expected {expected}, got {got}")]
    InputTypeMismatch {
        index: usize,
        expected: String,
        got: String,
    },

    #[error("Expected {expected} outputs, caller reads {got}")]
    OutputArityMismatch { expected: usize, got: usize },

    #[error("Output {index}: expected {expected}, got {got}")]
    OutputTypeMismatch {
        index: usize,
        expected: String,
        got: String,
    },
}

/// Runtime errors. Any of these aborts the in-flight call chain; the
/// execution context unwinds its stack to where the top-level call started.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// Value stack capacity exceeded.
    #[error("value stack overflow")]
    StackOverflow,

    /// Pop or read below the current frame.
    #[error("value stack underflow")]
    StackUnderflow,

    /// Too many nested calls.
    #[error("call stack overflow")]
    CallStackOverflow,

    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("native type is not registered: {0}")]
    UnregisteredType(&'static str),

    #[error("type is no longer registered: {0}")]
    StaleType(TypeId),

    #[error("invalid instruction pointer: {0}")]
    InvalidInstructionPointer(usize),

    #[error("invalid constant index: {0}")]
    InvalidConstant(usize),

    #[error("read from an empty stack slot")]
    EmptySlot,

    #[error("type {type_name} has no {function} function")]
    MissingLifecycleFunction {
        type_name: String,
        function: &'static str,
    },

    #[error("call error: {0}")]
    Call(#[from] CallError),

    /// Error reported by a native function.
    #[error("native function error: {0}")]
    Native(String),
}

/// Errors raised by the safe [`Value`](crate::value::Value) API.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("native type is not registered: {0}")]
    UnregisteredType(&'static str),

    #[error("unknown property: {0}")]
    UnknownProperty(String),

    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("property is read-only: {0}")]
    ReadOnlyProperty(String),

    #[error("value is empty")]
    Empty,

    #[error("index {index} out of bounds for size {size}")]
    IndexOutOfBounds { index: u32, size: u32 },

    #[error("capacity overflow")]
    CapacityOverflow,

    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),
}
