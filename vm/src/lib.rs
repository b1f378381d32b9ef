//! KPIO Script VM
//!
//! This crate provides a typed stack virtual machine with a reflection
//! registry. Native code registers types and functions into named modules;
//! scripts described as JSON are compiled to VM instructions and call back
//! into native functions through the same registry.
//!
//! # Architecture
//!
//! - `type_id`: versioned type identifiers
//! - `types`: type descriptions, memory layouts, properties and the global type table
//! - `module`: named namespaces of types and functions
//! - `function`: native and script function signatures and handles
//! - `value_storage` / `value`: type-erased inline/heap storage and owned typed values
//! - `list`: dynamically typed contiguous container
//! - `instruction` / `code`: instruction set and the shared code store
//! - `context`: value stack, call frames and the dispatch loop
//! - `builtin`: the `Core` module (numbers, booleans, strings, memory addresses)
//! - `parser`: JSON function, type and script parsers
//! - `naming`: name suffix helpers

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod builtin;
pub mod code;
pub mod context;
pub mod error;
pub mod function;
pub mod instruction;
pub mod list;
pub mod module;
pub mod naming;
pub mod parser;
pub mod type_id;
pub mod types;
pub mod value;
pub mod value_storage;

#[cfg(test)]
mod test_utils;

use serde::Deserialize;

pub use context::{with_current, ExecutionContext, NativeCall};
pub use error::{CallError, ExecutionError, RegistryError, ValueError};
pub use function::{Function, FunctionHandle, NativeFunction, ValueDeclaration};
pub use instruction::{Instruction, StackOffset};
pub use list::List;
pub use module::Module;
pub use parser::{ParseScriptError, ParseScriptErrors, ScriptParser};
pub use type_id::TypeId;
pub use types::{Type, TypeDescription, TypeMemoryLayout};
pub use value::{NativeValue, Value};
pub use value_storage::ValueStorage;

/// VM configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Value slots per execution context.
    pub stack_size: usize,
    /// Maximum number of nested calls.
    pub max_call_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            stack_size: 1024,
            max_call_depth: 256,
        }
    }
}

impl VmConfig {
    /// Parse a JSON configuration; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Initialize the VM: register the `Core` module.
///
/// Optional; the first registry access does the same.
pub fn init() {
    log::info!("[VM] Initializing...");
    let core = builtin::ensure_registered();
    log::info!(
        "[VM] Ready: {} modules, core module {}",
        Module::names().len(),
        core.module.name()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_json() {
        let config = VmConfig::from_json(r#"{"stack_size": 64}"#).unwrap();
        assert_eq!(config.stack_size, 64);
        assert_eq!(config.max_call_depth, VmConfig::default().max_call_depth);
        assert_eq!(VmConfig::from_json("{}").unwrap(), VmConfig::default());
        assert!(VmConfig::from_json(r#"{"stack_size": "big"}"#).is_err());
    }

    #[test]
    fn test_init() {
        init();
        assert!(Module::names().iter().any(|name| name == builtin::MODULE_NAME));
        let context = ExecutionContext::new(&VmConfig::default());
        assert_eq!(context.stack_size(), 1024);
    }
}
