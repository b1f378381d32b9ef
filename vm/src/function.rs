//! Callable functions: native Rust functions or compiled script code.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use serde_json::{json, Value as JsonValue};

use crate::context::{self, CallInputs, CallOutput, NativeCall};
use crate::error::ExecutionError;
use crate::module::Module;
use crate::type_id::TypeId;
use crate::types::split_reference;

/// Signature of a native function. Inputs and outputs live on the value
/// stack and are reached through the [`NativeCall`].
pub type NativeFunction = fn(&mut NativeCall<'_>) -> Result<(), ExecutionError>;

/// What a function call dispatches to.
#[derive(Clone, Copy)]
pub enum FunctionHandle {
    /// A native function pointer.
    Native(NativeFunction),
    /// Index of the first instruction in the global code store.
    Script(usize),
}

impl FunctionHandle {
    pub fn is_native(&self) -> bool {
        matches!(self, FunctionHandle::Native(_))
    }

    pub fn is_script(&self) -> bool {
        matches!(self, FunctionHandle::Script(_))
    }

    pub fn native_function(&self) -> Option<NativeFunction> {
        match *self {
            FunctionHandle::Native(function) => Some(function),
            FunctionHandle::Script(_) => None,
        }
    }

    pub fn instruction_offset(&self) -> Option<usize> {
        match *self {
            FunctionHandle::Native(_) => None,
            FunctionHandle::Script(offset) => Some(offset),
        }
    }
}

impl PartialEq for FunctionHandle {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FunctionHandle::Native(a), FunctionHandle::Native(b)) => *a as usize == *b as usize,
            (FunctionHandle::Script(a), FunctionHandle::Script(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for FunctionHandle {}

impl fmt::Debug for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionHandle::Native(function) => write!(f, "Native({:#x})", *function as usize),
            FunctionHandle::Script(offset) => write!(f, "Script({})", offset),
        }
    }
}

/// A named, typed input or output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueDeclaration {
    pub name: String,
    pub type_id: TypeId,
}

impl ValueDeclaration {
    pub fn new(name: &str, type_id: TypeId) -> Self {
        ValueDeclaration {
            name: String::from(name),
            type_id,
        }
    }
}

/// A function with a typed signature.
#[derive(Debug)]
pub struct Function {
    name: String,
    module_name: Option<String>,
    handle: FunctionHandle,
    inputs: Vec<ValueDeclaration>,
    outputs: Vec<ValueDeclaration>,
}

impl Function {
    /// An anonymous native function.
    pub fn make_native(
        pointer: NativeFunction,
        inputs: Vec<ValueDeclaration>,
        outputs: Vec<ValueDeclaration>,
    ) -> Arc<Function> {
        Arc::new(Function {
            name: String::new(),
            module_name: None,
            handle: FunctionHandle::Native(pointer),
            inputs,
            outputs,
        })
    }

    /// A function belonging to `module_name`.
    pub(crate) fn new(
        name: &str,
        module_name: Option<&str>,
        handle: FunctionHandle,
        inputs: Vec<ValueDeclaration>,
        outputs: Vec<ValueDeclaration>,
    ) -> Function {
        Function {
            name: String::from(name),
            module_name: module_name.map(String::from),
            handle,
            inputs,
            outputs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module_name(&self) -> Option<&str> {
        self.module_name.as_deref()
    }

    pub fn handle(&self) -> FunctionHandle {
        self.handle
    }

    pub fn is_script_function(&self) -> bool {
        self.handle.is_script()
    }

    pub fn inputs(&self) -> &[ValueDeclaration] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueDeclaration] {
        &self.outputs
    }

    pub fn get_input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|input| input.name == name)
    }

    pub fn get_input(&self, name: &str) -> Option<&ValueDeclaration> {
        self.inputs.iter().find(|input| input.name == name)
    }

    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn input(&self, index: usize) -> &ValueDeclaration {
        &self.inputs[index]
    }

    pub fn get_output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|output| output.name == name)
    }

    pub fn get_output(&self, name: &str) -> Option<&ValueDeclaration> {
        self.outputs.iter().find(|output| output.name == name)
    }

    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn output(&self, index: usize) -> &ValueDeclaration {
        &self.outputs[index]
    }

    /// Call the function on the current thread's execution context.
    ///
    /// ```ignore
    /// let sum: f64 = add.call((1.0, 2.0))?;
    /// ```
    pub fn call<O: CallOutput, I: CallInputs>(&self, inputs: I) -> Result<O, ExecutionError> {
        context::with_current(|context| context.call(self, inputs))
    }

    /// Serialize as `{"module": .., "name": ..}`.
    pub fn serialize(&self) -> JsonValue {
        json!({
            "module": self.module_name.as_deref().unwrap_or_default(),
            "name": self.name,
        })
    }

    /// Resolve `{"module", "name"}` or `"module.name"` against the module
    /// registry.
    pub fn deserialize(data: &JsonValue) -> Option<Arc<Function>> {
        let (module_name, function_name) = split_reference(data)?;
        Module::get(module_name)?.get_function(function_name)
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.module_name {
            Some(module) => write!(f, "{}.{}", module, self.name),
            None => f.write_str(&self.name),
        }
    }
}
