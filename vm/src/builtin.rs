//! The `Core` module: built-in types and functions every script can use.
//!
//! The module registers itself on first use of the registry, or eagerly
//! through [`crate::init`].

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;

use spin::Once;

use crate::context::NativeCall;
use crate::error::{ExecutionError, RegistryError};
use crate::function::{NativeFunction, ValueDeclaration};
use crate::module::Module;
use crate::types::{Type, TypeDescription};

/// Name of the built-in module.
pub const MODULE_NAME: &str = "Core";

/// Raw address of a value, passed to lifecycle and accessor functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAddress(pub *mut u8);

impl MemoryAddress {
    pub fn as_ptr(self) -> *mut u8 {
        self.0
    }

    /// The address `delta` bytes further.
    pub fn offset(self, delta: usize) -> Self {
        MemoryAddress(self.0.wrapping_add(delta))
    }
}

impl Default for MemoryAddress {
    fn default() -> Self {
        MemoryAddress(core::ptr::null_mut())
    }
}

// SAFETY: an address is plain data; dereferencing it is always unsafe.
unsafe impl Send for MemoryAddress {}
unsafe impl Sync for MemoryAddress {}

/// Handles to the core types, kept for the lifetime of the process.
pub(crate) struct CoreTypes {
    pub module: Arc<Module>,
    pub memory_address: Arc<Type>,
    pub number: Arc<Type>,
    pub boolean: Arc<Type>,
    pub string: Arc<Type>,
}

static CORE: Once<CoreTypes> = Once::new();

/// Register the core module if that has not happened yet.
pub(crate) fn ensure_registered() -> &'static CoreTypes {
    CORE.call_once(|| match register_core() {
        Ok(core) => core,
        // Registration only fails if the module name was taken before the
        // registry was first touched, which cannot happen.
        Err(error) => panic!("failed to register the core module: {}", error),
    })
}

/// The `Core.MemoryAddress` type.
pub fn memory_address_type() -> Arc<Type> {
    Arc::clone(&ensure_registered().memory_address)
}

/// The `Core.Number` type (`f64`).
pub fn number_type() -> Arc<Type> {
    Arc::clone(&ensure_registered().number)
}

/// The `Core.Boolean` type (`bool`).
pub fn boolean_type() -> Arc<Type> {
    Arc::clone(&ensure_registered().boolean)
}

/// The `Core.String` type.
pub fn string_type() -> Arc<Type> {
    Arc::clone(&ensure_registered().string)
}

/// The core module.
pub fn core_module() -> Arc<Module> {
    Arc::clone(&ensure_registered().module)
}

fn register_core() -> Result<CoreTypes, RegistryError> {
    log::info!("[VM Core] Registering core module...");

    // Must not go through any API that calls `ensure_registered`.
    let module = Module::register_unchecked(MODULE_NAME)?;
    let memory_address = module.register_type_with("MemoryAddress", |id| {
        TypeDescription::for_native_with_address_type::<MemoryAddress>("MemoryAddress", id)
    })?;
    let address = memory_address.id();
    let number = module.register_type(TypeDescription::for_native_with_address_type::<f64>(
        "Number", address,
    ))?;
    let boolean = module.register_type(TypeDescription::for_native_with_address_type::<bool>(
        "Boolean", address,
    ))?;
    let string = module.register_type(
        TypeDescription::for_native_with_address_type::<String>("String", address),
    )?;

    let declare = |name: &str, ty: &Arc<Type>| ValueDeclaration::new(name, ty.id());
    let binary = |function: NativeFunction, name: &str, operand: &Arc<Type>, result: &Arc<Type>| {
        module.register_function(
            name,
            function,
            vec![declare("a", operand), declare("b", operand)],
            vec![declare("result", result)],
        )
    };

    binary(add, "add", &number, &number)?;
    binary(subtract, "subtract", &number, &number)?;
    binary(multiply, "multiply", &number, &number)?;
    binary(divide, "divide", &number, &number)?;
    binary(less, "less", &number, &boolean)?;
    binary(less_or_equal, "less_or_equal", &number, &boolean)?;
    binary(greater, "greater", &number, &boolean)?;
    binary(greater_or_equal, "greater_or_equal", &number, &boolean)?;
    binary(equal, "equal", &number, &boolean)?;
    binary(and, "and", &boolean, &boolean)?;
    binary(or, "or", &boolean, &boolean)?;
    binary(concat, "concat", &string, &string)?;

    module.register_function(
        "negate",
        negate,
        vec![declare("a", &number)],
        vec![declare("result", &number)],
    )?;
    module.register_function(
        "not",
        not,
        vec![declare("a", &boolean)],
        vec![declare("result", &boolean)],
    )?;
    module.register_function(
        "number_to_string",
        number_to_string,
        vec![declare("a", &number)],
        vec![declare("result", &string)],
    )?;
    module.register_function("log", log_message, vec![declare("message", &string)], vec![])?;

    log::info!(
        "[VM Core] Registered {} types and {} functions",
        module.types().len(),
        module.functions().len()
    );
    Ok(CoreTypes {
        module,
        memory_address,
        number,
        boolean,
        string,
    })
}

// ============================================================================
// Native functions
// ============================================================================

macro_rules! binary_function {
    ($name:ident, $operand:ty, |$a:ident, $b:ident| $body:expr) => {
        fn $name(call: &mut NativeCall<'_>) -> Result<(), ExecutionError> {
            let $a = call.input::<$operand>(0)?.clone();
            let $b = call.input::<$operand>(1)?.clone();
            call.set_output(0, $body)
        }
    };
}

binary_function!(add, f64, |a, b| a + b);
binary_function!(subtract, f64, |a, b| a - b);
binary_function!(multiply, f64, |a, b| a * b);
binary_function!(divide, f64, |a, b| a / b);
binary_function!(less, f64, |a, b| a < b);
binary_function!(less_or_equal, f64, |a, b| a <= b);
binary_function!(greater, f64, |a, b| a > b);
binary_function!(greater_or_equal, f64, |a, b| a >= b);
binary_function!(equal, f64, |a, b| a == b);
binary_function!(and, bool, |a, b| a && b);
binary_function!(or, bool, |a, b| a || b);
binary_function!(concat, String, |a, b| a + &b);

fn negate(call: &mut NativeCall<'_>) -> Result<(), ExecutionError> {
    let a = *call.input::<f64>(0)?;
    call.set_output(0, -a)
}

fn not(call: &mut NativeCall<'_>) -> Result<(), ExecutionError> {
    let a = *call.input::<bool>(0)?;
    call.set_output(0, !a)
}

fn number_to_string(call: &mut NativeCall<'_>) -> Result<(), ExecutionError> {
    let a = *call.input::<f64>(0)?;
    call.set_output(0, format!("{}", a))
}

fn log_message(call: &mut NativeCall<'_>) -> Result<(), ExecutionError> {
    log::info!("[VM Script] {}", call.input::<String>(0)?);
    Ok(())
}
