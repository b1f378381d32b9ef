//! Modules: named namespaces of types and functions.
//!
//! Modules live in a process-wide registry keyed by name. A module owns the
//! types registered through it; deregistering the module removes them from
//! the type table.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::RwLock;

use crate::code;
use crate::error::RegistryError;
use crate::function::{Function, FunctionHandle, NativeFunction, ValueDeclaration};
use crate::instruction::Instruction;
use crate::type_id::TypeId;
use crate::types::{Type, TypeDescription};
use crate::value::Value;

static MODULES: RwLock<BTreeMap<String, Arc<Module>>> = RwLock::new(BTreeMap::new());

/// A namespace of types and functions.
pub struct Module {
    name: String,
    types: RwLock<HashMap<String, Arc<Type>>>,
    functions: RwLock<HashMap<String, Arc<Function>>>,
}

impl Module {
    /// Register a new, empty module.
    pub fn register(name: &str) -> Result<Arc<Module>, RegistryError> {
        crate::builtin::ensure_registered();
        Self::register_unchecked(name)
    }

    /// Register without bootstrapping the core module first.
    pub(crate) fn register_unchecked(name: &str) -> Result<Arc<Module>, RegistryError> {
        let mut modules = MODULES.write();
        if modules.contains_key(name) {
            return Err(RegistryError::ModuleExists(String::from(name)));
        }
        let module = Arc::new(Module {
            name: String::from(name),
            types: RwLock::new(HashMap::new()),
            functions: RwLock::new(HashMap::new()),
        });
        modules.insert(String::from(name), Arc::clone(&module));
        log::debug!("[VM Modules] Registered module {}", name);
        Ok(module)
    }

    /// Look up a registered module.
    pub fn get(name: &str) -> Option<Arc<Module>> {
        crate::builtin::ensure_registered();
        MODULES.read().get(name).cloned()
    }

    /// Remove a module and all of its types.
    pub fn deregister(name: &str) -> Result<(), RegistryError> {
        let module = MODULES
            .write()
            .remove(name)
            .ok_or_else(|| RegistryError::ModuleNotFound(String::from(name)))?;
        for (_, ty) in module.types.write().drain() {
            if let Err(error) = Type::remove(ty.id()) {
                log::warn!("[VM Modules] Removing {} from module {}: {}", ty.full_reference(), name, error);
            }
        }
        module.functions.write().clear();
        log::debug!("[VM Modules] Deregistered module {}", name);
        Ok(())
    }

    /// Names of all registered modules.
    pub fn names() -> Vec<String> {
        crate::builtin::ensure_registered();
        MODULES.read().keys().cloned().collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ========================================================================
    // Types
    // ========================================================================

    /// Register a type in this module.
    ///
    /// The description must provide construct, copy and destruct functions
    /// and a valid layout.
    pub fn register_type(
        self: &Arc<Self>,
        description: TypeDescription,
    ) -> Result<Arc<Type>, RegistryError> {
        let name = description.name.clone();
        self.register_type_with(&name, move |_| description)
    }

    pub(crate) fn register_type_with(
        self: &Arc<Self>,
        name: &str,
        build: impl FnOnce(TypeId) -> TypeDescription,
    ) -> Result<Arc<Type>, RegistryError> {
        let mut types = self.types.write();
        if types.contains_key(name) {
            return Err(RegistryError::DuplicateType {
                module: self.name.clone(),
                name: String::from(name),
            });
        }

        let mut invalid = None;
        let ty = Type::add_with(self, |id| {
            let description = build(id);
            invalid = validate_description(&description).err();
            description
        })?;
        if let Some(error) = invalid {
            Type::remove(ty.id())?;
            return Err(error);
        }

        types.insert(String::from(name), Arc::clone(&ty));
        Ok(ty)
    }

    pub fn get_type(&self, name: &str) -> Option<Arc<Type>> {
        self.types.read().get(name).cloned()
    }

    /// Remove a type from this module and from the type table.
    pub fn remove_type(&self, name: &str) -> Result<(), RegistryError> {
        let ty = self
            .types
            .write()
            .remove(name)
            .ok_or_else(|| RegistryError::TypeNotFound {
                module: self.name.clone(),
                name: String::from(name),
            })?;
        Type::remove(ty.id())
    }

    pub fn types(&self) -> Vec<Arc<Type>> {
        self.types.read().values().cloned().collect()
    }

    // ========================================================================
    // Functions
    // ========================================================================

    /// Register a native function.
    pub fn register_function(
        &self,
        name: &str,
        pointer: NativeFunction,
        inputs: Vec<ValueDeclaration>,
        outputs: Vec<ValueDeclaration>,
    ) -> Result<Arc<Function>, RegistryError> {
        self.insert_function(
            name,
            FunctionHandle::Native(pointer),
            inputs,
            outputs,
        )
    }

    /// Load compiled script code and register it as a function.
    pub fn register_script_function(
        &self,
        name: &str,
        inputs: Vec<ValueDeclaration>,
        outputs: Vec<ValueDeclaration>,
        instructions: &[Instruction],
        constants: Vec<Value>,
    ) -> Result<Arc<Function>, RegistryError> {
        if self.functions.read().contains_key(name) {
            return Err(self.duplicate_function(name));
        }
        let offset = code::load(instructions, constants);
        self.insert_function(name, FunctionHandle::Script(offset), inputs, outputs)
    }

    /// Register a script function whose code is supplied later through
    /// [`Module::define_script_function`]. Until then calling it returns
    /// without touching its outputs.
    pub fn declare_script_function(
        &self,
        name: &str,
        inputs: Vec<ValueDeclaration>,
        outputs: Vec<ValueDeclaration>,
    ) -> Result<Arc<Function>, RegistryError> {
        if self.functions.read().contains_key(name) {
            return Err(self.duplicate_function(name));
        }
        let entry = code::reserve_entry();
        self.insert_function(name, FunctionHandle::Script(entry), inputs, outputs)
    }

    /// Load the code of a function declared with
    /// [`Module::declare_script_function`].
    pub fn define_script_function(
        &self,
        function: &Function,
        instructions: &[Instruction],
        constants: Vec<Value>,
    ) -> Result<(), RegistryError> {
        let not_declared = || RegistryError::FunctionNotDeclared {
            module: self.name.clone(),
            name: String::from(function.name()),
        };
        let FunctionHandle::Script(entry) = function.handle() else {
            return Err(not_declared());
        };
        let offset = code::load(instructions, constants);
        if !code::link(entry, offset) {
            return Err(not_declared());
        }
        log::debug!("[VM Modules] Defined function {}.{}", self.name, function.name());
        Ok(())
    }

    /// Remove a function. Code already compiled against it keeps its handle.
    pub fn remove_function(&self, name: &str) -> Result<Arc<Function>, RegistryError> {
        let function = self
            .functions
            .write()
            .remove(name)
            .ok_or_else(|| RegistryError::FunctionNotFound {
                module: self.name.clone(),
                name: String::from(name),
            })?;
        log::debug!("[VM Modules] Removed function {}.{}", self.name, name);
        Ok(function)
    }

    fn insert_function(
        &self,
        name: &str,
        handle: FunctionHandle,
        inputs: Vec<ValueDeclaration>,
        outputs: Vec<ValueDeclaration>,
    ) -> Result<Arc<Function>, RegistryError> {
        let mut functions = self.functions.write();
        if functions.contains_key(name) {
            return Err(self.duplicate_function(name));
        }
        let function = Arc::new(Function::new(
            name,
            Some(&self.name),
            handle,
            inputs,
            outputs,
        ));
        functions.insert(String::from(name), Arc::clone(&function));
        log::debug!("[VM Modules] Registered function {}.{}", self.name, name);
        Ok(function)
    }

    fn duplicate_function(&self, name: &str) -> RegistryError {
        RegistryError::DuplicateFunction {
            module: self.name.clone(),
            name: String::from(name),
        }
    }

    pub fn get_function(&self, name: &str) -> Option<Arc<Function>> {
        self.functions.read().get(name).cloned()
    }

    pub fn functions(&self) -> Vec<Arc<Function>> {
        self.functions.read().values().cloned().collect()
    }
}

impl core::fmt::Debug for Module {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Module").field("name", &self.name).finish()
    }
}

fn validate_description(description: &TypeDescription) -> Result<(), RegistryError> {
    let missing = |function: &'static str| RegistryError::MissingLifecycleFunction {
        type_name: description.name.clone(),
        function,
    };
    if description.construct_function.is_none() {
        return Err(missing("construct"));
    }
    if description.copy_function.is_none() {
        return Err(missing("copy"));
    }
    if description.destruct_function.is_none() {
        return Err(missing("destruct"));
    }
    let layout = &description.memory_layout;
    if !layout.alignment_in_bytes.is_power_of_two()
        || layout.size_in_bytes % layout.alignment_in_bytes != 0
    {
        return Err(RegistryError::InvalidLayout(description.name.clone()));
    }
    Ok(())
}
