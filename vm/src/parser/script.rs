//! Script document parser.
//!
//! A script document bundles type and function definitions:
//!
//! ```json
//! {
//!   "types": {"Counter": {"properties": {"count": {"type": "Core.Number"}}}},
//!   "functions": {"increment": {"inputs": [], "outputs": [], "actions": []}}
//! }
//! ```
//!
//! All scripts added to one [`ScriptParser`] are registered into the same
//! module. Types of every script are registered before any function, and
//! every function is declared before any body is compiled, so a function may
//! use any type of the module and call any of its functions, itself
//! included.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use serde_json::{Map, Value as JsonValue};

use super::function::{ParseScriptFunctionResult, ScriptFunctionParser};
use super::script_type::parse_script_type;
use super::{pointer_token, ParseScriptError, ParseScriptErrors};
use crate::error::RegistryError;
use crate::function::Function;
use crate::module::Module;
use crate::naming;
use crate::types::Type;

/// Everything a parse registered.
#[derive(Debug, Default)]
pub struct ParseScriptResult {
    pub types: Vec<Arc<Type>>,
    pub functions: Vec<Arc<Function>>,
}

struct ScriptSource {
    name: String,
    /// Prepended to the paths of this script's errors.
    path: String,
    definition: JsonValue,
}

/// A function declared in the module whose body is not yet loaded.
struct PendingFunction<'a> {
    function: Arc<Function>,
    definition: &'a JsonValue,
    path: String,
    called: Vec<Arc<Function>>,
    /// `None` once the function failed to compile.
    code: Option<ParseScriptFunctionResult>,
}

/// Collects scripts and registers their contents into one module.
pub struct ScriptParser {
    module: Arc<Module>,
    scripts: Vec<ScriptSource>,
}

impl ScriptParser {
    /// A parser registering into `module_name`, which is created if needed.
    pub fn new(module_name: &str) -> Result<Self, RegistryError> {
        let module = match Module::get(module_name) {
            Some(module) => module,
            None => Module::register(module_name)?,
        };
        Ok(ScriptParser {
            module,
            scripts: Vec::new(),
        })
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    /// Add a script. A name already in use gets a numeric suffix; the name
    /// actually used is returned and prefixes the paths of the script's
    /// errors. Returns `None`, adding nothing, when no numeric suffix is
    /// left for `name`.
    pub fn add_script(&mut self, definition: JsonValue, name: &str) -> Option<String> {
        let name = naming::unique_name(name, |candidate| {
            self.scripts.iter().any(|script| script.name == candidate)
        })?;
        self.scripts.push(ScriptSource {
            path: format!("/{}", pointer_token(&name)),
            name: name.clone(),
            definition,
        });
        Some(name)
    }

    /// Names of the added scripts.
    pub fn script_names(&self) -> impl Iterator<Item = &str> {
        self.scripts.iter().map(|script| script.name.as_str())
    }

    /// Parse and register every added script.
    ///
    /// Definitions with errors are skipped; everything else is registered.
    /// Returns what was registered together with all errors.
    pub fn parse(self) -> (ParseScriptResult, ParseScriptErrors) {
        let mut result = ParseScriptResult::default();
        let mut errors = ParseScriptErrors::new();

        let mut documents = Vec::with_capacity(self.scripts.len());
        for script in &self.scripts {
            match script.definition.as_object() {
                Some(document) => documents.push((script, document)),
                None => errors.push(ParseScriptError::new(
                    "Script must be an object.",
                    root_path(&script.path),
                )),
            }
        }

        for &(script, document) in &documents {
            let base = format!("{}/types", script.path);
            for (name, definition) in entries(document, "types", &base, &mut errors) {
                let path = format!("{}/{}", base, pointer_token(name));
                let definition = with_default_name(definition, name);
                match parse_script_type(&definition) {
                    Ok(parsed) => match parsed.register(&self.module) {
                        Ok(ty) => result.types.push(ty),
                        Err(error) => errors.push(ParseScriptError::new(error.to_string(), root_path(&path))),
                    },
                    Err(type_errors) => extend_prefixed(&mut errors, &path, type_errors),
                }
            }
        }

        let mut pending = Vec::new();
        for &(script, document) in &documents {
            let base = format!("{}/functions", script.path);
            for (name, definition) in entries(document, "functions", &base, &mut errors) {
                let path = format!("{}/{}", base, pointer_token(name));
                let declared = ScriptFunctionParser::parse_signature(definition).and_then(|(inputs, outputs)| {
                    self.module
                        .declare_script_function(name, inputs, outputs)
                        .map_err(|error| alloc::vec![ParseScriptError::new(error.to_string(), "/")])
                });
                match declared {
                    Ok(function) => pending.push(PendingFunction {
                        function,
                        definition,
                        path,
                        called: Vec::new(),
                        code: None,
                    }),
                    Err(declaration_errors) => extend_prefixed(&mut errors, &path, declaration_errors),
                }
            }
        }

        for function in &mut pending {
            let parser = ScriptFunctionParser::parse(function.definition);
            function.called = parser.called_functions().to_vec();
            let (parsed, function_errors) = parser.finish();
            if function_errors.is_empty() {
                function.code = Some(parsed);
            } else {
                extend_prefixed(&mut errors, &function.path, function_errors);
            }
        }
        fail_callers_of_broken_functions(&mut pending, &mut errors);

        for function in pending {
            let defined = match function.code {
                Some(parsed) => self
                    .module
                    .define_script_function(&function.function, &parsed.instructions, parsed.constants)
                    .map_err(|error| {
                        errors.push(ParseScriptError::new(error.to_string(), root_path(&function.path)));
                    })
                    .is_ok(),
                None => false,
            };
            if defined {
                result.functions.push(function.function);
            } else if let Err(error) = self.module.remove_function(function.function.name()) {
                log::warn!("[VM Parser] Removing {}: {}", function.function, error);
            }
        }

        log::info!(
            "[VM Parser] Loaded {} scripts into module {}: {} types, {} functions, {} errors",
            self.scripts.len(),
            self.module.name(),
            result.types.len(),
            result.functions.len(),
            errors.len()
        );
        (result, errors)
    }
}

/// Mark every function that calls a failed function as failed too.
fn fail_callers_of_broken_functions(pending: &mut [PendingFunction<'_>], errors: &mut ParseScriptErrors) {
    loop {
        let failed: Vec<Arc<Function>> = pending
            .iter()
            .filter(|function| function.code.is_none())
            .map(|function| Arc::clone(&function.function))
            .collect();
        let mut changed = false;
        for function in pending.iter_mut().filter(|function| function.code.is_some()) {
            let broken = function
                .called
                .iter()
                .find(|called| failed.iter().any(|failed| Arc::ptr_eq(failed, called)));
            if let Some(broken) = broken {
                errors.push(ParseScriptError::new(
                    format!("Function {} calls {}, which has errors.", function.function, broken),
                    root_path(&function.path),
                ));
                function.code = None;
                changed = true;
            }
        }
        if !changed {
            return;
        }
    }
}

/// The `key` section of a script document as name/definition pairs.
fn entries<'a>(
    document: &'a Map<String, JsonValue>,
    key: &str,
    path: &str,
    errors: &mut ParseScriptErrors,
) -> Vec<(&'a str, &'a JsonValue)> {
    match document.get(key) {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::Object(section)) => section
            .iter()
            .map(|(name, definition)| (name.as_str(), definition))
            .collect(),
        Some(_) => {
            errors.push(ParseScriptError::new(format!("Key '{}' must be an object.", key), path));
            Vec::new()
        }
    }
}

/// `definition` with `"name"` set to `name` unless it names itself.
fn with_default_name(definition: &JsonValue, name: &str) -> JsonValue {
    let mut definition = definition.clone();
    if let JsonValue::Object(object) = &mut definition {
        object
            .entry("name")
            .or_insert_with(|| JsonValue::String(String::from(name)));
    }
    definition
}

fn root_path(path: &str) -> String {
    if path.is_empty() {
        String::from("/")
    } else {
        String::from(path)
    }
}

fn extend_prefixed(errors: &mut ParseScriptErrors, prefix: &str, new_errors: ParseScriptErrors) {
    errors.extend(new_errors.into_iter().map(|error| {
        let path = if error.path == "/" {
            root_path(prefix)
        } else {
            format!("{}{}", prefix, error.path)
        };
        ParseScriptError::new(error.message, path)
    }));
}

/// Parse one script document into `module_name`. Error paths are relative to
/// the document.
pub fn parse_script(module_name: &str, script: &JsonValue) -> Result<ParseScriptResult, ParseScriptErrors> {
    let mut parser = ScriptParser::new(module_name)
        .map_err(|error| alloc::vec![ParseScriptError::new(error.to_string(), "/")])?;
    parser.scripts.push(ScriptSource {
        name: String::new(),
        path: String::new(),
        definition: script.clone(),
    });
    let (result, errors) = parser.parse();
    if errors.is_empty() {
        Ok(result)
    } else {
        Err(errors)
    }
}
