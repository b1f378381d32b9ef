//! Function definition parser.
//!
//! ```json
//! {
//!   "inputs": [{"name": "x", "type": "Core.Number"}],
//!   "outputs": [{"name": "result", "type": "Core.Number"}],
//!   "actions": [
//!     {
//!       "type": "function_call",
//!       "function": {"module": "Core", "name": "negate"},
//!       "inputs": {"a": {"variable": "x"}},
//!       "outputs": {"result": "result"}
//!     }
//!   ]
//! }
//! ```
//!
//! The frame of a parsed function starts with its outputs followed by its
//! inputs; local variables are allocated after them in the order they are
//! first assigned. Between two actions the stack holds exactly the variables
//! of the enclosing scopes.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use serde_json::{Map, Value as JsonValue};

use super::{pointer_token, ParseScriptError, ParseScriptErrors};
use crate::builtin;
use crate::function::{Function, ValueDeclaration};
use crate::instruction::{Instruction, StackOffset};
use crate::module::Module;
use crate::type_id::TypeId;
use crate::types::{self, Type};
use crate::value::Value;

/// Output of a successful function parse, ready for
/// [`Module::register_script_function`].
#[derive(Debug)]
pub struct ParseScriptFunctionResult {
    pub inputs: Vec<ValueDeclaration>,
    pub outputs: Vec<ValueDeclaration>,
    pub instructions: Vec<Instruction>,
    /// Constants referenced by `PushConstant`, indexed from zero.
    pub constants: Vec<Value>,
}

#[derive(Debug)]
struct Variable {
    name: String,
    type_id: TypeId,
    position: u32,
}

#[derive(Debug)]
struct Scope {
    /// Frame position of the first variable of this scope.
    position_offset: u32,
    variables: Vec<Variable>,
}

impl Scope {
    fn end(&self) -> u32 {
        self.position_offset + self.variables.len() as u32
    }
}

/// Lowers one function definition to instructions.
///
/// The parser always produces an instruction stream ending in `Return`,
/// even if errors were recorded; check [`ScriptFunctionParser::errors`]
/// before running it.
#[derive(Debug)]
pub struct ScriptFunctionParser {
    inputs: Vec<ValueDeclaration>,
    outputs: Vec<ValueDeclaration>,
    instructions: Vec<Instruction>,
    constants: Vec<Value>,
    /// Innermost scope last.
    scopes: Vec<Scope>,
    /// Script functions the body calls.
    called: Vec<Arc<Function>>,
    errors: ParseScriptErrors,
}

impl ScriptFunctionParser {
    fn empty() -> Self {
        ScriptFunctionParser {
            inputs: Vec::new(),
            outputs: Vec::new(),
            instructions: Vec::new(),
            constants: Vec::new(),
            scopes: vec![Scope {
                position_offset: 0,
                variables: Vec::new(),
            }],
            called: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Parse only the input and output declarations of `definition`,
    /// returned as `(inputs, outputs)`.
    pub fn parse_signature(
        definition: &JsonValue,
    ) -> Result<(Vec<ValueDeclaration>, Vec<ValueDeclaration>), ParseScriptErrors> {
        let mut parser = Self::empty();
        let Some(definition) = definition.as_object() else {
            return Err(vec![ParseScriptError::new("Function definition must be an object.", "/")]);
        };
        let outputs = parser.parse_declarations(definition.get("outputs"), "/outputs");
        let inputs = parser.parse_declarations(definition.get("inputs"), "/inputs");
        if parser.errors.is_empty() {
            Ok((inputs, outputs))
        } else {
            Err(parser.errors)
        }
    }

    /// Parse `definition`.
    pub fn parse(definition: &JsonValue) -> Self {
        let mut parser = Self::empty();

        match definition.as_object() {
            Some(definition) => {
                parser.outputs = parser.parse_declarations(definition.get("outputs"), "/outputs");
                parser.inputs = parser.parse_declarations(definition.get("inputs"), "/inputs");
                let root: Vec<Variable> = parser
                    .outputs
                    .iter()
                    .chain(&parser.inputs)
                    .enumerate()
                    .map(|(position, declaration)| Variable {
                        name: declaration.name.clone(),
                        type_id: declaration.type_id,
                        position: position as u32,
                    })
                    .collect();
                parser.scopes[0].variables = root;
                parser.parse_actions(definition.get("actions"), "/actions");
            }
            None => parser.error("Function definition must be an object.", "/"),
        }
        parser.instructions.push(Instruction::Return);

        log::debug!(
            "[VM Parser] Parsed function: {} instructions, {} constants, {} errors",
            parser.instructions.len(),
            parser.constants.len(),
            parser.errors.len()
        );
        parser
    }

    pub fn errors(&self) -> &[ParseScriptError] {
        &self.errors
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Script functions called by the parsed body, each listed once.
    pub fn called_functions(&self) -> &[Arc<Function>] {
        &self.called
    }

    /// The parsed function together with all recorded errors.
    pub fn finish(self) -> (ParseScriptFunctionResult, ParseScriptErrors) {
        let result = ParseScriptFunctionResult {
            inputs: self.inputs,
            outputs: self.outputs,
            instructions: self.instructions,
            constants: self.constants,
        };
        (result, self.errors)
    }

    /// The parsed function if no error was recorded.
    pub fn into_result(self) -> Result<ParseScriptFunctionResult, ParseScriptErrors> {
        let (result, errors) = self.finish();
        if errors.is_empty() {
            Ok(result)
        } else {
            Err(errors)
        }
    }

    fn error(&mut self, message: impl Into<String>, path: &str) {
        self.errors.push(ParseScriptError::new(message, path));
    }

    // ========================================================================
    // Declarations
    // ========================================================================

    fn parse_declarations(&mut self, declarations: Option<&JsonValue>, path: &str) -> Vec<ValueDeclaration> {
        let declarations = match declarations {
            None | Some(JsonValue::Null) => return Vec::new(),
            Some(JsonValue::Array(declarations)) => declarations,
            Some(_) => {
                self.error("Declarations must be an array.", path);
                return Vec::new();
            }
        };

        let mut parsed: Vec<ValueDeclaration> = Vec::with_capacity(declarations.len());
        for (index, declaration) in declarations.iter().enumerate() {
            let path = format!("{}/{}", path, index);
            let Some(declaration) = declaration.as_object() else {
                self.error("Declaration must be an object.", &path);
                continue;
            };
            let Some(name) = declaration.get("name").and_then(JsonValue::as_str) else {
                self.error("Declaration must contain key 'name' of type string.", &path);
                continue;
            };
            if parsed.iter().any(|existing| existing.name == name) {
                self.error(format!("Duplicate declaration '{}'.", name), &path);
                continue;
            }
            let Some(ty) = declaration.get("type").and_then(Type::deserialize) else {
                let reference = declaration.get("type").map(JsonValue::to_string);
                self.error(
                    format!("Invalid type for '{}': {}", name, reference.unwrap_or_default()),
                    &path,
                );
                continue;
            };
            parsed.push(ValueDeclaration::new(name, ty.id()));
        }
        parsed
    }

    // ========================================================================
    // Actions
    // ========================================================================

    fn parse_actions(&mut self, actions: Option<&JsonValue>, path: &str) {
        let Some(actions) = actions.and_then(JsonValue::as_array) else {
            self.error("Actions must be an array.", path);
            return;
        };
        for (index, action) in actions.iter().enumerate() {
            self.parse_action(action, &format!("{}/{}", path, index));
        }
    }

    fn parse_action(&mut self, action: &JsonValue, path: &str) {
        let Some(action) = action.as_object() else {
            self.error("Action must be an object.", path);
            return;
        };
        match action.get("type") {
            None => self.error("Action must contain key 'type'.", path),
            Some(JsonValue::String(kind)) => match kind.as_str() {
                "function_call" => self.parse_function_call(action, path),
                "if" => self.parse_if(action, path),
                "while" => self.parse_while(action, path),
                _ => self.error(format!("Unknown value for action type: '{}'", kind), path),
            },
            Some(_) => self.error("Key 'type' must be a string.", path),
        }
    }

    fn parse_function_call(&mut self, action: &Map<String, JsonValue>, path: &str) {
        let Some(function) = self.resolve_function(action.get("function"), path) else {
            return;
        };

        let mut output_positions: Vec<Option<u32>> = vec![None; function.outputs().len()];
        match action.get("outputs") {
            None | Some(JsonValue::Null) => {}
            Some(JsonValue::Object(outputs)) => {
                for (output_name, local) in outputs {
                    let Some(local) = local.as_str() else {
                        self.error(
                            format!("Local variable name of output '{}' must be a string.", output_name),
                            path,
                        );
                        continue;
                    };
                    let Some(index) = function.get_output_index(output_name) else {
                        self.error(
                            format!("Output '{}' not present for function {}.", output_name, function),
                            path,
                        );
                        continue;
                    };
                    let output_type = function.output(index).type_id;
                    match self.output_variable_position(local, output_type) {
                        Ok(position) => output_positions[index] = Some(position),
                        Err(variable_type) => self.error(
                            format!(
                                "Mismatched types: variable '{}' is {}, output '{}' is {}.",
                                local,
                                types::type_name(variable_type),
                                output_name,
                                types::type_name(output_type)
                            ),
                            path,
                        ),
                    }
                }
            }
            Some(_) => self.error("Function key 'outputs' must be an object.", path),
        }

        let argument_count = self.push_call(&function, action.get("inputs"), path);
        for (index, position) in output_positions.iter().enumerate() {
            if let Some(position) = *position {
                self.instructions.push(Instruction::AssignStackValue {
                    source: StackOffset::Top(index as i32 - argument_count as i32),
                    destination: StackOffset::Frame(position),
                });
            }
        }
        self.emit_pop(argument_count);
    }

    fn parse_if(&mut self, action: &Map<String, JsonValue>, path: &str) {
        let Some((condition, actions)) = self.condition_and_body(action, "If", path) else {
            return;
        };
        self.push_value(condition, builtin::boolean_type().id(), &format!("{}/condition", path));
        let jump = self.emit_jump_placeholder();
        self.parse_block(actions, &format!("{}/actions", path));
        self.patch_jump(jump);
    }

    fn parse_while(&mut self, action: &Map<String, JsonValue>, path: &str) {
        let Some((condition, actions)) = self.condition_and_body(action, "While", path) else {
            return;
        };
        let loop_start = self.instructions.len();
        self.push_value(condition, builtin::boolean_type().id(), &format!("{}/condition", path));
        let jump = self.emit_jump_placeholder();
        self.parse_block(actions, &format!("{}/actions", path));
        let back = self.instructions.len();
        self.instructions.push(Instruction::Jump {
            offset: loop_start as i32 - back as i32,
        });
        self.patch_jump(jump);
    }

    fn condition_and_body<'a>(
        &mut self,
        action: &'a Map<String, JsonValue>,
        kind: &str,
        path: &str,
    ) -> Option<(&'a JsonValue, &'a JsonValue)> {
        let Some(condition) = action.get("condition") else {
            self.error(format!("{} requires key 'condition'.", kind), path);
            return None;
        };
        let Some(actions) = action.get("actions") else {
            self.error(format!("{} requires key 'actions'.", kind), path);
            return None;
        };
        Some((condition, actions))
    }

    /// Lower `actions` in a new scope and pop its variables at the end.
    fn parse_block(&mut self, actions: &JsonValue, path: &str) {
        let position_offset = self.stack_height();
        self.scopes.push(Scope {
            position_offset,
            variables: Vec::new(),
        });
        self.parse_actions(Some(actions), path);
        if let Some(scope) = self.scopes.pop() {
            self.emit_pop(scope.variables.len());
        }
    }

    fn emit_jump_placeholder(&mut self) -> usize {
        self.instructions.push(Instruction::JumpIfFalse { offset: 0 });
        self.instructions.len() - 1
    }

    /// Point the `JumpIfFalse` at `jump` to the next instruction emitted.
    fn patch_jump(&mut self, jump: usize) {
        let target = (self.instructions.len() - jump) as i32;
        if let Some(Instruction::JumpIfFalse { offset }) = self.instructions.get_mut(jump) {
            *offset = target;
        }
    }

    fn emit_pop(&mut self, count: usize) {
        if count > 0 {
            self.instructions.push(Instruction::Pop { count: count as u32 });
        }
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Resolve a `{"module", "name"}` function reference, recording an error
    /// on failure.
    fn resolve_function(&mut self, reference: Option<&JsonValue>, path: &str) -> Option<Arc<Function>> {
        let Some(reference) = reference else {
            self.error("Function call does not include key 'function'.", path);
            return None;
        };
        let Some(reference) = reference.as_object() else {
            self.error("Function key must be an object.", path);
            return None;
        };
        let name = match reference.get("name") {
            None => {
                self.error("Function must contain key 'name'.", path);
                return None;
            }
            Some(JsonValue::String(name)) => name,
            Some(_) => {
                self.error("Function key 'name' must be of type string.", path);
                return None;
            }
        };
        let module_name = match reference.get("module") {
            None => {
                self.error("Function must contain key 'module'.", path);
                return None;
            }
            Some(JsonValue::String(module)) => module,
            Some(_) => {
                self.error("Function key 'module' must be of type string.", path);
                return None;
            }
        };
        let Some(module) = Module::get(module_name) else {
            self.error(format!("Module {} not found.", module_name), path);
            return None;
        };
        let Some(function) = module.get_function(name) else {
            self.error(format!("Function {} not found in module {}.", name, module_name), path);
            return None;
        };
        if u16::try_from(function.inputs().len()).is_err() || u16::try_from(function.outputs().len()).is_err() {
            self.error(format!("Function {} has too many inputs or outputs.", function), path);
            return None;
        }
        if function.is_script_function() && !self.called.iter().any(|called| Arc::ptr_eq(called, &function)) {
            self.called.push(Arc::clone(&function));
        }
        Some(function)
    }

    /// Emit the call region of `function` (output slots, then every input)
    /// and the call itself. Returns the number of slots left on the stack.
    fn push_call(&mut self, function: &Function, inputs: Option<&JsonValue>, path: &str) -> usize {
        let empty = Map::new();
        let inputs = match inputs {
            None | Some(JsonValue::Null) => &empty,
            Some(JsonValue::Object(inputs)) => inputs,
            Some(_) => {
                self.error("Function key 'inputs' must be an object.", path);
                &empty
            }
        };
        for name in inputs.keys() {
            if function.get_input_index(name).is_none() {
                self.error(format!("Input '{}' not present for function {}.", name, function), path);
            }
        }

        let output_count = function.outputs().len();
        self.emit_push(output_count);
        for declaration in function.inputs() {
            match inputs.get(&declaration.name) {
                Some(expression) => self.push_value(
                    expression,
                    declaration.type_id,
                    &format!("{}/inputs/{}", path, pointer_token(&declaration.name)),
                ),
                None => {
                    self.error(format!("Missing input: '{}'.", declaration.name), path);
                    self.emit_push(1);
                }
            }
        }

        let input_count = function.inputs().len();
        self.instructions.push(Instruction::FunctionCall {
            handle: function.handle(),
            input_count: input_count as u16,
            output_count: output_count as u16,
        });
        input_count + output_count
    }

    fn emit_push(&mut self, count: usize) {
        if count > 0 {
            self.instructions.push(Instruction::Push { count: count as u32 });
        }
    }

    // ========================================================================
    // Values
    // ========================================================================

    /// Push exactly one slot holding `expression`. On error the slot is left
    /// empty.
    fn push_value(&mut self, expression: &JsonValue, expected: TypeId, path: &str) {
        match self.lower_value(expression, path) {
            Some(type_id) => {
                if !types::compatible(type_id, expected) {
                    self.error(
                        format!(
                            "Expected {}, got {}.",
                            types::type_name(expected),
                            types::type_name(type_id)
                        ),
                        path,
                    );
                }
            }
            None => self.emit_push(1),
        }
    }

    /// Emit code pushing `expression` and return its type, or record an
    /// error and emit nothing.
    fn lower_value(&mut self, expression: &JsonValue, path: &str) -> Option<TypeId> {
        match expression {
            JsonValue::Bool(value) => self.push_constant(Value::with_type(builtin::boolean_type(), *value), path),
            JsonValue::Number(number) => match number.as_f64() {
                Some(value) => self.push_constant(Value::with_type(builtin::number_type(), value), path),
                None => {
                    self.error(format!("Number {} is not representable.", number), path);
                    None
                }
            },
            JsonValue::String(value) => {
                self.push_constant(Value::with_type(builtin::string_type(), value.clone()), path)
            }
            JsonValue::Object(object) if object.contains_key("variable") => self.push_variable(object, path),
            JsonValue::Object(object) if object.contains_key("function") => {
                self.push_function_result(object, path)
            }
            _ => {
                self.error("Invalid value expression.", path);
                None
            }
        }
    }

    fn push_constant(
        &mut self,
        value: Result<Value, crate::error::ValueError>,
        path: &str,
    ) -> Option<TypeId> {
        let value = match value {
            Ok(value) => value,
            Err(error) => {
                self.error(format!("Invalid constant: {}", error), path);
                return None;
            }
        };
        let type_id = value.type_id();
        self.instructions.push(Instruction::PushConstant {
            index: self.constants.len() as u32,
        });
        self.constants.push(value);
        Some(type_id)
    }

    fn push_variable(&mut self, object: &Map<String, JsonValue>, path: &str) -> Option<TypeId> {
        let Some(name) = object.get("variable").and_then(JsonValue::as_str) else {
            self.error("Variable name must be a string.", path);
            return None;
        };
        let Some((position, type_id)) = self
            .find_variable(name)
            .map(|variable| (variable.position, variable.type_id))
        else {
            self.error(format!("Unknown variable '{}'.", name), path);
            return None;
        };
        self.instructions.push(Instruction::PushStackValue {
            position: StackOffset::Frame(position),
        });
        Some(type_id)
    }

    /// Call a function and keep one of its outputs on the stack.
    fn push_function_result(&mut self, object: &Map<String, JsonValue>, path: &str) -> Option<TypeId> {
        let function = self.resolve_function(object.get("function"), path)?;
        let index = match object.get("output") {
            Some(JsonValue::String(name)) => match function.get_output_index(name) {
                Some(index) => index,
                None => {
                    self.error(format!("Output '{}' not present for function {}.", name, function), path);
                    return None;
                }
            },
            Some(_) => {
                self.error("Key 'output' must be a string.", path);
                return None;
            }
            None if function.outputs().len() == 1 => 0,
            None => {
                self.error(
                    format!("Function {} must have exactly one output or key 'output'.", function),
                    path,
                );
                return None;
            }
        };

        let argument_count = self.push_call(&function, object.get("inputs"), path);
        if index != 0 {
            self.instructions.push(Instruction::AssignStackValue {
                source: StackOffset::Top(index as i32 - argument_count as i32),
                destination: StackOffset::Top(-(argument_count as i32)),
            });
        }
        self.emit_pop(argument_count - 1);
        Some(function.output(index).type_id)
    }

    // ========================================================================
    // Variables
    // ========================================================================

    fn stack_height(&self) -> u32 {
        self.scopes.last().map_or(0, Scope::end)
    }

    /// Innermost variable called `name`.
    fn find_variable(&self, name: &str) -> Option<&Variable> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.variables.iter().find(|variable| variable.name == name))
    }

    /// Frame position to store an output of type `type_id` in. Allocates a
    /// new variable in the current scope if `name` is unknown; a known
    /// variable of another type is rejected with its type.
    fn output_variable_position(&mut self, name: &str, type_id: TypeId) -> Result<u32, TypeId> {
        if let Some(variable) = self.find_variable(name) {
            return if types::compatible(type_id, variable.type_id) {
                Ok(variable.position)
            } else {
                Err(variable.type_id)
            };
        }

        let position = self.stack_height();
        self.emit_push(1);
        if let Some(scope) = self.scopes.last_mut() {
            scope.variables.push(Variable {
                name: String::from(name),
                type_id,
                position,
            });
        }
        Ok(position)
    }
}

/// Parse a function definition, failing with every recorded error.
pub fn parse_script_function(definition: &JsonValue) -> Result<ParseScriptFunctionResult, ParseScriptErrors> {
    ScriptFunctionParser::parse(definition).into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::register_test_module;
    use serde_json::json;

    fn core_function(name: &str) -> Arc<Function> {
        builtin::core_module().get_function(name).unwrap()
    }

    fn compile(module: &Arc<Module>, name: &str, definition: JsonValue) -> Arc<Function> {
        let result = parse_script_function(&definition).unwrap();
        module
            .register_script_function(
                name,
                result.inputs,
                result.outputs,
                &result.instructions,
                result.constants,
            )
            .unwrap()
    }

    fn number(name: &str) -> JsonValue {
        json!({"name": name, "type": "Core.Number"})
    }

    fn call(function: &str, inputs: JsonValue, outputs: JsonValue) -> JsonValue {
        json!({
            "type": "function_call",
            "function": {"module": "Core", "name": function},
            "inputs": inputs,
            "outputs": outputs,
        })
    }

    fn nested(function: &str, inputs: JsonValue) -> JsonValue {
        json!({"function": {"module": "Core", "name": function}, "inputs": inputs})
    }

    #[test]
    fn test_declarations() {
        let result = parse_script_function(&json!({
            "inputs": [number("x"), {"name": "flag", "type": {"module": "Core", "name": "Boolean"}}],
            "outputs": [number("result")],
            "actions": [],
        }))
        .unwrap();
        assert_eq!(result.inputs.len(), 2);
        assert_eq!(result.inputs[0].type_id, builtin::number_type().id());
        assert_eq!(result.inputs[1].type_id, builtin::boolean_type().id());
        assert_eq!(result.outputs[0].name, "result");
        assert_eq!(result.instructions, vec![Instruction::Return]);
    }

    #[test]
    fn test_invalid_declarations() {
        let errors = parse_script_function(&json!({
            "inputs": [number("x"), number("x"), {"name": "y", "type": "Core.Missing"}],
            "outputs": 3,
            "actions": [],
        }))
        .unwrap_err();
        let paths: Vec<&str> = errors.iter().map(|error| error.path.as_str()).collect();
        assert_eq!(paths, ["/outputs", "/inputs/1", "/inputs/2"]);
    }

    #[test]
    fn test_function_call_lowering() {
        let result = parse_script_function(&json!({
            "inputs": [number("x")],
            "outputs": [number("result")],
            "actions": [call("add", json!({"a": {"variable": "x"}, "b": 1}), json!({"result": "result"}))],
        }))
        .unwrap();
        assert_eq!(
            result.instructions,
            vec![
                Instruction::Push { count: 1 },
                Instruction::PushStackValue {
                    position: StackOffset::Frame(1)
                },
                Instruction::PushConstant { index: 0 },
                Instruction::FunctionCall {
                    handle: core_function("add").handle(),
                    input_count: 2,
                    output_count: 1,
                },
                Instruction::AssignStackValue {
                    source: StackOffset::Top(-3),
                    destination: StackOffset::Frame(0),
                },
                Instruction::Pop { count: 3 },
                Instruction::Return,
            ]
        );
        assert_eq!(result.constants[0].get::<f64>(), Some(&1.0));
    }

    #[test]
    fn test_output_allocates_local_variable() {
        let result = parse_script_function(&json!({
            "inputs": [number("x")],
            "outputs": [],
            "actions": [
                call("negate", json!({"a": {"variable": "x"}}), json!({"result": "y"})),
                call("negate", json!({"a": {"variable": "y"}}), json!({"result": "y"})),
            ],
        }))
        .unwrap();
        // y is allocated once, after x.
        assert_eq!(result.instructions[0], Instruction::Push { count: 1 });
        assert_eq!(
            result
                .instructions
                .iter()
                .filter(|instruction| matches!(
                    instruction,
                    Instruction::AssignStackValue {
                        destination: StackOffset::Frame(1),
                        ..
                    }
                ))
                .count(),
            2
        );
        assert!(result.instructions.contains(&Instruction::PushStackValue {
            position: StackOffset::Frame(1)
        }));
    }

    #[test]
    fn test_if_backpatch() {
        let module = register_test_module();
        let definition = json!({
            "inputs": [number("x")],
            "outputs": [number("result")],
            "actions": [
                call("add", json!({"a": {"variable": "x"}, "b": 0}), json!({"result": "result"})),
                {
                    "type": "if",
                    "condition": nested("less", json!({"a": {"variable": "x"}, "b": 0})),
                    "actions": [call("negate", json!({"a": {"variable": "x"}}), json!({"result": "result"}))],
                },
            ],
        });

        let parser = ScriptFunctionParser::parse(&definition);
        let jump = parser
            .instructions()
            .iter()
            .position(|instruction| matches!(instruction, Instruction::JumpIfFalse { .. }))
            .unwrap();
        // The body is a five instruction call sequence.
        assert_eq!(parser.instructions()[jump], Instruction::JumpIfFalse { offset: 6 });
        assert_eq!(parser.instructions()[jump + 6], Instruction::Return);

        let abs = compile(&module, "abs", definition);
        assert_eq!(abs.call::<f64, _>((-3.0,)).unwrap(), 3.0);
        assert_eq!(abs.call::<f64, _>((2.5,)).unwrap(), 2.5);
    }

    #[test]
    fn test_while_loop() {
        let module = register_test_module();
        let definition = json!({
            "inputs": [number("n")],
            "outputs": [number("sum")],
            "actions": [
                call("add", json!({"a": 0, "b": 0}), json!({"result": "sum"})),
                call("add", json!({"a": 1, "b": 0}), json!({"result": "i"})),
                {
                    "type": "while",
                    "condition": nested("less_or_equal", json!({"a": {"variable": "i"}, "b": {"variable": "n"}})),
                    "actions": [
                        call("multiply", json!({"a": {"variable": "i"}, "b": 2}), json!({"result": "doubled"})),
                        call("add", json!({"a": {"variable": "sum"}, "b": {"variable": "doubled"}}), json!({"result": "sum"})),
                        call("add", json!({"a": {"variable": "i"}, "b": 1}), json!({"result": "i"})),
                    ],
                },
            ],
        });

        let parser = ScriptFunctionParser::parse(&definition);
        let instructions = parser.instructions();
        let jump = instructions
            .iter()
            .position(|instruction| matches!(instruction, Instruction::JumpIfFalse { .. }))
            .unwrap();
        let Instruction::JumpIfFalse { offset } = instructions[jump] else {
            unreachable!();
        };
        let back = jump + offset as usize - 1;
        // The body scope pops `doubled` before jumping back to the condition.
        assert_eq!(instructions[back - 1], Instruction::Pop { count: 1 });
        let Instruction::Jump { offset: back_offset } = instructions[back] else {
            panic!("expected jump, got {}", instructions[back]);
        };
        let loop_start = (back as i32 + back_offset) as usize;
        assert_eq!(instructions[loop_start], Instruction::Push { count: 1 });
        assert_eq!(instructions[back + 1], Instruction::Return);

        let sum = compile(&module, "sum_of_doubles", definition);
        assert_eq!(sum.call::<f64, _>((4.0,)).unwrap(), 20.0);
        assert_eq!(sum.call::<f64, _>((0.0,)).unwrap(), 0.0);
    }

    #[test]
    fn test_nested_function_output() {
        let module = register_test_module();
        module
            .register_function(
                "div_mod",
                div_mod,
                vec![number_declaration("a"), number_declaration("b")],
                vec![number_declaration("quotient"), number_declaration("remainder")],
            )
            .unwrap();

        let function = compile(
            &module,
            "remainder_plus_one",
            json!({
                "inputs": [number("x")],
                "outputs": [number("result")],
                "actions": [call(
                    "add",
                    json!({
                        "a": {
                            "function": {"module": module.name(), "name": "div_mod"},
                            "inputs": {"a": {"variable": "x"}, "b": 4},
                            "output": "remainder",
                        },
                        "b": nested("negate", json!({"a": -1})),
                    }),
                    json!({"result": "result"}),
                )],
            }),
        );
        assert_eq!(function.call::<f64, _>((11.0,)).unwrap(), 4.0);
    }

    fn div_mod(call: &mut crate::context::NativeCall<'_>) -> Result<(), crate::error::ExecutionError> {
        let a = *call.input::<f64>(0)?;
        let b = *call.input::<f64>(1)?;
        call.set_output(0, (a / b).floor())?;
        call.set_output(1, a % b)
    }

    fn number_declaration(name: &str) -> ValueDeclaration {
        ValueDeclaration::new(name, builtin::number_type().id())
    }

    #[test]
    fn test_string_constants() {
        let module = register_test_module();
        let greet = compile(
            &module,
            "greet",
            json!({
                "inputs": [{"name": "name", "type": "Core.String"}],
                "outputs": [{"name": "greeting", "type": "Core.String"}],
                "actions": [call(
                    "concat",
                    json!({"a": "Hello, ", "b": {"variable": "name"}}),
                    json!({"result": "greeting"}),
                )],
            }),
        );
        assert_eq!(
            greet.call::<String, _>((String::from("VM"),)).unwrap(),
            "Hello, VM"
        );
    }

    #[test]
    fn test_unknown_module_reports_action_path() {
        let parser = ScriptFunctionParser::parse(&json!({
            "inputs": [number("x")],
            "outputs": [],
            "actions": [
                call("negate", json!({"a": {"variable": "x"}}), json!({})),
                {
                    "type": "function_call",
                    "function": {"module": "NoSuchModule", "name": "f"},
                    "inputs": {},
                    "outputs": {},
                },
            ],
        }));
        assert_eq!(
            parser.errors(),
            [ParseScriptError::new("Module NoSuchModule not found.", "/actions/1")]
        );
        assert_eq!(parser.instructions().last(), Some(&Instruction::Return));
        assert!(parser.instructions().len() > 1);
    }

    #[test]
    fn test_structural_errors() {
        let errors = parse_script_function(&json!({
            "actions": [
                3,
                {"kind": "if"},
                {"type": 1},
                {"type": "loop"},
                {"type": "if", "actions": []},
                {"type": "while", "condition": true},
            ],
        }))
        .unwrap_err();
        let messages: Vec<(&str, &str)> = errors
            .iter()
            .map(|error| (error.path.as_str(), error.message.as_str()))
            .collect();
        assert_eq!(
            messages,
            [
                ("/actions/0", "Action must be an object."),
                ("/actions/1", "Action must contain key 'type'."),
                ("/actions/2", "Key 'type' must be a string."),
                ("/actions/3", "Unknown value for action type: 'loop'"),
                ("/actions/4", "If requires key 'condition'."),
                ("/actions/5", "While requires key 'actions'."),
            ]
        );

        let errors = parse_script_function(&json!([])).unwrap_err();
        assert_eq!(errors[0].path, "/");
        let errors = parse_script_function(&json!({"inputs": []})).unwrap_err();
        assert_eq!(errors, [ParseScriptError::new("Actions must be an array.", "/actions")]);
    }

    #[test]
    fn test_mismatched_output_type_allocates_nothing() {
        let parser = ScriptFunctionParser::parse(&json!({
            "inputs": [number("x")],
            "outputs": [],
            "actions": [call("less", json!({"a": 1, "b": 2}), json!({"result": "x"}))],
        }));
        assert_eq!(parser.errors().len(), 1);
        assert_eq!(parser.errors()[0].path, "/actions/0");
        assert!(parser.errors()[0].message.starts_with("Mismatched types"));
        assert!(!parser
            .instructions()
            .iter()
            .any(|instruction| matches!(instruction, Instruction::AssignStackValue { .. })));
        assert_eq!(parser.instructions()[0], Instruction::Push { count: 1 });
    }

    #[test]
    fn test_input_errors() {
        let parser = ScriptFunctionParser::parse(&json!({
            "inputs": [],
            "outputs": [],
            "actions": [
                call("add", json!({"a": true, "c": 1}), json!({})),
                {
                    "type": "if",
                    "condition": {"variable": "missing"},
                    "actions": [],
                },
            ],
        }));
        let messages: Vec<(&str, &str)> = parser
            .errors()
            .iter()
            .map(|error| (error.path.as_str(), error.message.as_str()))
            .collect();
        assert_eq!(
            messages,
            [
                ("/actions/0", "Input 'c' not present for function Core.add."),
                ("/actions/0/inputs/a", "Expected Core.Number, got Core.Boolean."),
                ("/actions/0", "Missing input: 'b'."),
                ("/actions/1/condition", "Unknown variable 'missing'."),
            ]
        );
        // Every input still occupies exactly one slot.
        assert_eq!(
            &parser.instructions()[..4],
            &[
                Instruction::Push { count: 1 },
                Instruction::PushConstant { index: 0 },
                Instruction::Push { count: 1 },
                Instruction::FunctionCall {
                    handle: core_function("add").handle(),
                    input_count: 2,
                    output_count: 1,
                },
            ]
        );
    }
}
