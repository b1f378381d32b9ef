//! Scripts parsed from JSON and executed end to end.

use std::sync::atomic::{AtomicUsize, Ordering};

use kpio_vm::parser::{parse_script, parse_script_function};
use kpio_vm::{ExecutionContext, ExecutionError, Module, ScriptParser, Value, VmConfig};
use serde_json::{json, Value as JsonValue};

static NEXT_MODULE: AtomicUsize = AtomicUsize::new(0);

fn module_name(prefix: &str) -> String {
    format!("{prefix}{}", NEXT_MODULE.fetch_add(1, Ordering::Relaxed))
}

fn number(name: &str) -> JsonValue {
    json!({"name": name, "type": "Core.Number"})
}

fn call(module: &str, function: &str, inputs: JsonValue, outputs: JsonValue) -> JsonValue {
    json!({
        "type": "function_call",
        "function": {"module": module, "name": function},
        "inputs": inputs,
        "outputs": outputs,
    })
}

fn core(function: &str, inputs: JsonValue) -> JsonValue {
    json!({"function": {"module": "Core", "name": function}, "inputs": inputs})
}

/// Counts the numbers in `1..=n` greater than `threshold`, with an `if`
/// nested in a `while` and a local declared in each scope.
fn count_above() -> JsonValue {
    json!({
        "inputs": [number("n"), number("threshold")],
        "outputs": [number("count")],
        "actions": [
            call("Core", "add", json!({"a": 0, "b": 0}), json!({"result": "count"})),
            call("Core", "add", json!({"a": 1, "b": 0}), json!({"result": "i"})),
            {
                "type": "while",
                "condition": core("less_or_equal", json!({"a": {"variable": "i"}, "b": {"variable": "n"}})),
                "actions": [
                    call("Core", "greater", json!({"a": {"variable": "i"}, "b": {"variable": "threshold"}}), json!({"result": "above"})),
                    {
                        "type": "if",
                        "condition": {"variable": "above"},
                        "actions": [
                            call("Core", "add", json!({"a": {"variable": "count"}, "b": 1}), json!({"result": "next"})),
                            call("Core", "add", json!({"a": {"variable": "next"}, "b": 0}), json!({"result": "count"})),
                        ],
                    },
                    call("Core", "add", json!({"a": {"variable": "i"}, "b": 1}), json!({"result": "i"})),
                ],
            },
        ],
    })
}

#[test]
fn nested_control_flow() {
    let name = module_name("Flow");
    let result = parse_script(&name, &json!({"functions": {"count_above": count_above()}})).unwrap();
    let function = &result.functions[0];

    assert_eq!(function.call::<f64, _>((10.0, 3.0)).unwrap(), 7.0);
    assert_eq!(function.call::<f64, _>((10.0, 20.0)).unwrap(), 0.0);
    assert_eq!(function.call::<f64, _>((0.0, -1.0)).unwrap(), 0.0);
}

#[test]
fn explicit_context_is_left_clean() {
    let name = module_name("Context");
    let result = parse_script(&name, &json!({"functions": {"count_above": count_above()}})).unwrap();
    let function = &result.functions[0];

    let mut context = ExecutionContext::new(&VmConfig {
        stack_size: 64,
        ..VmConfig::default()
    });
    let count: f64 = context.call(function, (5.0, 1.0)).unwrap();
    assert_eq!(count, 4.0);
    assert_eq!(context.top(), 0);
    assert_eq!(context.call_depth(), 0);

    // Outputs can also be read as values.
    let outputs: Vec<Value> = context
        .call(function, vec![Value::new(3.0f64).unwrap(), Value::new(0.0f64).unwrap()])
        .unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].get::<f64>(), Some(&3.0));
}

#[test]
fn small_stack_overflows_and_unwinds() {
    let name = module_name("Overflow");
    let result = parse_script(&name, &json!({"functions": {"count_above": count_above()}})).unwrap();

    let mut context = ExecutionContext::new(&VmConfig {
        stack_size: 6,
        ..VmConfig::default()
    });
    let error = context.call::<f64, _>(&result.functions[0], (5.0, 1.0)).unwrap_err();
    assert_eq!(error, ExecutionError::StackOverflow);
    assert_eq!(context.top(), 0);
    assert_eq!(context.call_depth(), 0);
}

#[test]
fn script_types_and_functions_share_a_module() {
    let name = module_name("Shapes");
    let mut parser = ScriptParser::new(&name).unwrap();
    parser.add_script(
        json!({
            "types": {
                "Label": {"properties": {"text": {"type": "Core.String"}, "size": {"type": "Core.Number"}}},
            },
        }),
        "types",
    );
    parser.add_script(
        json!({
            "functions": {
                "describe": {
                    "inputs": [number("size")],
                    "outputs": [{"name": "text", "type": "Core.String"}],
                    "actions": [
                        call("Core", "concat", json!({
                            "a": "size ",
                            "b": core("number_to_string", json!({"a": {"variable": "size"}})),
                        }), json!({"result": "text"})),
                        call("Core", "log", json!({"message": {"variable": "text"}}), json!({})),
                    ],
                },
            },
        }),
        "functions",
    );
    let (result, errors) = parser.parse();
    assert!(errors.is_empty(), "{errors:?}");

    let module = Module::get(&name).unwrap();
    let label = module.get_type("Label").unwrap();
    assert_eq!(result.types[0].id(), label.id());

    let mut value = Value::default_of(label).unwrap();
    let describe = module.get_function("describe").unwrap();
    let text: String = describe.call((2.0,)).unwrap();
    assert_eq!(text, "size 2");
    value.set_property("text", text).unwrap();
    value.set_property("size", 2.0f64).unwrap();

    let copy = value.clone();
    assert_eq!(copy.get_property::<String>("text").unwrap(), "size 2");
    assert_eq!(copy.get_property::<f64>("size").unwrap(), 2.0);
}

#[test]
fn unresolved_module_reports_action_path() {
    let errors = parse_script_function(&json!({
        "inputs": [],
        "outputs": [],
        "actions": [
            call("Core", "log", json!({"message": "ok"}), json!({})),
            call("Core", "log", json!({"message": "ok"}), json!({})),
            call("Core", "log", json!({"message": "ok"}), json!({})),
            call("Missing", "anything", json!({}), json!({})),
        ],
    }))
    .unwrap_err();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].path, "/actions/3");
    assert_eq!(errors[0].message, "Module Missing not found.");
}
