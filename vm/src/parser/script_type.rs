//! Type definition parser.
//!
//! ```json
//! {
//!   "name": "Player",
//!   "properties": {
//!     "health": {"type": "Core.Number"},
//!     "name": {"type": "Core.String"}
//!   }
//! }
//! ```
//!
//! Properties are laid out in declaration order, each at the next offset
//! aligned for its type. The construct, copy and destruct functions of the
//! new type are script code that calls the matching function of every
//! property on the property's address.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use serde_json::Value as JsonValue;

use super::{pointer_token, ParseScriptError, ParseScriptErrors};
use crate::builtin;
use crate::error::RegistryError;
use crate::function::ValueDeclaration;
use crate::instruction::{Instruction, StackOffset};
use crate::module::Module;
use crate::types::{
    align_up, PropertyAccess, Type, TypeDescription, TypeFlags, TypeMemoryLayout,
    TypePropertyDescription,
};
use crate::value_storage::ValueStorage;

/// A parsed type: its description (without lifecycle functions) and the
/// code of its lifecycle functions.
#[derive(Debug)]
pub struct ParseScriptTypeResult {
    pub description: TypeDescription,
    /// Input: `pointer`.
    pub construct: Vec<Instruction>,
    /// Inputs: `destination`, `source`.
    pub copy: Vec<Instruction>,
    /// Input: `pointer`.
    pub destruct: Vec<Instruction>,
}

impl ParseScriptTypeResult {
    /// Register the lifecycle functions and then the type in `module`.
    ///
    /// The functions are named `<type>::construct`, `<type>::copy` and
    /// `<type>::destruct`.
    pub fn register(self, module: &Arc<Module>) -> Result<Arc<Type>, RegistryError> {
        let mut description = self.description;
        if module.get_type(&description.name).is_some() {
            return Err(RegistryError::DuplicateType {
                module: String::from(module.name()),
                name: description.name,
            });
        }

        let address = builtin::memory_address_type().id();
        let pointer = || vec![ValueDeclaration::new("pointer", address)];
        let name = |function: &str| format!("{}::{}", description.name, function);

        let construct =
            module.register_script_function(&name("construct"), pointer(), vec![], &self.construct, vec![])?;
        let copy = module.register_script_function(
            &name("copy"),
            vec![
                ValueDeclaration::new("destination", address),
                ValueDeclaration::new("source", address),
            ],
            vec![],
            &self.copy,
            vec![],
        )?;
        let destruct =
            module.register_script_function(&name("destruct"), pointer(), vec![], &self.destruct, vec![])?;

        description.construct_function = Some(construct);
        description.copy_function = Some(copy);
        description.destruct_function = Some(destruct);
        let ty = module.register_type(description)?;
        log::debug!(
            "[VM Parser] Registered script type {} ({} bytes)",
            ty.full_reference(),
            ty.size_in_bytes()
        );
        Ok(ty)
    }
}

/// Parse a type definition, failing with every recorded error.
pub fn parse_script_type(definition: &JsonValue) -> Result<ParseScriptTypeResult, ParseScriptErrors> {
    let mut errors = ParseScriptErrors::new();
    let Some(definition) = definition.as_object() else {
        errors.push(ParseScriptError::new("Type definition must be an object.", "/"));
        return Err(errors);
    };

    let name = match definition.get("name") {
        Some(JsonValue::String(name)) if !name.is_empty() => name.as_str(),
        _ => {
            errors.push(ParseScriptError::new("Invalid name", "/name"));
            ""
        }
    };

    let mut layout = TypeMemoryLayout {
        size_in_bytes: 0,
        alignment_in_bytes: ValueStorage::ALIGNMENT,
        flags: TypeFlags::all(),
    };
    let mut properties = Vec::new();
    let mut construct = Vec::new();
    let mut copy = Vec::new();
    let mut destruct = Vec::new();

    let empty = serde_json::Map::new();
    let property_definitions = match definition.get("properties") {
        None | Some(JsonValue::Null) => &empty,
        Some(JsonValue::Object(properties)) => properties,
        Some(_) => {
            errors.push(ParseScriptError::new("Properties must be an object.", "/properties"));
            &empty
        }
    };

    for (property_name, property_definition) in property_definitions {
        let path = format!("/properties/{}", pointer_token(property_name));
        let reference = property_definition.get("type");
        let Some(property_type) = reference.and_then(Type::deserialize) else {
            errors.push(ParseScriptError::new(
                format!(
                    "Invalid type for property {}: {}",
                    property_name,
                    reference.map(JsonValue::to_string).unwrap_or_default()
                ),
                path,
            ));
            continue;
        };
        let (Some(construct_function), Some(copy_function), Some(destruct_function)) = (
            property_type.construct_function(),
            property_type.copy_function(),
            property_type.destruct_function(),
        ) else {
            errors.push(ParseScriptError::new(
                format!("Type {} has no lifecycle functions.", property_type),
                path,
            ));
            continue;
        };

        let alignment = property_type.alignment_in_bytes().max(1);
        let offset = align_up(layout.size_in_bytes, alignment);
        let Ok(delta) = u32::try_from(offset) else {
            errors.push(ParseScriptError::new("Property offset out of range.", path));
            continue;
        };
        layout.alignment_in_bytes = layout.alignment_in_bytes.max(alignment);
        layout.flags &= property_type.memory_layout().flags;
        layout.size_in_bytes = offset + property_type.size_in_bytes();
        properties.push(TypePropertyDescription::new(
            property_name,
            property_type.id(),
            PropertyAccess::Offset(offset),
        ));

        let property_address = |position: u32| {
            [
                Instruction::PushStackValue {
                    position: StackOffset::Frame(position),
                },
                Instruction::OffsetAddress {
                    position: StackOffset::Top(-1),
                    delta,
                },
            ]
        };

        construct.extend(property_address(0));
        construct.push(Instruction::FunctionCall {
            handle: construct_function.handle(),
            input_count: 1,
            output_count: 0,
        });
        construct.push(Instruction::Pop { count: 1 });

        copy.extend(property_address(0));
        copy.extend(property_address(1));
        copy.push(Instruction::FunctionCall {
            handle: copy_function.handle(),
            input_count: 2,
            output_count: 0,
        });
        copy.push(Instruction::Pop { count: 2 });

        if !property_type.trivially_destructible() {
            // Destroyed in reverse declaration order.
            let mut instructions = property_address(0).to_vec();
            instructions.push(Instruction::FunctionCall {
                handle: destruct_function.handle(),
                input_count: 1,
                output_count: 0,
            });
            instructions.push(Instruction::Pop { count: 1 });
            destruct.splice(0..0, instructions);
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    layout.size_in_bytes = align_up(layout.size_in_bytes, layout.alignment_in_bytes);
    construct.push(Instruction::Return);
    copy.push(Instruction::Return);
    destruct.push(Instruction::Return);

    let mut description = TypeDescription::new(name, layout);
    description.properties = properties;
    log::debug!(
        "[VM Parser] Parsed type {}: {} properties, {} bytes",
        name,
        description.properties.len(),
        layout.size_in_bytes
    );
    Ok(ParseScriptTypeResult {
        description,
        construct,
        copy,
        destruct,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::register_test_module;
    use crate::value::Value;
    use serde_json::json;

    #[test]
    fn test_layout() {
        let result = parse_script_type(&json!({
            "name": "Mixed",
            "properties": {
                "flag": {"type": "Core.Boolean"},
                "amount": {"type": "Core.Number"},
                "other": {"type": "Core.Boolean"},
            },
        }))
        .unwrap();
        let description = &result.description;
        let offsets: Vec<(&str, usize)> = description
            .properties
            .iter()
            .map(|property| match property.access {
                PropertyAccess::Offset(offset) => (property.name.as_str(), offset),
                PropertyAccess::Accessor { .. } => panic!("unexpected accessor"),
            })
            .collect();
        assert_eq!(offsets, [("flag", 0), ("amount", 8), ("other", 16)]);
        assert_eq!(description.memory_layout.size_in_bytes, 24);
        assert_eq!(description.memory_layout.alignment_in_bytes, 8);
        assert_eq!(description.memory_layout.flags, TypeFlags::all());
        // Trivially destructible properties need no destruct calls.
        assert_eq!(result.destruct, [Instruction::Return]);
        assert_eq!(result.construct.len(), 3 * 4 + 1);
        assert_eq!(
            result.construct[4..6],
            [
                Instruction::PushStackValue {
                    position: StackOffset::Frame(0)
                },
                Instruction::OffsetAddress {
                    position: StackOffset::Top(-1),
                    delta: 8
                },
            ]
        );
    }

    #[test]
    fn test_empty_type() {
        let result = parse_script_type(&json!({"name": "Unit"})).unwrap();
        assert_eq!(result.description.memory_layout.size_in_bytes, 0);
        assert_eq!(result.description.memory_layout.alignment_in_bytes, ValueStorage::ALIGNMENT);
        assert_eq!(result.construct, [Instruction::Return]);
    }

    #[test]
    fn test_errors() {
        let errors = parse_script_type(&json!({
            "properties": {
                "a": {"type": "Core.Number"},
                "b": {"type": "Nowhere.Thing"},
                "c": {},
            },
        }))
        .unwrap_err();
        let paths: Vec<&str> = errors.iter().map(|error| error.path.as_str()).collect();
        assert_eq!(paths, ["/name", "/properties/b", "/properties/c"]);
        assert_eq!(
            errors[1].message,
            "Invalid type for property b: \"Nowhere.Thing\""
        );

        let errors = parse_script_type(&json!("Name")).unwrap_err();
        assert_eq!(errors, [ParseScriptError::new("Type definition must be an object.", "/")]);
    }

    #[test]
    fn test_registered_script_type_lifecycle() {
        let module = register_test_module();
        let ty = parse_script_type(&json!({
            "name": "Named",
            "properties": {
                "id": {"type": "Core.Number"},
                "label": {"type": "Core.String"},
            },
        }))
        .unwrap()
        .register(&module)
        .unwrap();

        assert!(!ty.trivially_copyable());
        assert!(!ty.trivially_destructible());
        assert!(module.get_function("Named::construct").is_some());
        assert!(Arc::ptr_eq(&module.get_type("Named").unwrap(), &ty));

        let mut value = Value::default_of(Arc::clone(&ty)).unwrap();
        assert_eq!(value.get_property::<f64>("id").unwrap(), 0.0);
        assert_eq!(value.get_property::<String>("label").unwrap(), "");

        value.set_property("id", 7.0f64).unwrap();
        value.set_property("label", String::from("seven")).unwrap();
        let copy = value.try_clone().unwrap();
        value.set_property("label", String::from("changed")).unwrap();

        assert_eq!(copy.get_property::<f64>("id").unwrap(), 7.0);
        assert_eq!(copy.get_property::<String>("label").unwrap(), "seven");
        assert_eq!(value.get_property::<String>("label").unwrap(), "changed");
        drop(value);
        drop(copy);

        let duplicate = parse_script_type(&json!({"name": "Named"})).unwrap().register(&module);
        assert!(matches!(duplicate, Err(RegistryError::DuplicateType { .. })));
    }

    #[test]
    fn test_nested_script_types() {
        let module = register_test_module();
        let inner = parse_script_type(&json!({
            "name": "Inner",
            "properties": {"text": {"type": "Core.String"}},
        }))
        .unwrap()
        .register(&module)
        .unwrap();
        let outer = parse_script_type(&json!({
            "name": "Outer",
            "properties": {
                "flag": {"type": "Core.Boolean"},
                "inner": {"type": {"module": module.name(), "name": "Inner"}},
            },
        }))
        .unwrap()
        .register(&module)
        .unwrap();
        assert_eq!(outer.size_in_bytes(), 8 + inner.size_in_bytes());

        let mut text = Value::default_of(Arc::clone(&inner)).unwrap();
        text.set_property("text", String::from("deep")).unwrap();
        let mut value = Value::default_of(outer).unwrap();
        value.set_property_value("inner", &text).unwrap();

        let copy = value.try_clone().unwrap();
        let inner_copy = copy.get_property_value("inner").unwrap();
        assert_eq!(inner_copy.get_property::<String>("text").unwrap(), "deep");
    }
}
