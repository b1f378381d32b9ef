//! JSON script parsers.
//!
//! Scripts are JSON documents describing functions (inputs, outputs and a
//! list of actions) and types (named properties). The parsers lower them to
//! [`Instruction`](crate::instruction::Instruction)s and type descriptions.
//!
//! Parsing never stops at the first problem: every error is recorded with
//! the JSON pointer of the offending element and parsing continues, so an
//! editor can show all of them at once.
//!
//! - `function`: function definitions and their actions
//! - `script_type`: type definitions, layout and lifecycle code
//! - `script`: whole script documents registered into a module

pub mod function;
pub mod script;
pub mod script_type;

use alloc::borrow::Cow;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use serde::{Deserialize, Serialize};

pub use function::{parse_script_function, ParseScriptFunctionResult, ScriptFunctionParser};
pub use script::{parse_script, ParseScriptResult, ScriptParser};
pub use script_type::{parse_script_type, ParseScriptTypeResult};

/// A parse error with the JSON pointer of the element that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseScriptError {
    pub message: String,
    pub path: String,
}

impl ParseScriptError {
    pub fn new(message: impl Into<String>, path: impl Into<String>) -> Self {
        ParseScriptError {
            message: message.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for ParseScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// All errors of one parse.
pub type ParseScriptErrors = Vec<ParseScriptError>;

/// Escape `name` for use as a JSON pointer segment.
pub(crate) fn pointer_token(name: &str) -> Cow<'_, str> {
    if name.contains(['~', '/']) {
        Cow::Owned(name.replace('~', "~0").replace('/', "~1"))
    } else {
        Cow::Borrowed(name)
    }
}
