//! Shared helpers for unit tests.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::module::Module;

static NEXT_MODULE: AtomicUsize = AtomicUsize::new(0);

/// A module name no other test uses. Tests run in parallel against the
/// process-wide registry.
pub fn unique_module_name() -> String {
    format!("Test{}", NEXT_MODULE.fetch_add(1, Ordering::Relaxed))
}

pub fn register_test_module() -> Arc<Module> {
    Module::register(&unique_module_name()).unwrap()
}
