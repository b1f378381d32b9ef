//! Reflection registry: types, their memory layout, properties and bases.
//!
//! Every registered type lives in one slot of a process-wide table and is
//! addressed by a versioned [`TypeId`]. The owning [`Module`] keeps the
//! type alive; everything else refers to it through its id (checked for
//! liveness on every lookup) or through a shared `Arc<Type>`.
//!
//! Registration is expected to happen while modules load. Lookups from
//! several threads are fine as long as nobody registers or removes types at
//! the same time.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::any::{self, TypeId as NativeTypeId};
use core::fmt;
use core::mem;
use core::ptr;

use bitflags::bitflags;
use hashbrown::HashMap;
use serde_json::Value as JsonValue;
use spin::{Lazy, RwLock};

use crate::context::NativeCall;
use crate::error::{ExecutionError, RegistryError};
use crate::function::{Function, NativeFunction, ValueDeclaration};
use crate::module::Module;
use crate::type_id::{TypeId, NONE_ID};
use crate::value::NativeValue;

bitflags! {
    /// Properties of a type's memory representation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TypeFlags: u8 {
        /// Values can be copied with a plain byte copy.
        const TRIVIALLY_COPYABLE = 1 << 0;
        /// Values need no destructor call.
        const TRIVIALLY_DESTRUCTIBLE = 1 << 1;
    }
}

/// Size, alignment and triviality of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeMemoryLayout {
    pub size_in_bytes: usize,
    pub alignment_in_bytes: usize,
    pub flags: TypeFlags,
}

impl TypeMemoryLayout {
    /// Layout of a native Rust type.
    pub fn of<T>() -> Self {
        let mut flags = TypeFlags::empty();
        if !mem::needs_drop::<T>() {
            flags |= TypeFlags::TRIVIALLY_COPYABLE | TypeFlags::TRIVIALLY_DESTRUCTIBLE;
        }
        TypeMemoryLayout {
            size_in_bytes: mem::size_of::<T>(),
            alignment_in_bytes: mem::align_of::<T>(),
            flags,
        }
    }

    pub fn trivially_copyable(&self) -> bool {
        self.flags.contains(TypeFlags::TRIVIALLY_COPYABLE)
    }

    pub fn trivially_destructible(&self) -> bool {
        self.flags.contains(TypeFlags::TRIVIALLY_DESTRUCTIBLE)
    }

    /// Distance between two consecutive values in an array.
    pub fn stride(&self) -> usize {
        align_up(self.size_in_bytes, self.alignment_in_bytes.max(1))
    }
}

/// Round `value` up to the next multiple of `alignment` (a power of two).
pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// How a property is reached from a pointer to its owner.
#[derive(Debug, Clone)]
pub enum PropertyAccess {
    /// The property lives at a fixed byte offset inside the owner.
    Offset(usize),
    /// The property is computed by functions taking the owner's address.
    /// The getter has one `MemoryAddress` input and one output, the setter
    /// takes the address and the new value.
    Accessor {
        getter: Arc<Function>,
        setter: Option<Arc<Function>>,
    },
}

/// A named, typed member of a type.
#[derive(Debug, Clone)]
pub struct TypePropertyDescription {
    pub name: String,
    pub type_id: TypeId,
    pub access: PropertyAccess,
}

impl TypePropertyDescription {
    pub fn new(name: &str, type_id: TypeId, access: PropertyAccess) -> Self {
        TypePropertyDescription {
            name: String::from(name),
            type_id,
            access,
        }
    }

    /// A field of a native struct at `offset` (use `core::mem::offset_of!`).
    /// Returns `None` if the field's type is not registered.
    pub fn field<T: 'static>(name: &str, offset: usize) -> Option<Self> {
        let type_id = Type::id_of::<T>()?;
        Some(Self::new(name, type_id, PropertyAccess::Offset(offset)))
    }
}

/// A base type embedded at `offset` inside the derived type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeBaseDescription {
    pub base_type_id: TypeId,
    pub offset: usize,
}

/// Everything needed to register a type.
#[derive(Debug, Clone)]
pub struct TypeDescription {
    pub name: String,
    pub native_type_id: Option<NativeTypeId>,
    pub native_type_name: Option<&'static str>,
    pub memory_layout: TypeMemoryLayout,
    pub properties: Vec<TypePropertyDescription>,
    pub base_types: Vec<TypeBaseDescription>,
    pub construct_function: Option<Arc<Function>>,
    pub copy_function: Option<Arc<Function>>,
    pub destruct_function: Option<Arc<Function>>,
}

impl TypeDescription {
    /// Description of a type without native counterpart and without
    /// lifecycle functions; the caller fills those in.
    pub fn new(name: &str, memory_layout: TypeMemoryLayout) -> Self {
        TypeDescription {
            name: String::from(name),
            native_type_id: None,
            native_type_name: None,
            memory_layout,
            properties: Vec::new(),
            base_types: Vec::new(),
            construct_function: None,
            copy_function: None,
            destruct_function: None,
        }
    }

    /// Description of a native Rust type with generated construct, copy and
    /// destruct functions.
    pub fn for_native<T: NativeValue>(name: &str) -> Self {
        Self::for_native_with_address_type::<T>(name, crate::builtin::memory_address_type().id())
    }

    /// Same as [`TypeDescription::for_native`] with an explicit id for the
    /// address type, used while the core module bootstraps itself.
    pub(crate) fn for_native_with_address_type<T: NativeValue>(
        name: &str,
        address_type: TypeId,
    ) -> Self {
        let address = |name: &str| ValueDeclaration::new(name, address_type);
        let mut description = Self::new(name, TypeMemoryLayout::of::<T>());
        description.native_type_id = Some(NativeTypeId::of::<T>());
        description.native_type_name = Some(any::type_name::<T>());
        description.construct_function = Some(Function::make_native(
            construct_native::<T>,
            vec![address("pointer")],
            vec![],
        ));
        description.copy_function = Some(Function::make_native(
            copy_native::<T>,
            vec![address("destination"), address("source")],
            vec![],
        ));
        description.destruct_function = Some(Function::make_native(
            destruct_native::<T>,
            vec![address("pointer")],
            vec![],
        ));
        description
    }

    /// Declare `base` as a base type embedded at `offset`.
    pub fn with_base(mut self, base_type_id: TypeId, offset: usize) -> Self {
        self.base_types.push(TypeBaseDescription {
            base_type_id,
            offset,
        });
        self
    }

    /// Add a property.
    pub fn with_property(mut self, property: TypePropertyDescription) -> Self {
        self.properties.push(property);
        self
    }
}

fn construct_native<T: NativeValue>(call: &mut NativeCall<'_>) -> Result<(), ExecutionError> {
    let pointer = call.address(0)?;
    // SAFETY: lifecycle functions receive uninitialized memory laid out for T.
    unsafe { pointer.cast::<T>().write(T::default()) };
    Ok(())
}

fn copy_native<T: NativeValue>(call: &mut NativeCall<'_>) -> Result<(), ExecutionError> {
    let destination = call.address(0)?;
    let source = call.address(1)?;
    // SAFETY: source holds a live T, destination is uninitialized memory for T.
    unsafe {
        let value = (*source.cast::<T>()).clone();
        destination.cast::<T>().write(value);
    }
    Ok(())
}

fn destruct_native<T: NativeValue>(call: &mut NativeCall<'_>) -> Result<(), ExecutionError> {
    let pointer = call.address(0)?;
    // SAFETY: pointer holds a live T that is not used afterwards.
    unsafe { ptr::drop_in_place(pointer.cast::<T>()) };
    Ok(())
}

/// A registered type.
pub struct Type {
    id: TypeId,
    module: Weak<Module>,
    full_reference: String,
    description: TypeDescription,
}

impl Type {
    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.description.name
    }

    /// `"module.name"`.
    pub fn full_reference(&self) -> &str {
        &self.full_reference
    }

    /// The owning module, if it is still alive.
    pub fn module(&self) -> Option<Arc<Module>> {
        self.module.upgrade()
    }

    pub fn description(&self) -> &TypeDescription {
        &self.description
    }

    pub fn memory_layout(&self) -> &TypeMemoryLayout {
        &self.description.memory_layout
    }

    pub fn size_in_bytes(&self) -> usize {
        self.description.memory_layout.size_in_bytes
    }

    pub fn alignment_in_bytes(&self) -> usize {
        self.description.memory_layout.alignment_in_bytes
    }

    pub fn trivially_copyable(&self) -> bool {
        self.description.memory_layout.trivially_copyable()
    }

    pub fn trivially_destructible(&self) -> bool {
        self.description.memory_layout.trivially_destructible()
    }

    pub fn native_type_id(&self) -> Option<NativeTypeId> {
        self.description.native_type_id
    }

    /// Whether values of this type are native values of type `T`.
    pub fn is_native<T: 'static>(&self) -> bool {
        self.description.native_type_id == Some(NativeTypeId::of::<T>())
    }

    pub fn properties(&self) -> &[TypePropertyDescription] {
        &self.description.properties
    }

    pub fn property(&self, name: &str) -> Option<&TypePropertyDescription> {
        self.description.properties.iter().find(|p| p.name == name)
    }

    pub fn base_types(&self) -> &[TypeBaseDescription] {
        &self.description.base_types
    }

    pub fn construct_function(&self) -> Option<&Arc<Function>> {
        self.description.construct_function.as_ref()
    }

    pub fn copy_function(&self) -> Option<&Arc<Function>> {
        self.description.copy_function.as_ref()
    }

    pub fn destruct_function(&self) -> Option<&Arc<Function>> {
        self.description.destruct_function.as_ref()
    }

    /// True if `base` is this type or one of its transitive base types.
    pub fn is_derived_from(&self, base: TypeId) -> bool {
        self.base_offset(base).is_some()
    }

    /// [`Type::is_derived_from`] for the registered type of `B`.
    pub fn is_derived_from_native<B: 'static>(&self) -> bool {
        self.native_base_offset(NativeTypeId::of::<B>()).is_some()
    }

    /// Byte offset of the `base` subobject, if `base` is a (transitive) base.
    pub fn base_offset(&self, base: TypeId) -> Option<usize> {
        if self.id == base {
            return Some(0);
        }
        self.description.base_types.iter().find_map(|b| {
            let base_type = Type::get(b.base_type_id)?;
            base_type.base_offset(base).map(|offset| b.offset + offset)
        })
    }

    fn native_base_offset(&self, native: NativeTypeId) -> Option<usize> {
        if self.description.native_type_id == Some(native) {
            return Some(0);
        }
        self.description.base_types.iter().find_map(|b| {
            let base_type = Type::get(b.base_type_id)?;
            base_type
                .native_base_offset(native)
                .map(|offset| b.offset + offset)
        })
    }

    /// Adjust a pointer to a value of this type to its `B` subobject.
    /// Returns `None` unless this type derives from `B`.
    pub fn cast_to_base<B: 'static>(&self, pointer: *const u8) -> Option<*const B> {
        let offset = self.native_base_offset(NativeTypeId::of::<B>())?;
        Some(pointer.wrapping_add(offset).cast::<B>())
    }

    /// Look up a property on this type or, failing that, on its base types.
    /// Returns the type declaring it, the property index and the offset of
    /// that type's subobject.
    pub fn find_property(self: &Arc<Self>, name: &str) -> Option<(Arc<Type>, usize, usize)> {
        if let Some(index) = self.description.properties.iter().position(|p| p.name == name) {
            return Some((Arc::clone(self), index, 0));
        }
        self.description.base_types.iter().find_map(|b| {
            let base_type = Type::get(b.base_type_id)?;
            base_type
                .find_property(name)
                .map(|(owner, index, offset)| (owner, index, b.offset + offset))
        })
    }

    /// Serialize as `"module.name"`.
    pub fn serialize(&self) -> JsonValue {
        JsonValue::String(self.full_reference.clone())
    }

    /// Resolve `"module.name"` or `{"module": .., "name": ..}` against the
    /// live module registry. Never fails loudly; any problem yields `None`.
    pub fn deserialize(data: &JsonValue) -> Option<Arc<Type>> {
        let (module_name, type_name) = split_reference(data)?;
        Module::get(module_name)?.get_type(type_name)
    }
}

/// Split a `"module.name"` string or `{"module", "name"}` object.
pub(crate) fn split_reference(data: &JsonValue) -> Option<(&str, &str)> {
    match data {
        JsonValue::String(reference) => reference.split_once('.'),
        JsonValue::Object(object) => {
            let module = object.get("module")?.as_str()?;
            let name = object.get("name")?.as_str()?;
            Some((module, name))
        }
        _ => None,
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Type")
            .field("id", &self.id)
            .field("name", &self.full_reference)
            .field("layout", &self.description.memory_layout)
            .finish()
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_reference)
    }
}

/// Whether values of type `a` can be stored where `b` is declared: the same
/// type, or two registrations of the same native type.
pub fn compatible(a: TypeId, b: TypeId) -> bool {
    if a == b {
        return true;
    }
    match (Type::get(a), Type::get(b)) {
        (Some(a), Some(b)) => a.native_type_id().is_some() && a.native_type_id() == b.native_type_id(),
        _ => false,
    }
}

/// Display name of a type id for error messages.
pub(crate) fn type_name(id: TypeId) -> String {
    match Type::get(id) {
        Some(ty) => ty.full_reference().to_string(),
        None if id.is_none() => String::from("none"),
        None => format!("<stale {}>", id),
    }
}

// ============================================================================
// Global type table
// ============================================================================

struct Registration {
    id: TypeId,
    native_type_id: Option<NativeTypeId>,
    ty: Option<Arc<Type>>,
}

struct TypeTable {
    registrations: Vec<Registration>,
    /// First live registration of each native type.
    native_ids: HashMap<NativeTypeId, TypeId>,
}

impl TypeTable {
    fn new() -> Self {
        TypeTable {
            registrations: vec![Registration {
                id: NONE_ID,
                native_type_id: Some(NativeTypeId::of::<()>()),
                ty: None,
            }],
            native_ids: HashMap::new(),
        }
    }

    fn get(&self, id: TypeId) -> Option<&Arc<Type>> {
        let registration = self.registrations.get(id.index())?;
        if registration.id == id {
            registration.ty.as_ref()
        } else {
            None
        }
    }

    /// Reuse the first freed slot with a bumped generation, else append.
    fn next_id(&self) -> Result<TypeId, RegistryError> {
        let freed = self
            .registrations
            .iter()
            .skip(1)
            .find(|registration| registration.ty.is_none());
        match freed {
            Some(registration) => Ok(registration.id.next()),
            None if self.registrations.len() < TypeId::MAX_TYPES => {
                Ok(TypeId::new(self.registrations.len(), 0))
            }
            None => Err(RegistryError::TypeTableFull),
        }
    }

    fn insert(&mut self, ty: Arc<Type>) {
        let id = ty.id;
        let native_type_id = ty.description.native_type_id;
        if let Some(native) = native_type_id {
            self.native_ids.entry(native).or_insert(id);
        }
        let registration = Registration {
            id,
            native_type_id,
            ty: Some(ty),
        };
        if id.index() == self.registrations.len() {
            self.registrations.push(registration);
        } else {
            self.registrations[id.index()] = registration;
        }
    }

    fn remove(&mut self, id: TypeId) -> Result<Arc<Type>, RegistryError> {
        let registration = self
            .registrations
            .get_mut(id.index())
            .filter(|registration| registration.id == id && id.index() != 0)
            .ok_or(RegistryError::InvalidTypeId(id))?;
        let ty = registration.ty.take().ok_or(RegistryError::InvalidTypeId(id))?;

        if let Some(native) = registration.native_type_id {
            if self.native_ids.get(&native) == Some(&id) {
                self.native_ids.remove(&native);
                let replacement = self.registrations.iter().find(|r| {
                    r.ty.is_some() && r.native_type_id == Some(native)
                });
                if let Some(replacement) = replacement {
                    self.native_ids.insert(native, replacement.id);
                }
            }
        }
        Ok(ty)
    }
}

static TYPE_TABLE: Lazy<RwLock<TypeTable>> = Lazy::new(|| RwLock::new(TypeTable::new()));

impl Type {
    /// Register a type owned by `module`. Prefer [`Module::register_type`],
    /// which also checks for duplicate names.
    pub fn add(module: &Arc<Module>, description: TypeDescription) -> Result<Arc<Type>, RegistryError> {
        Self::add_with(module, |_| description)
    }

    /// Register a type whose description depends on its own id.
    pub(crate) fn add_with(
        module: &Arc<Module>,
        build: impl FnOnce(TypeId) -> TypeDescription,
    ) -> Result<Arc<Type>, RegistryError> {
        let mut table = TYPE_TABLE.write();
        let id = table.next_id()?;
        let description = build(id);
        let ty = Arc::new(Type {
            id,
            module: Arc::downgrade(module),
            full_reference: format!("{}.{}", module.name(), description.name),
            description,
        });
        table.insert(Arc::clone(&ty));
        log::debug!("[VM Types] Registered {} as {}", ty.full_reference, id);
        Ok(ty)
    }

    /// Remove a type from the table. The id (and every copy of it) stops
    /// resolving; `Arc<Type>` holders keep their record alive.
    pub fn remove(id: TypeId) -> Result<(), RegistryError> {
        let ty = TYPE_TABLE.write().remove(id)?;
        log::debug!("[VM Types] Removed {} ({})", ty.full_reference, id);
        Ok(())
    }

    /// The live type for `id`, if its generation still matches.
    pub fn get(id: TypeId) -> Option<Arc<Type>> {
        TYPE_TABLE.read().get(id).cloned()
    }

    /// The first registered type for the native type `T`.
    pub fn of<T: 'static>() -> Option<Arc<Type>> {
        crate::builtin::ensure_registered();
        let table = TYPE_TABLE.read();
        let id = *table.native_ids.get(&NativeTypeId::of::<T>())?;
        table.get(id).cloned()
    }

    /// Id of [`Type::of`].
    pub fn id_of<T: 'static>() -> Option<TypeId> {
        crate::builtin::ensure_registered();
        TYPE_TABLE.read().native_ids.get(&NativeTypeId::of::<T>()).copied()
    }
}
