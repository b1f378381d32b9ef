//! Owned, typed values.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use core::any::{self, Any};
use core::fmt;
use core::mem::ManuallyDrop;

use crate::builtin::{self, MemoryAddress};
use crate::context::{self, ExecutionContext};
use crate::error::{ExecutionError, ValueError};
use crate::type_id::{TypeId, NONE_ID};
use crate::types::{self, PropertyAccess, Type};
use crate::value_storage::ValueStorage;

/// Native Rust types that can be registered and stored in values.
pub trait NativeValue: Any + Default + Clone + Send + Sync {}

impl<T> NativeValue for T where T: Any + Default + Clone + Send + Sync {}

/// A value together with its type.
pub struct Value {
    ty: Option<Arc<Type>>,
    storage: ValueStorage,
}

// SAFETY: values only ever hold `NativeValue`s (which are Send + Sync) or
// script types composed of them.
unsafe impl Send for Value {}
unsafe impl Sync for Value {}

impl Value {
    /// The empty value.
    pub const fn none() -> Self {
        Value {
            ty: None,
            storage: ValueStorage::new(),
        }
    }

    /// Wrap a native value using the registered type of `T`.
    pub fn new<T: NativeValue>(value: T) -> Result<Self, ValueError> {
        let ty = Type::of::<T>().ok_or(ValueError::UnregisteredType(any::type_name::<T>()))?;
        Ok(Self::with_type_unchecked(ty, value))
    }

    /// Wrap a native value as `ty`, which must be a registration of `T`.
    pub fn with_type<T: NativeValue>(ty: Arc<Type>, value: T) -> Result<Self, ValueError> {
        if !ty.is_native::<T>() {
            return Err(ValueError::TypeMismatch {
                expected: ty.full_reference().to_string(),
                got: String::from(any::type_name::<T>()),
            });
        }
        Ok(Self::with_type_unchecked(ty, value))
    }

    fn with_type_unchecked<T: NativeValue>(ty: Arc<Type>, value: T) -> Self {
        let mut storage = ValueStorage::new();
        // SAFETY: the storage is fresh and the caller checked that ty is T.
        unsafe { storage.store(&ty, value) };
        Value {
            ty: Some(ty),
            storage,
        }
    }

    /// A default-constructed value of `ty`.
    pub fn default_of(ty: Arc<Type>) -> Result<Self, ValueError> {
        let mut storage = ValueStorage::new();
        // SAFETY: the storage is fresh.
        context::with_current(|context| unsafe { storage.construct(&ty, context) })?;
        Ok(Value {
            ty: Some(ty),
            storage,
        })
    }

    /// A `Core.MemoryAddress` value.
    pub fn from_address(address: MemoryAddress) -> Self {
        Self::with_type_unchecked(builtin::memory_address_type(), address)
    }

    pub(crate) fn from_parts(ty: Option<Arc<Type>>, storage: ValueStorage) -> Self {
        Value { ty, storage }
    }

    pub(crate) fn into_parts(self) -> (Option<Arc<Type>>, ValueStorage) {
        let mut this = ManuallyDrop::new(self);
        let ty = this.ty.take();
        let mut storage = ValueStorage::new();
        // SAFETY: `storage` is fresh; `this` is never dropped.
        unsafe { storage.move_from(&mut this.storage) };
        (ty, storage)
    }

    pub fn is_none(&self) -> bool {
        self.ty.is_none() || self.storage.is_empty()
    }

    pub fn value_type(&self) -> Option<&Arc<Type>> {
        self.ty.as_ref()
    }

    /// Id of the value's type, [`NONE_ID`] for the empty value.
    pub fn type_id(&self) -> TypeId {
        self.ty.as_ref().map_or(NONE_ID, |ty| ty.id())
    }

    pub(crate) fn storage(&self) -> &ValueStorage {
        &self.storage
    }

    fn holds<T: 'static>(&self) -> bool {
        !self.storage.is_empty() && self.ty.as_ref().is_some_and(|ty| ty.is_native::<T>())
    }

    /// Borrow the native value if it is a `T`.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        if self.holds::<T>() {
            // SAFETY: checked above.
            Some(unsafe { self.storage.as_ref::<T>() })
        } else {
            None
        }
    }

    pub fn get_mut<T: 'static>(&mut self) -> Option<&mut T> {
        if self.holds::<T>() {
            // SAFETY: checked above.
            Some(unsafe { self.storage.as_mut::<T>() })
        } else {
            None
        }
    }

    /// Move the native value out, or give the value back if it is not a `T`.
    pub fn into_inner<T: 'static>(self) -> Result<T, Self> {
        if !self.holds::<T>() {
            return Err(self);
        }
        let (ty, mut storage) = self.into_parts();
        match ty {
            // SAFETY: checked above.
            Some(ty) => Ok(unsafe { storage.take::<T>(&ty) }),
            None => Err(Value::none()),
        }
    }

    /// Deep copy using the type's copy function.
    pub fn try_clone(&self) -> Result<Value, ExecutionError> {
        context::with_current(|context| self.clone_in(context))
    }

    pub(crate) fn clone_in(&self, context: &mut ExecutionContext) -> Result<Value, ExecutionError> {
        let mut storage = ValueStorage::new();
        if let Some(ty) = &self.ty {
            // SAFETY: the storage is fresh and holds nothing of another type.
            unsafe { storage.copy_from(ty, &self.storage, context)? };
        }
        Ok(Value {
            ty: self.ty.clone(),
            storage,
        })
    }

    /// Resolve `name` to its declaring type, the property and the address of
    /// the subobject owning it.
    fn locate_property(
        &self,
        name: &str,
    ) -> Result<(Arc<Type>, usize, *mut u8), ValueError> {
        let ty = self.ty.as_ref().ok_or(ValueError::Empty)?;
        if self.storage.is_empty() {
            return Err(ValueError::Empty);
        }
        let (owner, index, offset) = ty
            .find_property(name)
            .ok_or_else(|| ValueError::UnknownProperty(String::from(name)))?;
        let pointer = self.storage.data().cast_mut().wrapping_add(offset);
        Ok((owner, index, pointer))
    }

    /// Copy of the property `name`.
    pub fn get_property_value(&self, name: &str) -> Result<Value, ValueError> {
        let (owner, index, pointer) = self.locate_property(name)?;
        let property = &owner.properties()[index];
        match &property.access {
            PropertyAccess::Offset(offset) => {
                let property_type = Type::get(property.type_id)
                    .ok_or(ExecutionError::StaleType(property.type_id))?;
                let mut storage = ValueStorage::new();
                context::with_current(|context| {
                    // SAFETY: the property lives at `offset` inside a live owner.
                    unsafe {
                        storage.copy_from_raw(&property_type, pointer.wrapping_add(*offset), context)
                    }
                })?;
                Ok(Value::from_parts(Some(property_type), storage))
            }
            PropertyAccess::Accessor { getter, .. } => {
                let value: Value = getter.call((MemoryAddress(pointer),))?;
                Ok(value)
            }
        }
    }

    /// Native copy of the property `name`.
    pub fn get_property<T: NativeValue>(&self, name: &str) -> Result<T, ValueError> {
        self.get_property_value(name)?
            .into_inner::<T>()
            .map_err(|value| ValueError::TypeMismatch {
                expected: String::from(any::type_name::<T>()),
                got: types::type_name(value.type_id()),
            })
    }

    /// Replace the property `name` with a copy of `value`.
    pub fn set_property_value(&mut self, name: &str, value: &Value) -> Result<(), ValueError> {
        let (owner, index, pointer) = self.locate_property(name)?;
        let property = &owner.properties()[index];
        if !types::compatible(value.type_id(), property.type_id) {
            return Err(ValueError::TypeMismatch {
                expected: types::type_name(property.type_id),
                got: types::type_name(value.type_id()),
            });
        }

        match &property.access {
            PropertyAccess::Offset(offset) => {
                let property_type = Type::get(property.type_id)
                    .ok_or(ExecutionError::StaleType(property.type_id))?;
                let destination = pointer.wrapping_add(*offset);
                context::with_current(|context| -> Result<(), ExecutionError> {
                    let mut copy = ValueStorage::new();
                    // SAFETY: `copy` is fresh, `destination` holds a live
                    // value of the property type that is replaced in place.
                    unsafe {
                        copy.copy_from(&property_type, &value.storage, context)?;
                        if copy.is_empty() {
                            return Err(ExecutionError::EmptySlot);
                        }
                        if !property_type.trivially_destructible() {
                            if let Err(error) = context.destruct_at(&property_type, destination) {
                                copy.destruct(&property_type, context)?;
                                return Err(error);
                            }
                        }
                        copy.move_to_raw(&property_type, destination);
                    }
                    Ok(())
                })?;
                Ok(())
            }
            PropertyAccess::Accessor {
                setter: Some(setter),
                ..
            } => {
                let inputs = vec![Value::from_address(MemoryAddress(pointer)), value.try_clone()?];
                setter.call::<(), _>(inputs)?;
                Ok(())
            }
            PropertyAccess::Accessor { setter: None, .. } => {
                Err(ValueError::ReadOnlyProperty(String::from(name)))
            }
        }
    }

    /// Replace the property `name` with a native value.
    pub fn set_property<T: NativeValue>(&mut self, name: &str, value: T) -> Result<(), ValueError> {
        let (owner, index, _) = self.locate_property(name)?;
        let property_type_id = owner.properties()[index].type_id;
        let property_type =
            Type::get(property_type_id).ok_or(ExecutionError::StaleType(property_type_id))?;
        let value = Value::with_type(property_type, value)?;
        self.set_property_value(name, &value)
    }
}

impl Clone for Value {
    fn clone(&self) -> Self {
        self.try_clone().unwrap_or_else(|error| {
            log::warn!("[VM] Failed to copy value: {}", error);
            Value::none()
        })
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        if let Some(ty) = self.ty.take() {
            let storage = &mut self.storage;
            // SAFETY: the storage was filled with a value of `ty`.
            let result = context::with_current(|context| unsafe { storage.destruct(&ty, context) });
            if let Err(error) = result {
                log::warn!("[VM] Failed to destroy {} value: {}", ty.full_reference(), error);
            }
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ty {
            Some(ty) if !self.storage.is_empty() => write!(f, "Value({})", ty.full_reference()),
            _ => f.write_str("Value(none)"),
        }
    }
}
