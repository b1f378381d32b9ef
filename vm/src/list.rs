//! Dynamically typed, resizable array.
//!
//! Elements `[0, size)` are live values of the element type; the rest of the
//! buffer up to `capacity` is uninitialized. Values are relocatable by byte
//! copy, so growing the buffer moves elements without calling any function.

use alloc::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use core::any;
use core::fmt;
use core::ptr::{self, NonNull};

use crate::context::{self, ExecutionContext};
use crate::error::{ExecutionError, ValueError};
use crate::types::{self, Type, TypeMemoryLayout};
use crate::value::{NativeValue, Value};
use crate::value_storage::ValueStorage;

/// Index and size type of lists.
pub type SizeType = u32;

/// Minimum capacity after the first [`List::add`].
const MIN_GROWTH_CAPACITY: SizeType = 4;

pub struct List {
    element_type: Arc<Type>,
    memory_layout: TypeMemoryLayout,
    size: SizeType,
    capacity: SizeType,
    data: NonNull<u8>,
}

// SAFETY: the buffer is owned by the list; elements are Send + Sync values.
unsafe impl Send for List {}
unsafe impl Sync for List {}

impl List {
    /// An empty list of `element_type`.
    pub fn new(element_type: Arc<Type>) -> Self {
        let memory_layout = *element_type.memory_layout();
        List {
            data: dangling(&memory_layout),
            element_type,
            memory_layout,
            size: 0,
            capacity: 0,
        }
    }

    /// An empty list of the registered type of `T`.
    pub fn of<T: 'static>() -> Result<Self, ValueError> {
        let ty = Type::of::<T>().ok_or(ValueError::UnregisteredType(any::type_name::<T>()))?;
        Ok(Self::new(ty))
    }

    pub fn element_type(&self) -> &Arc<Type> {
        &self.element_type
    }

    pub fn size(&self) -> SizeType {
        self.size
    }

    pub fn capacity(&self) -> SizeType {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn stride(&self) -> usize {
        self.memory_layout.stride()
    }

    fn element_ptr(&self, index: SizeType) -> *mut u8 {
        self.data.as_ptr().wrapping_add(index as usize * self.stride())
    }

    fn buffer_layout(&self, capacity: SizeType) -> Result<Layout, ValueError> {
        let bytes = self
            .stride()
            .checked_mul(capacity as usize)
            .ok_or(ValueError::CapacityOverflow)?;
        Layout::from_size_align(bytes, self.memory_layout.alignment_in_bytes.max(1))
            .map_err(|_| ValueError::CapacityOverflow)
    }

    fn check_index(&self, index: SizeType) -> Result<(), ValueError> {
        if index < self.size {
            Ok(())
        } else {
            Err(ValueError::IndexOutOfBounds {
                index,
                size: self.size,
            })
        }
    }

    fn check_native<T: 'static>(&self) -> Result<(), ValueError> {
        if self.element_type.is_native::<T>() {
            Ok(())
        } else {
            Err(ValueError::TypeMismatch {
                expected: self.element_type.full_reference().to_string(),
                got: String::from(any::type_name::<T>()),
            })
        }
    }

    /// Grow the buffer to hold exactly `capacity` elements. Never shrinks.
    pub fn reserve(&mut self, capacity: SizeType) -> Result<(), ValueError> {
        if capacity <= self.capacity {
            return Ok(());
        }
        let layout = self.buffer_layout(capacity)?;
        let data = if layout.size() == 0 {
            dangling(&self.memory_layout)
        } else {
            // SAFETY: the layout has a non-zero size.
            let pointer = unsafe { alloc(layout) };
            NonNull::new(pointer).unwrap_or_else(|| handle_alloc_error(layout))
        };

        // SAFETY: both buffers hold at least `size` elements and do not
        // overlap; the old buffer is freed without dropping the moved values.
        unsafe {
            ptr::copy_nonoverlapping(
                self.data.as_ptr(),
                data.as_ptr(),
                self.size as usize * self.stride(),
            );
            self.free_buffer();
        }
        self.data = data;
        self.capacity = capacity;
        Ok(())
    }

    /// Release the buffer without touching its elements.
    unsafe fn free_buffer(&mut self) {
        if let Ok(layout) = self.buffer_layout(self.capacity) {
            if layout.size() > 0 {
                dealloc(self.data.as_ptr(), layout);
            }
        }
        self.data = dangling(&self.memory_layout);
        self.capacity = 0;
    }

    /// Change the number of elements, default-constructing new ones and
    /// destroying dropped ones.
    pub fn resize(&mut self, size: SizeType) -> Result<(), ValueError> {
        if size > self.capacity {
            self.reserve(size)?;
        }
        context::with_current(|context| self.resize_in(size, context))?;
        Ok(())
    }

    fn resize_in(&mut self, size: SizeType, context: &mut ExecutionContext) -> Result<(), ExecutionError> {
        let element_type = Arc::clone(&self.element_type);
        while self.size < size {
            context.construct_at(&element_type, self.element_ptr(self.size))?;
            self.size += 1;
        }
        let mut result = Ok(());
        while self.size > size {
            self.size -= 1;
            if !element_type.trivially_destructible() {
                let destroyed = context.destruct_at(&element_type, self.element_ptr(self.size));
                if result.is_ok() {
                    result = destroyed;
                }
            }
        }
        result
    }

    /// Destroy all elements. The capacity is kept.
    pub fn clear(&mut self) -> Result<(), ValueError> {
        self.resize(0)
    }

    fn grow_for_one(&mut self) -> Result<(), ValueError> {
        if self.size == self.capacity {
            let capacity = self
                .capacity
                .checked_mul(2)
                .ok_or(ValueError::CapacityOverflow)?
                .max(MIN_GROWTH_CAPACITY);
            self.reserve(capacity)?;
        }
        Ok(())
    }

    /// Borrow element `index` as a `T`.
    pub fn get<T: 'static>(&self, index: SizeType) -> Option<&T> {
        if index >= self.size || !self.element_type.is_native::<T>() {
            return None;
        }
        // SAFETY: live element of type T.
        Some(unsafe { &*self.element_ptr(index).cast::<T>() })
    }

    pub fn get_mut<T: 'static>(&mut self, index: SizeType) -> Option<&mut T> {
        if index >= self.size || !self.element_type.is_native::<T>() {
            return None;
        }
        // SAFETY: live element of type T.
        Some(unsafe { &mut *self.element_ptr(index).cast::<T>() })
    }

    /// Replace element `index`.
    pub fn set<T: NativeValue>(&mut self, index: SizeType, value: T) -> Result<(), ValueError> {
        self.check_native::<T>()?;
        self.check_index(index)?;
        // SAFETY: live element of type T; the assignment drops the old value.
        unsafe { *self.element_ptr(index).cast::<T>() = value };
        Ok(())
    }

    /// Append a native value.
    pub fn add<T: NativeValue>(&mut self, value: T) -> Result<(), ValueError> {
        self.check_native::<T>()?;
        self.grow_for_one()?;
        // SAFETY: the slot past the end is uninitialized memory for T.
        unsafe { self.element_ptr(self.size).cast::<T>().write(value) };
        self.size += 1;
        Ok(())
    }

    fn check_value(&self, value: &Value) -> Result<(), ValueError> {
        if value.is_none() {
            return Err(ValueError::Empty);
        }
        if !types::compatible(value.type_id(), self.element_type.id()) {
            return Err(ValueError::TypeMismatch {
                expected: self.element_type.full_reference().to_string(),
                got: types::type_name(value.type_id()),
            });
        }
        Ok(())
    }

    /// Copy of element `index`.
    pub fn get_value(&self, index: SizeType) -> Result<Value, ValueError> {
        self.check_index(index)?;
        let mut storage = ValueStorage::new();
        let source = self.element_ptr(index);
        context::with_current(|context| {
            // SAFETY: live element of the element type.
            unsafe { storage.copy_from_raw(&self.element_type, source, context) }
        })?;
        Ok(Value::from_parts(Some(Arc::clone(&self.element_type)), storage))
    }

    /// Replace element `index` with a copy of `value`.
    pub fn set_value(&mut self, index: SizeType, value: &Value) -> Result<(), ValueError> {
        self.check_value(value)?;
        self.check_index(index)?;
        let element_type = Arc::clone(&self.element_type);
        let destination = self.element_ptr(index);
        context::with_current(|context| -> Result<(), ExecutionError> {
            let mut copy = ValueStorage::new();
            // SAFETY: `destination` is a live element that is replaced in place.
            unsafe {
                copy.copy_from(&element_type, value.storage(), context)?;
                if !element_type.trivially_destructible() {
                    if let Err(error) = context.destruct_at(&element_type, destination) {
                        copy.destruct(&element_type, context)?;
                        return Err(error);
                    }
                }
                copy.move_to_raw(&element_type, destination);
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Append a copy of `value`.
    pub fn add_value(&mut self, value: &Value) -> Result<(), ValueError> {
        self.check_value(value)?;
        self.grow_for_one()?;
        let element_type = Arc::clone(&self.element_type);
        let destination = self.element_ptr(self.size);
        context::with_current(|context| -> Result<(), ExecutionError> {
            let mut copy = ValueStorage::new();
            // SAFETY: the slot past the end is uninitialized.
            unsafe {
                copy.copy_from(&element_type, value.storage(), context)?;
                copy.move_to_raw(&element_type, destination);
            }
            Ok(())
        })?;
        self.size += 1;
        Ok(())
    }

    /// Destroy element `index` and shift the following elements down.
    pub fn remove(&mut self, index: SizeType) -> Result<(), ValueError> {
        self.check_index(index)?;
        let pointer = self.element_ptr(index);
        let result = if self.element_type.trivially_destructible() {
            Ok(())
        } else {
            let element_type = Arc::clone(&self.element_type);
            context::with_current(|context| context.destruct_at(&element_type, pointer))
        };
        let tail = (self.size - index - 1) as usize * self.stride();
        // SAFETY: moves the live tail over the destroyed element.
        unsafe { ptr::copy(self.element_ptr(index + 1), pointer, tail) };
        self.size -= 1;
        result.map_err(ValueError::from)
    }

    /// Deep copy of the list.
    pub fn try_clone(&self) -> Result<List, ValueError> {
        let mut copy = List::new(Arc::clone(&self.element_type));
        copy.reserve(self.size)?;
        context::with_current(|context| -> Result<(), ExecutionError> {
            let element_type = &self.element_type;
            for index in 0..self.size {
                let source = self.element_ptr(index);
                let destination = copy.element_ptr(index);
                if element_type.trivially_copyable() {
                    // SAFETY: distinct buffers, both sized for `index`.
                    unsafe {
                        ptr::copy_nonoverlapping(source, destination, element_type.size_in_bytes())
                    };
                } else {
                    context.copy_at(element_type, destination, source)?;
                }
                copy.size += 1;
            }
            Ok(())
        })?;
        Ok(copy)
    }
}

impl Clone for List {
    fn clone(&self) -> Self {
        self.try_clone().unwrap_or_else(|error| {
            log::warn!("[VM] Failed to copy list: {}", error);
            List::new(Arc::clone(&self.element_type))
        })
    }
}

impl Drop for List {
    fn drop(&mut self) {
        if let Err(error) = self.clear() {
            log::warn!("[VM] Failed to destroy list elements: {}", error);
        }
        // SAFETY: all elements were destroyed above.
        unsafe { self.free_buffer() };
    }
}

impl fmt::Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("List")
            .field("element_type", &self.element_type.full_reference())
            .field("size", &self.size)
            .field("capacity", &self.capacity)
            .finish()
    }
}

fn dangling(layout: &TypeMemoryLayout) -> NonNull<u8> {
    NonNull::new(layout.alignment_in_bytes.max(1) as *mut u8).unwrap_or(NonNull::dangling())
}
