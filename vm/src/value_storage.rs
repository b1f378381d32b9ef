//! Type-erased storage for a single value.
//!
//! Small trivially copyable values are stored inline; everything else lives
//! in a heap allocation laid out for the value's type. The storage does not
//! know its own type: every operation takes the [`Type`] the caller tracks
//! alongside it. Passing a different type than the one the value was
//! created with is undefined behaviour (debug builds assert against it).

use alloc::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use core::mem::MaybeUninit;
use core::ptr::{self, NonNull};

use bitflags::bitflags;

use crate::context::ExecutionContext;
use crate::error::ExecutionError;
use crate::types::{Type, TypeMemoryLayout};

#[cfg(debug_assertions)]
use crate::type_id::{TypeId, NONE_ID};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct StorageFlags: u8 {
        /// A live value is stored.
        const OCCUPIED = 1 << 0;
        /// The value lives in a heap allocation.
        const HEAP_ALLOCATED = 1 << 1;
    }
}

#[repr(C, align(8))]
#[derive(Clone, Copy)]
struct InlineBuffer([MaybeUninit<u8>; ValueStorage::INLINE_SIZE]);

#[repr(C)]
union StorageData {
    inline: InlineBuffer,
    heap: NonNull<u8>,
}

/// Raw storage for one value.
pub struct ValueStorage {
    data: StorageData,
    flags: StorageFlags,
    #[cfg(debug_assertions)]
    type_tag: TypeId,
}

impl ValueStorage {
    /// Bytes available for inline values.
    pub const INLINE_SIZE: usize = 16;
    /// Alignment of the inline buffer.
    pub const ALIGNMENT: usize = 8;

    /// An empty storage.
    pub const fn new() -> Self {
        ValueStorage {
            data: StorageData {
                inline: InlineBuffer([MaybeUninit::uninit(); Self::INLINE_SIZE]),
            },
            flags: StorageFlags::empty(),
            #[cfg(debug_assertions)]
            type_tag: NONE_ID,
        }
    }

    /// Whether values with `layout` are stored inline.
    pub fn is_stored_inline(layout: &TypeMemoryLayout) -> bool {
        layout.size_in_bytes <= Self::INLINE_SIZE
            && layout.alignment_in_bytes <= Self::ALIGNMENT
            && layout.trivially_copyable()
    }

    pub fn is_empty(&self) -> bool {
        !self.flags.contains(StorageFlags::OCCUPIED)
    }

    pub fn is_heap_allocated(&self) -> bool {
        self.flags.contains(StorageFlags::HEAP_ALLOCATED)
    }

    /// Pointer to the stored bytes. Only meaningful while occupied.
    pub fn data(&self) -> *const u8 {
        if self.is_heap_allocated() {
            // SAFETY: the heap variant is active while HEAP_ALLOCATED is set.
            unsafe { self.data.heap.as_ptr() }
        } else {
            // SAFETY: taking the address of the inline buffer reads nothing.
            unsafe { ptr::addr_of!(self.data.inline).cast::<u8>() }
        }
    }

    /// Mutable pointer to the stored bytes. Only meaningful while occupied.
    pub fn data_mut(&mut self) -> *mut u8 {
        if self.is_heap_allocated() {
            // SAFETY: see `data`.
            unsafe { self.data.heap.as_ptr() }
        } else {
            // SAFETY: see `data`.
            unsafe { ptr::addr_of_mut!(self.data.inline).cast::<u8>() }
        }
    }

    #[cfg(debug_assertions)]
    fn check_type(&self, ty: &Type) {
        debug_assert!(
            crate::types::compatible(self.type_tag, ty.id()),
            "value storage accessed as {} but holds {}",
            ty.full_reference(),
            crate::types::type_name(self.type_tag)
        );
    }

    #[cfg(not(debug_assertions))]
    fn check_type(&self, _ty: &Type) {}

    #[cfg(debug_assertions)]
    fn set_type(&mut self, ty: Option<&Type>) {
        self.type_tag = ty.map_or(NONE_ID, |ty| ty.id());
    }

    #[cfg(not(debug_assertions))]
    fn set_type(&mut self, _ty: Option<&Type>) {}

    /// Reserve memory for a value of `ty` and return a pointer to it.
    fn allocate(&mut self, ty: &Type) -> *mut u8 {
        debug_assert!(self.is_empty());
        let layout = ty.memory_layout();
        if Self::is_stored_inline(layout) {
            self.flags = StorageFlags::empty();
            return self.data_mut();
        }

        let pointer = if layout.size_in_bytes == 0 {
            dangling(layout.alignment_in_bytes)
        } else {
            let heap_layout = heap_layout(layout);
            // SAFETY: the layout has a non-zero size.
            let pointer = unsafe { alloc(heap_layout) };
            match NonNull::new(pointer) {
                Some(pointer) => pointer,
                None => handle_alloc_error(heap_layout),
            }
        };
        self.data.heap = pointer;
        self.flags = StorageFlags::HEAP_ALLOCATED;
        pointer.as_ptr()
    }

    fn deallocate(&mut self, ty: &Type) {
        if self.is_heap_allocated() {
            let layout = ty.memory_layout();
            if layout.size_in_bytes > 0 {
                // SAFETY: allocated in `allocate` with the same layout.
                unsafe { dealloc(self.data.heap.as_ptr(), heap_layout(layout)) };
            }
        }
        self.flags = StorageFlags::empty();
        self.set_type(None);
    }

    fn mark_occupied(&mut self, ty: &Type) {
        self.flags |= StorageFlags::OCCUPIED;
        self.set_type(Some(ty));
    }

    /// Default-construct a value of `ty` by running its construct function.
    ///
    /// # Safety
    ///
    /// The storage must be empty.
    pub unsafe fn construct(
        &mut self,
        ty: &Type,
        context: &mut ExecutionContext,
    ) -> Result<(), ExecutionError> {
        let pointer = self.allocate(ty);
        if let Err(error) = context.construct_at(ty, pointer) {
            self.deallocate(ty);
            return Err(error);
        }
        self.mark_occupied(ty);
        Ok(())
    }

    /// Move a native value into the storage.
    ///
    /// # Safety
    ///
    /// The storage must be empty and `ty` must describe `T`.
    pub unsafe fn store<T>(&mut self, ty: &Type, value: T) {
        debug_assert_eq!(ty.size_in_bytes(), core::mem::size_of::<T>());
        let pointer = self.allocate(ty);
        pointer.cast::<T>().write(value);
        self.mark_occupied(ty);
    }

    /// Destroy the stored value. Does nothing if the storage is empty.
    ///
    /// # Safety
    ///
    /// `ty` must be the type the value was stored with.
    pub unsafe fn destruct(
        &mut self,
        ty: &Type,
        context: &mut ExecutionContext,
    ) -> Result<(), ExecutionError> {
        if self.is_empty() {
            return Ok(());
        }
        self.check_type(ty);
        let result = if ty.trivially_destructible() {
            Ok(())
        } else {
            context.destruct_at(ty, self.data_mut())
        };
        self.deallocate(ty);
        result
    }

    /// Copy-construct from the value stored in `other`. If `other` is empty
    /// this storage stays empty.
    ///
    /// # Safety
    ///
    /// This storage must be empty and `ty` must be the type of `other`.
    pub unsafe fn copy_from(
        &mut self,
        ty: &Type,
        other: &ValueStorage,
        context: &mut ExecutionContext,
    ) -> Result<(), ExecutionError> {
        if other.is_empty() {
            return Ok(());
        }
        other.check_type(ty);
        self.copy_from_raw(ty, other.data(), context)
    }

    /// Copy-construct from a live value of `ty` at `source`.
    ///
    /// # Safety
    ///
    /// This storage must be empty and `source` must point to a live value of
    /// `ty` that is not inside this storage.
    pub unsafe fn copy_from_raw(
        &mut self,
        ty: &Type,
        source: *const u8,
        context: &mut ExecutionContext,
    ) -> Result<(), ExecutionError> {
        let destination = self.allocate(ty);
        if ty.trivially_copyable() {
            ptr::copy_nonoverlapping(source, destination, ty.size_in_bytes());
        } else if let Err(error) = context.copy_at(ty, destination, source.cast_mut()) {
            self.deallocate(ty);
            return Err(error);
        }
        self.mark_occupied(ty);
        Ok(())
    }

    /// Move the value out of `other`, leaving it empty. Values are always
    /// relocatable by a byte copy, so no function is invoked.
    ///
    /// # Safety
    ///
    /// This storage must be empty.
    pub unsafe fn move_from(&mut self, other: &mut ValueStorage) {
        debug_assert!(self.is_empty());
        ptr::copy_nonoverlapping(&other.data, &mut self.data, 1);
        self.flags = other.flags;
        #[cfg(debug_assertions)]
        {
            self.type_tag = other.type_tag;
        }
        other.flags = StorageFlags::empty();
        other.set_type(None);
    }

    /// Relocate the stored value to `destination` without running any
    /// lifecycle function, leaving the storage empty.
    ///
    /// # Safety
    ///
    /// The storage must hold a live value of `ty` and `destination` must be
    /// uninitialized memory laid out for `ty`.
    pub unsafe fn move_to_raw(&mut self, ty: &Type, destination: *mut u8) {
        debug_assert!(!self.is_empty());
        self.check_type(ty);
        ptr::copy_nonoverlapping(self.data(), destination, ty.size_in_bytes());
        self.deallocate(ty);
    }

    /// Borrow the stored value.
    ///
    /// # Safety
    ///
    /// The storage must hold a live `T`.
    pub unsafe fn as_ref<T>(&self) -> &T {
        debug_assert!(!self.is_empty());
        &*self.data().cast::<T>()
    }

    /// Mutably borrow the stored value.
    ///
    /// # Safety
    ///
    /// The storage must hold a live `T`.
    pub unsafe fn as_mut<T>(&mut self) -> &mut T {
        debug_assert!(!self.is_empty());
        &mut *self.data_mut().cast::<T>()
    }

    /// Move the stored value out, leaving the storage empty.
    ///
    /// # Safety
    ///
    /// The storage must hold a live `T` described by `ty`.
    pub unsafe fn take<T>(&mut self, ty: &Type) -> T {
        debug_assert!(!self.is_empty());
        self.check_type(ty);
        let value = self.data().cast::<T>().read();
        self.deallocate(ty);
        value
    }
}

impl Default for ValueStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ValueStorage {
    fn drop(&mut self) {
        if !self.is_empty() {
            // Without its type the value can be neither destroyed nor freed.
            log::warn!("[VM] Value storage dropped while occupied; leaking value");
        }
    }
}

fn heap_layout(layout: &TypeMemoryLayout) -> Layout {
    // Registered layouts always have a power-of-two alignment.
    Layout::from_size_align(layout.size_in_bytes, layout.alignment_in_bytes.max(1))
        .unwrap_or(Layout::new::<u8>())
}

fn dangling(alignment: usize) -> NonNull<u8> {
    NonNull::new(alignment.max(1) as *mut u8).unwrap_or(NonNull::dangling())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::register_test_module;
    use crate::types::{TypeDescription, TypeFlags};
    use alloc::string::String;
    use alloc::sync::Arc;

    fn layout(size: usize, alignment: usize, flags: TypeFlags) -> TypeMemoryLayout {
        TypeMemoryLayout {
            size_in_bytes: size,
            alignment_in_bytes: alignment,
            flags,
        }
    }

    #[test]
    fn test_inline_rule() {
        assert!(ValueStorage::is_stored_inline(&layout(8, 8, TypeFlags::all())));
        assert!(ValueStorage::is_stored_inline(&layout(16, 8, TypeFlags::all())));
        assert!(!ValueStorage::is_stored_inline(&layout(17, 8, TypeFlags::all())));
        assert!(!ValueStorage::is_stored_inline(&layout(16, 16, TypeFlags::all())));
        assert!(!ValueStorage::is_stored_inline(&layout(
            8,
            8,
            TypeFlags::TRIVIALLY_DESTRUCTIBLE
        )));
    }

    #[test]
    fn test_store_inline_and_take() {
        let ty = Type::of::<f64>().unwrap();
        let mut storage = ValueStorage::new();
        assert!(storage.is_empty());
        unsafe {
            storage.store(&ty, 4.5f64);
            assert!(!storage.is_empty());
            assert!(!storage.is_heap_allocated());
            assert_eq!(*storage.as_ref::<f64>(), 4.5);
            *storage.as_mut::<f64>() = 5.5;
            assert_eq!(storage.take::<f64>(&ty), 5.5);
        }
        assert!(storage.is_empty());
    }

    #[test]
    fn test_non_trivial_goes_to_heap_and_destructs() {
        let ty = Type::of::<String>().unwrap();
        let mut storage = ValueStorage::new();
        let mut context = ExecutionContext::default();
        unsafe {
            storage.store(&ty, String::from("hello"));
            assert!(storage.is_heap_allocated());
            assert_eq!(storage.as_ref::<String>(), "hello");
            storage.destruct(&ty, &mut context).unwrap();
        }
        assert!(storage.is_empty());
    }

    #[test]
    fn test_copy_runs_copy_function_for_non_trivial() {
        #[derive(Default, Clone)]
        struct Shared(Arc<u32>);

        let module = register_test_module();
        let ty = module
            .register_type(TypeDescription::for_native::<Shared>("Shared"))
            .unwrap();
        let payload = Arc::new(7u32);
        let mut context = ExecutionContext::default();

        let mut source = ValueStorage::new();
        let mut copy = ValueStorage::new();
        unsafe {
            source.store(&ty, Shared(Arc::clone(&payload)));
            copy.copy_from(&ty, &source, &mut context).unwrap();
            assert_eq!(Arc::strong_count(&payload), 3);
            assert_eq!(*copy.as_ref::<Shared>().0, 7);

            copy.destruct(&ty, &mut context).unwrap();
            assert_eq!(Arc::strong_count(&payload), 2);
            source.destruct(&ty, &mut context).unwrap();
        }
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn test_construct_uses_default() {
        let ty = Type::of::<String>().unwrap();
        let mut storage = ValueStorage::new();
        let mut context = ExecutionContext::default();
        unsafe {
            storage.construct(&ty, &mut context).unwrap();
            assert_eq!(storage.as_ref::<String>(), "");
            storage.destruct(&ty, &mut context).unwrap();
        }
    }

    #[test]
    fn test_move_leaves_source_empty() {
        let ty = Type::of::<String>().unwrap();
        let mut source = ValueStorage::new();
        let mut target = ValueStorage::new();
        let mut context = ExecutionContext::default();
        unsafe {
            source.store(&ty, String::from("moved"));
            target.move_from(&mut source);
            assert!(source.is_empty());
            assert_eq!(target.as_ref::<String>(), "moved");
            target.destruct(&ty, &mut context).unwrap();
        }
    }

    #[test]
    fn test_destruct_empty_is_noop() {
        let ty = Type::of::<String>().unwrap();
        let mut storage = ValueStorage::new();
        let mut context = ExecutionContext::default();
        unsafe { storage.destruct(&ty, &mut context).unwrap() };
        assert!(storage.is_empty());
    }
}
