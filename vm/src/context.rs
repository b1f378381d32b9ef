//! Execution context: value stack, call frames and the dispatch loop.
//!
//! The value stack is a fixed-capacity array of typed slots that never
//! reallocates, so addresses of values on the stack stay valid while nested
//! calls (for example a script copy function) push more values. Calls lay
//! out their region as `[outputs][inputs]` followed, for script functions,
//! by their locals.
//!
//! Any error aborts the in-flight call chain: the context truncates its
//! frames and destroys every value pushed since the top-level call started.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any;
use core::ptr::{self, NonNull};

use crate::builtin::{self, MemoryAddress};
use crate::code;
use crate::error::{CallError, ExecutionError};
use crate::function::{Function, FunctionHandle, ValueDeclaration};
use crate::instruction::{Instruction, StackOffset};
use crate::types::{self, Type};
use crate::value::{NativeValue, Value};
use crate::value_storage::ValueStorage;
use crate::VmConfig;

/// Stack size of the fallback context used when the thread's context is
/// already in use.
const TEMPORARY_STACK_SIZE: usize = 128;

/// Fallback contexts kept per thread for reuse.
#[cfg(feature = "std")]
const SPARE_CONTEXTS: usize = 4;

struct StackSlot {
    ty: Option<Arc<Type>>,
    storage: ValueStorage,
}

impl StackSlot {
    const fn empty() -> Self {
        StackSlot {
            ty: None,
            storage: ValueStorage::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Native,
    Script,
}

/// Activation record of one call.
#[derive(Debug, Clone, Copy)]
struct ExecutionFrame {
    kind: FrameKind,
    /// Next instruction (script frames only).
    ip: usize,
    /// First slot of the call region.
    base: usize,
    /// Outputs plus inputs.
    argument_count: usize,
}

/// A value stack with its call frames.
pub struct ExecutionContext {
    slots: NonNull<StackSlot>,
    capacity: usize,
    top: usize,
    frames: Vec<ExecutionFrame>,
    max_call_depth: usize,
}

impl ExecutionContext {
    /// Create a context with the stack size and call depth of `config`.
    pub fn new(config: &VmConfig) -> Self {
        let slots: Box<[StackSlot]> = (0..config.stack_size).map(|_| StackSlot::empty()).collect();
        let capacity = slots.len();
        // SAFETY: Box::into_raw never returns null.
        let slots = unsafe { NonNull::new_unchecked(Box::into_raw(slots).cast::<StackSlot>()) };
        ExecutionContext {
            slots,
            capacity,
            top: 0,
            frames: Vec::new(),
            max_call_depth: config.max_call_depth,
        }
    }

    /// Number of value slots.
    pub fn stack_size(&self) -> usize {
        self.capacity
    }

    /// Number of occupied value slots.
    pub fn top(&self) -> usize {
        self.top
    }

    /// Number of active calls on this context.
    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    fn push_frame(&mut self, frame: ExecutionFrame) {
        self.frames.push(frame);
        nesting::add(1);
    }

    fn pop_frame(&mut self) {
        if self.frames.pop().is_some() {
            nesting::sub(1);
        }
    }

    fn truncate_frames(&mut self, depth: usize) {
        if self.frames.len() > depth {
            nesting::sub(self.frames.len() - depth);
            self.frames.truncate(depth);
        }
    }

    fn slot(&self, index: usize) -> &StackSlot {
        debug_assert!(index < self.capacity);
        // SAFETY: all slots are initialized and index is below capacity.
        unsafe { &*self.slots.as_ptr().add(index) }
    }

    fn slot_mut(&mut self, index: usize) -> &mut StackSlot {
        debug_assert!(index < self.capacity);
        // SAFETY: see `slot`.
        unsafe { &mut *self.slots.as_ptr().add(index) }
    }

    fn frame_base(&self) -> usize {
        self.frames.last().map_or(0, |frame| frame.base)
    }

    /// Lowest slot the current frame may pop.
    fn floor(&self) -> usize {
        self.frames
            .last()
            .map_or(0, |frame| frame.base + frame.argument_count)
    }

    fn resolve(&self, position: StackOffset) -> Result<usize, ExecutionError> {
        match position {
            StackOffset::Frame(position) => {
                let index = self.frame_base() + position as usize;
                if index < self.top {
                    Ok(index)
                } else {
                    Err(ExecutionError::StackUnderflow)
                }
            }
            StackOffset::Top(offset) => {
                let depth = offset.unsigned_abs() as usize;
                if offset >= 0 || depth > self.top - self.frame_base() {
                    Err(ExecutionError::StackUnderflow)
                } else {
                    Ok(self.top - depth)
                }
            }
        }
    }

    // ========================================================================
    // Stack operations
    // ========================================================================

    /// Push `count` empty slots.
    pub fn push_empty(&mut self, count: usize) -> Result<(), ExecutionError> {
        if count > self.capacity - self.top {
            return Err(ExecutionError::StackOverflow);
        }
        self.top += count;
        Ok(())
    }

    /// Push a native value using the registered type of `T`.
    pub fn push<T: NativeValue>(&mut self, value: T) -> Result<(), ExecutionError> {
        let ty = Type::of::<T>().ok_or(ExecutionError::UnregisteredType(any::type_name::<T>()))?;
        self.push_typed(ty, value)
    }

    fn push_typed<T: NativeValue>(&mut self, ty: Arc<Type>, value: T) -> Result<(), ExecutionError> {
        if self.top >= self.capacity {
            return Err(ExecutionError::StackOverflow);
        }
        let mut storage = ValueStorage::new();
        // SAFETY: fresh storage; callers pass the registered type of T.
        unsafe { storage.store(&ty, value) };
        self.push_storage(Some(ty), storage)
    }

    /// Push a copy of `value`.
    pub fn push_value(&mut self, value: &Value) -> Result<(), ExecutionError> {
        if self.top >= self.capacity {
            return Err(ExecutionError::StackOverflow);
        }
        let copy = value.clone_in(self)?;
        let (ty, storage) = copy.into_parts();
        self.push_storage(ty, storage)
    }

    fn push_storage(
        &mut self,
        ty: Option<Arc<Type>>,
        mut storage: ValueStorage,
    ) -> Result<(), ExecutionError> {
        if self.top >= self.capacity {
            self.destroy(ty, storage)?;
            return Err(ExecutionError::StackOverflow);
        }
        let ty = if storage.is_empty() { None } else { ty };
        let index = self.top;
        let slot = self.slot_mut(index);
        slot.ty = ty;
        // SAFETY: slots above the top are always empty.
        unsafe { slot.storage.move_from(&mut storage) };
        self.top += 1;
        Ok(())
    }

    /// Push a copy of the slot at `index`.
    fn push_copy_of(&mut self, index: usize) -> Result<(), ExecutionError> {
        if self.top >= self.capacity {
            return Err(ExecutionError::StackOverflow);
        }
        let (ty, storage) = self.copy_slot(index)?;
        self.push_storage(ty, storage)
    }

    /// Copy of the value at `index`. Slots never move, so the source stays
    /// valid while the copy function pushes above the top.
    fn copy_slot(&mut self, index: usize) -> Result<(Option<Arc<Type>>, ValueStorage), ExecutionError> {
        let slot = self.slot(index);
        let mut storage = ValueStorage::new();
        let ty = match &slot.ty {
            Some(ty) if !slot.storage.is_empty() => Arc::clone(ty),
            _ => return Ok((None, storage)),
        };
        let source = slot.storage.data();
        // SAFETY: `source` is a live value of `ty` outside `storage`.
        unsafe { storage.copy_from_raw(&ty, source, self)? };
        Ok((Some(ty), storage))
    }

    fn take_slot(&mut self, index: usize) -> (Option<Arc<Type>>, ValueStorage) {
        let slot = self.slot_mut(index);
        let ty = slot.ty.take();
        let mut storage = ValueStorage::new();
        // SAFETY: `storage` is fresh.
        unsafe { storage.move_from(&mut slot.storage) };
        (ty, storage)
    }

    /// Destroy the value in `slot` and store `storage` in its place.
    fn replace_slot(
        &mut self,
        index: usize,
        ty: Option<Arc<Type>>,
        mut storage: ValueStorage,
    ) -> Result<(), ExecutionError> {
        let (old_ty, old_storage) = self.take_slot(index);
        let ty = if storage.is_empty() { None } else { ty };
        let slot = self.slot_mut(index);
        slot.ty = ty;
        // SAFETY: the slot was emptied by `take_slot`.
        unsafe { slot.storage.move_from(&mut storage) };
        self.destroy(old_ty, old_storage)
    }

    fn destroy(
        &mut self,
        ty: Option<Arc<Type>>,
        mut storage: ValueStorage,
    ) -> Result<(), ExecutionError> {
        match ty {
            // SAFETY: slots keep their storage and type together.
            Some(ty) => unsafe { storage.destruct(&ty, self) },
            None => Ok(()),
        }
    }

    fn pop_one(&mut self) -> Result<(), ExecutionError> {
        let index = self.top - 1;
        let (ty, storage) = self.take_slot(index);
        self.top = index;
        self.destroy(ty, storage)
    }

    /// Destroy and pop the top `count` values of the current frame.
    pub fn pop(&mut self, count: usize) -> Result<(), ExecutionError> {
        if count > self.top - self.floor() {
            return Err(ExecutionError::StackUnderflow);
        }
        let mut result = Ok(());
        for _ in 0..count {
            let popped = self.pop_one();
            if result.is_ok() {
                result = popped;
            }
        }
        result
    }

    /// Pop everything above `top`, ignoring frame boundaries.
    fn unwind(&mut self, top: usize) {
        while self.top > top {
            if let Err(error) = self.pop_one() {
                log::warn!("[VM] Error while unwinding the value stack: {}", error);
            }
        }
    }

    /// Borrow the native value at `position`.
    pub fn get<T: 'static>(&self, position: StackOffset) -> Result<&T, ExecutionError> {
        self.read_slot::<T>(self.resolve(position)?)
    }

    /// Copy of the value at `position`.
    pub fn get_value(&mut self, position: StackOffset) -> Result<Value, ExecutionError> {
        let index = self.resolve(position)?;
        let (ty, storage) = self.copy_slot(index)?;
        Ok(Value::from_parts(ty, storage))
    }

    fn read_slot<T: 'static>(&self, index: usize) -> Result<&T, ExecutionError> {
        let slot = self.slot(index);
        match &slot.ty {
            Some(ty) if ty.is_native::<T>() && !slot.storage.is_empty() => {
                // SAFETY: the slot holds a live T.
                Ok(unsafe { slot.storage.as_ref::<T>() })
            }
            Some(ty) => Err(ExecutionError::TypeMismatch {
                expected: String::from(any::type_name::<T>()),
                got: ty.full_reference().to_string(),
            }),
            None => Err(ExecutionError::EmptySlot),
        }
    }

    /// Move the native value out of slot `index`, leaving it empty.
    fn take_native<T: 'static>(&mut self, index: usize) -> Result<T, ExecutionError> {
        let (ty, mut storage) = self.take_slot(index);
        match ty {
            Some(ty) if ty.is_native::<T>() && !storage.is_empty() => {
                // SAFETY: the slot held a live T.
                Ok(unsafe { storage.take::<T>(&ty) })
            }
            Some(ty) => {
                let got = ty.full_reference().to_string();
                self.destroy(Some(ty), storage)?;
                Err(ExecutionError::TypeMismatch {
                    expected: String::from(any::type_name::<T>()),
                    got,
                })
            }
            None => Err(ExecutionError::EmptySlot),
        }
    }

    // ========================================================================
    // Lifecycle helpers
    // ========================================================================

    /// Run the construct function of `ty` on uninitialized memory.
    pub(crate) fn construct_at(&mut self, ty: &Type, pointer: *mut u8) -> Result<(), ExecutionError> {
        let function = lifecycle_function(ty, ty.construct_function(), "construct")?;
        self.call_with_addresses(&function, &[pointer])
    }

    /// Run the copy function of `ty`.
    pub(crate) fn copy_at(
        &mut self,
        ty: &Type,
        destination: *mut u8,
        source: *mut u8,
    ) -> Result<(), ExecutionError> {
        let function = lifecycle_function(ty, ty.copy_function(), "copy")?;
        self.call_with_addresses(&function, &[destination, source])
    }

    /// Run the destruct function of `ty`.
    pub(crate) fn destruct_at(&mut self, ty: &Type, pointer: *mut u8) -> Result<(), ExecutionError> {
        let function = lifecycle_function(ty, ty.destruct_function(), "destruct")?;
        self.call_with_addresses(&function, &[pointer])
    }

    fn call_with_addresses(
        &mut self,
        function: &Function,
        addresses: &[*mut u8],
    ) -> Result<(), ExecutionError> {
        let address_type = builtin::memory_address_type();
        self.guarded(|context| {
            for &address in addresses {
                context.push_typed(Arc::clone(&address_type), MemoryAddress(address))?;
            }
            context.invoke(function.handle(), addresses.len(), 0)?;
            context.pop(addresses.len())
        })
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Call `function` with checked inputs and read its outputs.
    ///
    /// ```ignore
    /// let (sum,): (f64,) = context.call(&add, (1.0, 2.0))?;
    /// ```
    pub fn call<O: CallOutput, I: CallInputs>(
        &mut self,
        function: &Function,
        inputs: I,
    ) -> Result<O, ExecutionError> {
        let declared = function.inputs().len();
        if inputs.len() != declared {
            return Err(CallError::ArityMismatch {
                expected: declared,
                got: inputs.len(),
            }
            .into());
        }
        O::check(function.outputs())?;

        let output_count = function.outputs().len();
        self.guarded(|context| {
            let base = context.top;
            context.push_empty(output_count)?;
            inputs.push_inputs(context, function.inputs())?;
            context.invoke(function.handle(), declared, output_count)?;
            let outputs = O::read(context, base, function.outputs())?;
            context.pop(context.top - base)?;
            Ok(outputs)
        })
    }

    /// Call a bare handle without signature checks. Returns all
    /// `output_count` outputs, empty values for outputs never written.
    pub fn call_handle(
        &mut self,
        handle: FunctionHandle,
        inputs: Vec<Value>,
        output_count: usize,
    ) -> Result<Vec<Value>, ExecutionError> {
        let input_count = inputs.len();
        self.guarded(|context| {
            let base = context.top;
            context.push_empty(output_count)?;
            for input in inputs {
                let (ty, storage) = input.into_parts();
                context.push_storage(ty, storage)?;
            }
            context.invoke(handle, input_count, output_count)?;
            let outputs = (0..output_count)
                .map(|index| {
                    let (ty, storage) = context.take_slot(base + index);
                    Value::from_parts(ty, storage)
                })
                .collect();
            context.pop(context.top - base)?;
            Ok(outputs)
        })
    }

    /// Run `body`; on error restore the frames and stack to their state on
    /// entry.
    fn guarded<R>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<R, ExecutionError>,
    ) -> Result<R, ExecutionError> {
        let entry_top = self.top;
        let entry_depth = self.frames.len();
        let result = body(self);
        if let Err(error) = &result {
            log::debug!("[VM] Call aborted: {}", error);
            self.truncate_frames(entry_depth);
            self.unwind(entry_top);
        }
        result
    }

    /// Call a function whose outputs and inputs are the top slots and wait
    /// for it to return.
    fn invoke(
        &mut self,
        handle: FunctionHandle,
        input_count: usize,
        output_count: usize,
    ) -> Result<(), ExecutionError> {
        let depth = self.frames.len();
        if self.enter(handle, input_count, output_count)? {
            self.run(depth)?;
        }
        Ok(())
    }

    /// Start a call. Native functions run to completion; for script
    /// functions a frame is pushed and `true` returned.
    fn enter(
        &mut self,
        handle: FunctionHandle,
        input_count: usize,
        output_count: usize,
    ) -> Result<bool, ExecutionError> {
        let argument_count = input_count + output_count;
        if argument_count > self.top - self.floor() {
            return Err(ExecutionError::StackUnderflow);
        }
        // Calls through nested contexts of this thread count as well.
        if nesting::depth() >= self.max_call_depth {
            return Err(ExecutionError::CallStackOverflow);
        }
        let base = self.top - argument_count;

        match handle {
            FunctionHandle::Native(function) => {
                self.push_frame(ExecutionFrame {
                    kind: FrameKind::Native,
                    ip: 0,
                    base,
                    argument_count,
                });
                let result = function(&mut NativeCall {
                    context: self,
                    base,
                    input_count,
                    output_count,
                });
                // Drop whatever the function left above its arguments.
                if self.top > base + argument_count {
                    self.unwind(base + argument_count);
                }
                self.pop_frame();
                result.map(|()| false)
            }
            FunctionHandle::Script(offset) => {
                self.push_frame(ExecutionFrame {
                    kind: FrameKind::Script,
                    ip: offset,
                    base,
                    argument_count,
                });
                Ok(true)
            }
        }
    }

    /// Dispatch instructions until the frame stack is back at `entry_depth`.
    fn run(&mut self, entry_depth: usize) -> Result<(), ExecutionError> {
        while self.frames.len() > entry_depth {
            let frame = self.frames.len() - 1;
            let ip = self.frames[frame].ip;
            let instruction = code::fetch(ip).ok_or(ExecutionError::InvalidInstructionPointer(ip))?;
            self.frames[frame].ip = ip + 1;
            log::trace!("[VM] {:>6}: {}", ip, instruction);
            self.execute(ip, instruction)?;
        }
        Ok(())
    }

    fn execute(&mut self, ip: usize, instruction: Instruction) -> Result<(), ExecutionError> {
        match instruction {
            Instruction::Push { count } => self.push_empty(count as usize),
            Instruction::PushConstant { index } => {
                let index = index as usize;
                let constant = code::constant(index).ok_or(ExecutionError::InvalidConstant(index))?;
                self.push_value(&constant)
            }
            Instruction::PushStackValue { position } => {
                let index = self.resolve(position)?;
                self.push_copy_of(index)
            }
            Instruction::AssignStackValue {
                source,
                destination,
            } => {
                let source = self.resolve(source)?;
                let destination = self.resolve(destination)?;
                if source == destination {
                    return Ok(());
                }
                let (ty, storage) = self.copy_slot(source)?;
                self.replace_slot(destination, ty, storage)
            }
            Instruction::CopyTrivialValue {
                source,
                destination,
            } => {
                let source = self.resolve(source)?;
                let destination = self.resolve(destination)?;
                if self.slot(source).ty.as_ref().is_some_and(|ty| !ty.trivially_copyable()) {
                    return Err(ExecutionError::TypeMismatch {
                        expected: String::from("trivially copyable value"),
                        got: self.slot_type_name(source),
                    });
                }
                if source == destination {
                    return Ok(());
                }
                let (ty, storage) = self.copy_slot(source)?;
                self.replace_slot(destination, ty, storage)
            }
            Instruction::Pop { count } => self.pop(count as usize),
            Instruction::FunctionCall {
                handle,
                input_count,
                output_count,
            } => self
                .enter(handle, input_count as usize, output_count as usize)
                .map(|_| ()),
            Instruction::Jump { offset } => self.jump(ip, offset),
            Instruction::JumpIfFalse { offset } => {
                if self.pop_condition()? {
                    Ok(())
                } else {
                    self.jump(ip, offset)
                }
            }
            Instruction::Return => self.return_from_script(),
            Instruction::OffsetAddress { position, delta } => {
                let index = self.resolve(position)?;
                if self.read_slot::<MemoryAddress>(index).is_err() {
                    return Err(ExecutionError::TypeMismatch {
                        expected: String::from("Core.MemoryAddress"),
                        got: self.slot_type_name(index),
                    });
                }
                // SAFETY: the slot holds a MemoryAddress.
                let address = unsafe { self.slot_mut(index).storage.as_mut::<MemoryAddress>() };
                *address = address.offset(delta as usize);
                Ok(())
            }
        }
    }

    fn slot_type_name(&self, index: usize) -> String {
        match &self.slot(index).ty {
            Some(ty) => ty.full_reference().to_string(),
            None => String::from("none"),
        }
    }

    fn jump(&mut self, ip: usize, offset: i32) -> Result<(), ExecutionError> {
        let target = ip as i64 + i64::from(offset);
        let target =
            usize::try_from(target).map_err(|_| ExecutionError::InvalidInstructionPointer(ip))?;
        if let Some(frame) = self.frames.last_mut() {
            frame.ip = target;
        }
        Ok(())
    }

    fn pop_condition(&mut self) -> Result<bool, ExecutionError> {
        if self.top <= self.floor() {
            return Err(ExecutionError::StackUnderflow);
        }
        let condition = *self.read_slot::<bool>(self.top - 1)?;
        self.pop_one()?;
        Ok(condition)
    }

    fn return_from_script(&mut self) -> Result<(), ExecutionError> {
        let frame = *self.frames.last().ok_or(ExecutionError::StackUnderflow)?;
        debug_assert_eq!(frame.kind, FrameKind::Script);
        let locals_end = frame.base + frame.argument_count;
        if self.top > locals_end {
            self.pop(self.top - locals_end)?;
        }
        self.pop_frame();
        Ok(())
    }
}

fn lifecycle_function(
    ty: &Type,
    function: Option<&Arc<Function>>,
    name: &'static str,
) -> Result<Arc<Function>, ExecutionError> {
    function
        .cloned()
        .ok_or_else(|| ExecutionError::MissingLifecycleFunction {
            type_name: ty.full_reference().to_string(),
            function: name,
        })
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(&VmConfig::default())
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.truncate_frames(0);
        self.unwind(0);
        let slots = ptr::slice_from_raw_parts_mut(self.slots.as_ptr(), self.capacity);
        // SAFETY: allocated as a boxed slice of `capacity` slots in `new`.
        drop(unsafe { Box::from_raw(slots) });
    }
}

// ============================================================================
// Native call interface
// ============================================================================

/// Access to the arguments of a native function call.
pub struct NativeCall<'a> {
    context: &'a mut ExecutionContext,
    base: usize,
    input_count: usize,
    output_count: usize,
}

impl<'a> NativeCall<'a> {
    pub fn input_count(&self) -> usize {
        self.input_count
    }

    pub fn output_count(&self) -> usize {
        self.output_count
    }

    fn input_slot(&self, index: usize) -> Result<usize, ExecutionError> {
        if index < self.input_count {
            Ok(self.base + self.output_count + index)
        } else {
            Err(ExecutionError::StackUnderflow)
        }
    }

    fn output_slot(&self, index: usize) -> Result<usize, ExecutionError> {
        if index < self.output_count {
            Ok(self.base + index)
        } else {
            Err(ExecutionError::StackUnderflow)
        }
    }

    /// Type of input `index`, `None` if it is empty.
    pub fn input_type(&self, index: usize) -> Option<&Arc<Type>> {
        let slot = self.input_slot(index).ok()?;
        self.context.slot(slot).ty.as_ref()
    }

    /// Borrow input `index` as a `T`.
    pub fn input<T: 'static>(&self, index: usize) -> Result<&T, ExecutionError> {
        self.context.read_slot::<T>(self.input_slot(index)?)
    }

    /// Copy of input `index`.
    pub fn input_value(&mut self, index: usize) -> Result<Value, ExecutionError> {
        let slot = self.input_slot(index)?;
        let (ty, storage) = self.context.copy_slot(slot)?;
        Ok(Value::from_parts(ty, storage))
    }

    /// The raw pointer held by a `MemoryAddress` input.
    pub fn address(&self, index: usize) -> Result<*mut u8, ExecutionError> {
        Ok(self.input::<MemoryAddress>(index)?.as_ptr())
    }

    /// Store a native value in output `index`.
    pub fn set_output<T: NativeValue>(&mut self, index: usize, value: T) -> Result<(), ExecutionError> {
        let slot = self.output_slot(index)?;
        let ty = match &self.context.slot(slot).ty {
            Some(ty) if ty.is_native::<T>() => Arc::clone(ty),
            _ => Type::of::<T>().ok_or(ExecutionError::UnregisteredType(any::type_name::<T>()))?,
        };
        let mut storage = ValueStorage::new();
        // SAFETY: fresh storage; ty describes T.
        unsafe { storage.store(&ty, value) };
        self.context.replace_slot(slot, Some(ty), storage)
    }

    /// Store a value in output `index`.
    pub fn set_output_value(&mut self, index: usize, value: Value) -> Result<(), ExecutionError> {
        let slot = self.output_slot(index)?;
        let (ty, storage) = value.into_parts();
        self.context.replace_slot(slot, ty, storage)
    }

    /// The execution context, for nested calls.
    pub fn context(&mut self) -> &mut ExecutionContext {
        &mut *self.context
    }
}

// ============================================================================
// Typed call boundary
// ============================================================================

/// Arguments accepted by [`ExecutionContext::call`].
pub trait CallInputs {
    fn len(&self) -> usize;

    /// Push the inputs, checking each against its declaration.
    fn push_inputs(
        self,
        context: &mut ExecutionContext,
        declarations: &[ValueDeclaration],
    ) -> Result<(), ExecutionError>;
}

impl ExecutionContext {
    fn push_declared<T: NativeValue>(
        &mut self,
        index: usize,
        declaration: &ValueDeclaration,
        value: T,
    ) -> Result<(), ExecutionError> {
        let ty = Type::get(declaration.type_id)
            .ok_or(ExecutionError::StaleType(declaration.type_id))?;
        if !ty.is_native::<T>() {
            return Err(CallError::InputTypeMismatch {
                index,
                expected: ty.full_reference().to_string(),
                got: String::from(any::type_name::<T>()),
            }
            .into());
        }
        self.push_typed(ty, value)
    }

    fn push_declared_value(
        &mut self,
        index: usize,
        declaration: &ValueDeclaration,
        value: Value,
    ) -> Result<(), ExecutionError> {
        if !types::compatible(value.type_id(), declaration.type_id) {
            return Err(CallError::InputTypeMismatch {
                index,
                expected: types::type_name(declaration.type_id),
                got: types::type_name(value.type_id()),
            }
            .into());
        }
        let (ty, storage) = value.into_parts();
        self.push_storage(ty, storage)
    }
}

impl CallInputs for () {
    fn len(&self) -> usize {
        0
    }

    fn push_inputs(
        self,
        _context: &mut ExecutionContext,
        _declarations: &[ValueDeclaration],
    ) -> Result<(), ExecutionError> {
        Ok(())
    }
}

impl CallInputs for Vec<Value> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn push_inputs(
        self,
        context: &mut ExecutionContext,
        declarations: &[ValueDeclaration],
    ) -> Result<(), ExecutionError> {
        for (index, (value, declaration)) in self.into_iter().zip(declarations).enumerate() {
            context.push_declared_value(index, declaration, value)?;
        }
        Ok(())
    }
}

impl CallInputs for &[Value] {
    fn len(&self) -> usize {
        <[Value]>::len(self)
    }

    fn push_inputs(
        self,
        context: &mut ExecutionContext,
        declarations: &[ValueDeclaration],
    ) -> Result<(), ExecutionError> {
        for (index, (value, declaration)) in self.iter().zip(declarations).enumerate() {
            let copy = value.clone_in(context)?;
            context.push_declared_value(index, declaration, copy)?;
        }
        Ok(())
    }
}

macro_rules! impl_call_inputs {
    ($($name:ident : $index:tt),+) => {
        impl<$($name: NativeValue),+> CallInputs for ($($name,)+) {
            fn len(&self) -> usize {
                [$($index),+].len()
            }

            fn push_inputs(
                self,
                context: &mut ExecutionContext,
                declarations: &[ValueDeclaration],
            ) -> Result<(), ExecutionError> {
                $(context.push_declared($index, &declarations[$index], self.$index)?;)+
                Ok(())
            }
        }
    };
}

impl_call_inputs!(A: 0);
impl_call_inputs!(A: 0, B: 1);
impl_call_inputs!(A: 0, B: 1, C: 2);
impl_call_inputs!(A: 0, B: 1, C: 2, D: 3);

/// Results readable from [`ExecutionContext::call`].
pub trait CallOutput: Sized {
    /// Check the declared outputs before the call starts.
    fn check(declarations: &[ValueDeclaration]) -> Result<(), CallError>;

    /// Read the outputs, starting at slot `base`.
    fn read(
        context: &mut ExecutionContext,
        base: usize,
        declarations: &[ValueDeclaration],
    ) -> Result<Self, ExecutionError>;
}

fn check_output_count(declarations: &[ValueDeclaration], count: usize) -> Result<(), CallError> {
    if declarations.len() < count {
        return Err(CallError::OutputArityMismatch {
            expected: declarations.len(),
            got: count,
        });
    }
    Ok(())
}

fn check_native_output<T: 'static>(
    declarations: &[ValueDeclaration],
    index: usize,
) -> Result<(), CallError> {
    let declared = declarations[index].type_id;
    match Type::get(declared) {
        Some(ty) if ty.is_native::<T>() => Ok(()),
        _ => Err(CallError::OutputTypeMismatch {
            index,
            expected: types::type_name(declared),
            got: String::from(any::type_name::<T>()),
        }),
    }
}

impl CallOutput for () {
    fn check(_declarations: &[ValueDeclaration]) -> Result<(), CallError> {
        Ok(())
    }

    fn read(
        _context: &mut ExecutionContext,
        _base: usize,
        _declarations: &[ValueDeclaration],
    ) -> Result<Self, ExecutionError> {
        Ok(())
    }
}

/// The first output.
impl CallOutput for Value {
    fn check(declarations: &[ValueDeclaration]) -> Result<(), CallError> {
        check_output_count(declarations, 1)
    }

    fn read(
        context: &mut ExecutionContext,
        base: usize,
        _declarations: &[ValueDeclaration],
    ) -> Result<Self, ExecutionError> {
        let (ty, storage) = context.take_slot(base);
        Ok(Value::from_parts(ty, storage))
    }
}

/// All outputs.
impl CallOutput for Vec<Value> {
    fn check(_declarations: &[ValueDeclaration]) -> Result<(), CallError> {
        Ok(())
    }

    fn read(
        context: &mut ExecutionContext,
        base: usize,
        declarations: &[ValueDeclaration],
    ) -> Result<Self, ExecutionError> {
        Ok((0..declarations.len())
            .map(|index| {
                let (ty, storage) = context.take_slot(base + index);
                Value::from_parts(ty, storage)
            })
            .collect())
    }
}

macro_rules! impl_call_output_scalar {
    ($($ty:ty),+) => {
        $(
            /// The first output.
            impl CallOutput for $ty {
                fn check(declarations: &[ValueDeclaration]) -> Result<(), CallError> {
                    check_output_count(declarations, 1)?;
                    check_native_output::<$ty>(declarations, 0)
                }

                fn read(
                    context: &mut ExecutionContext,
                    base: usize,
                    _declarations: &[ValueDeclaration],
                ) -> Result<Self, ExecutionError> {
                    context.take_native::<$ty>(base)
                }
            }
        )+
    };
}

impl_call_output_scalar!(f64, f32, bool, i32, i64, u32, u64, usize, String, MemoryAddress);

macro_rules! impl_call_output_tuple {
    ($($name:ident : $index:tt),+) => {
        /// The leading outputs.
        impl<$($name: NativeValue),+> CallOutput for ($($name,)+) {
            fn check(declarations: &[ValueDeclaration]) -> Result<(), CallError> {
                check_output_count(declarations, [$($index),+].len())?;
                $(check_native_output::<$name>(declarations, $index)?;)+
                Ok(())
            }

            fn read(
                context: &mut ExecutionContext,
                base: usize,
                _declarations: &[ValueDeclaration],
            ) -> Result<Self, ExecutionError> {
                Ok(($(context.take_native::<$name>(base + $index)?,)+))
            }
        }
    };
}

impl_call_output_tuple!(A: 0);
impl_call_output_tuple!(A: 0, B: 1);
impl_call_output_tuple!(A: 0, B: 1, C: 2);

// ============================================================================
// Current context
// ============================================================================

/// Number of calls active on the current thread across all of its contexts.
mod nesting {
    #[cfg(feature = "std")]
    std::thread_local! {
        static DEPTH: core::cell::Cell<usize> = const { core::cell::Cell::new(0) };
    }

    #[cfg(feature = "std")]
    pub(super) fn depth() -> usize {
        DEPTH.try_with(core::cell::Cell::get).unwrap_or(0)
    }

    #[cfg(feature = "std")]
    pub(super) fn add(count: usize) {
        let _ = DEPTH.try_with(|depth| depth.set(depth.get() + count));
    }

    #[cfg(feature = "std")]
    pub(super) fn sub(count: usize) {
        let _ = DEPTH.try_with(|depth| depth.set(depth.get().saturating_sub(count)));
    }

    // Without threads every context shares one counter.
    #[cfg(not(feature = "std"))]
    static DEPTH: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);

    #[cfg(not(feature = "std"))]
    pub(super) fn depth() -> usize {
        DEPTH.load(core::sync::atomic::Ordering::Relaxed)
    }

    #[cfg(not(feature = "std"))]
    pub(super) fn add(count: usize) {
        DEPTH.fetch_add(count, core::sync::atomic::Ordering::Relaxed);
    }

    #[cfg(not(feature = "std"))]
    pub(super) fn sub(count: usize) {
        let _ = DEPTH.fetch_update(
            core::sync::atomic::Ordering::Relaxed,
            core::sync::atomic::Ordering::Relaxed,
            |depth| Some(depth.saturating_sub(count)),
        );
    }
}

#[cfg(feature = "std")]
std::thread_local! {
    static CURRENT: core::cell::RefCell<Option<ExecutionContext>> =
        const { core::cell::RefCell::new(None) };
    static SPARE: core::cell::RefCell<Vec<ExecutionContext>> =
        const { core::cell::RefCell::new(Vec::new()) };
}

/// Run `body` on this thread's execution context.
///
/// When the thread's context is already in use (a native function running
/// inside it dropped or copied a value), or without the `std` feature, a
/// fallback context is used instead. Fallback contexts are reused per
/// thread, and the call depth limit applies across all of them.
pub fn with_current<R>(body: impl FnOnce(&mut ExecutionContext) -> R) -> R {
    let mut body = Some(body);

    #[cfg(feature = "std")]
    {
        let result = CURRENT.try_with(|cell| {
            let mut context = cell.try_borrow_mut().ok()?;
            let body = body.take()?;
            Some(body(context.get_or_insert_with(ExecutionContext::default)))
        });
        if let Ok(Some(result)) = result {
            return result;
        }
    }

    let mut context = take_spare().unwrap_or_else(|| {
        ExecutionContext::new(&VmConfig {
            stack_size: TEMPORARY_STACK_SIZE,
            ..VmConfig::default()
        })
    });
    let result = match body {
        Some(body) => body(&mut context),
        None => unreachable!("the closure only runs once"),
    };
    return_spare(context);
    result
}

#[cfg(feature = "std")]
fn take_spare() -> Option<ExecutionContext> {
    SPARE
        .try_with(|spare| spare.try_borrow_mut().ok()?.pop())
        .ok()
        .flatten()
}

#[cfg(not(feature = "std"))]
fn take_spare() -> Option<ExecutionContext> {
    None
}

#[cfg(feature = "std")]
fn return_spare(context: ExecutionContext) {
    if context.top != 0 || !context.frames.is_empty() {
        return;
    }
    let _ = SPARE.try_with(|spare| {
        if let Ok(mut spare) = spare.try_borrow_mut() {
            if spare.len() < SPARE_CONTEXTS {
                spare.push(context);
            }
        }
    });
}

#[cfg(not(feature = "std"))]
fn return_spare(_context: ExecutionContext) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::register_test_module;
    use alloc::vec;

    fn number() -> ValueDeclaration {
        ValueDeclaration::new("value", Type::id_of::<f64>().unwrap())
    }

    fn small_context(stack_size: usize, max_call_depth: usize) -> ExecutionContext {
        ExecutionContext::new(&VmConfig {
            stack_size,
            max_call_depth,
        })
    }

    #[test]
    fn test_push_pop() {
        let mut context = small_context(4, 4);
        context.push(1.0f64).unwrap();
        context.push(true).unwrap();
        assert_eq!(context.top(), 2);
        assert_eq!(*context.get::<bool>(StackOffset::Top(-1)).unwrap(), true);
        assert_eq!(*context.get::<f64>(StackOffset::Frame(0)).unwrap(), 1.0);
        assert!(matches!(
            context.get::<f64>(StackOffset::Top(-1)),
            Err(ExecutionError::TypeMismatch { .. })
        ));
        context.pop(2).unwrap();
        assert_eq!(context.top(), 0);
    }

    #[test]
    fn test_stack_overflow() {
        let mut context = small_context(2, 4);
        context.push(1.0f64).unwrap();
        context.push(2.0f64).unwrap();
        assert_eq!(context.push(3.0f64), Err(ExecutionError::StackOverflow));
        assert_eq!(context.push_empty(1), Err(ExecutionError::StackOverflow));
        assert_eq!(context.top(), 2);
        context.pop(2).unwrap();
    }

    #[test]
    fn test_stack_underflow() {
        let mut context = small_context(4, 4);
        assert_eq!(context.pop(1), Err(ExecutionError::StackUnderflow));
        assert_eq!(
            context.get::<f64>(StackOffset::Top(-1)).unwrap_err(),
            ExecutionError::StackUnderflow
        );
        assert_eq!(
            context.get::<f64>(StackOffset::Frame(0)).unwrap_err(),
            ExecutionError::StackUnderflow
        );
    }

    #[test]
    fn test_pop_destroys_values() {
        let shared = Arc::new(1.0f64);
        let module = register_test_module();
        module
            .register_type(crate::types::TypeDescription::for_native::<Arc<f64>>("Shared"))
            .unwrap();
        let mut context = small_context(4, 4);
        context.push(Arc::clone(&shared)).unwrap();
        assert_eq!(Arc::strong_count(&shared), 2);
        context.pop(1).unwrap();
        assert_eq!(Arc::strong_count(&shared), 1);
    }

    fn swap(call: &mut NativeCall<'_>) -> Result<(), ExecutionError> {
        let a = *call.input::<f64>(0)?;
        let b = *call.input::<f64>(1)?;
        call.set_output(0, b)?;
        call.set_output(1, a)
    }

    fn swap_function() -> Arc<Function> {
        Function::make_native(swap, vec![number(), number()], vec![number(), number()])
    }

    #[test]
    fn test_native_call_outputs() {
        let mut context = ExecutionContext::default();
        let (a, b): (f64, f64) = context.call(&swap_function(), (1.0f64, 2.0f64)).unwrap();
        assert_eq!((a, b), (2.0, 1.0));
        assert_eq!(context.top(), 0);

        let first: f64 = context.call(&swap_function(), (1.0f64, 2.0f64)).unwrap();
        assert_eq!(first, 2.0);

        let all: Vec<Value> = context.call(&swap_function(), (1.0f64, 2.0f64)).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].get::<f64>(), Some(&1.0));
    }

    #[test]
    fn test_call_checks_arity_and_types() {
        let mut context = ExecutionContext::default();
        let function = swap_function();
        assert_eq!(
            context.call::<(), _>(&function, (1.0f64,)),
            Err(ExecutionError::Call(CallError::ArityMismatch {
                expected: 2,
                got: 1
            }))
        );
        assert!(matches!(
            context.call::<(), _>(&function, (1.0f64, true)),
            Err(ExecutionError::Call(CallError::InputTypeMismatch { index: 1, .. }))
        ));
        assert!(matches!(
            context.call::<(f64, f64, f64), _>(&function, (1.0f64, 2.0f64)),
            Err(ExecutionError::Call(CallError::OutputArityMismatch { .. }))
        ));
        assert!(matches!(
            context.call::<bool, _>(&function, (1.0f64, 2.0f64)),
            Err(ExecutionError::Call(CallError::OutputTypeMismatch { .. }))
        ));
        assert_eq!(context.top(), 0);
    }

    #[test]
    fn test_value_inputs() {
        let mut context = ExecutionContext::default();
        let inputs = vec![Value::new(5.0f64).unwrap(), Value::new(6.0f64).unwrap()];
        let first: f64 = context.call(&swap_function(), inputs.as_slice()).unwrap();
        assert_eq!(first, 6.0);
        let first: Value = context.call(&swap_function(), inputs).unwrap();
        assert_eq!(first.get::<f64>(), Some(&6.0));

        let wrong = vec![Value::new(true).unwrap(), Value::new(6.0f64).unwrap()];
        assert!(matches!(
            context.call::<(), _>(&swap_function(), wrong),
            Err(ExecutionError::Call(CallError::InputTypeMismatch { index: 0, .. }))
        ));
    }

    fn failing(_call: &mut NativeCall<'_>) -> Result<(), ExecutionError> {
        Err(ExecutionError::Native(String::from("boom")))
    }

    #[test]
    fn test_error_unwinds_stack() {
        let mut context = ExecutionContext::default();
        let function = Function::make_native(failing, vec![number()], vec![number()]);
        assert_eq!(
            context.call::<f64, _>(&function, (1.0f64,)),
            Err(ExecutionError::Native(String::from("boom")))
        );
        assert_eq!(context.top(), 0);
        assert_eq!(context.call_depth(), 0);
    }

    fn script(instructions: &[Instruction], constants: Vec<Value>) -> FunctionHandle {
        FunctionHandle::Script(code::load(instructions, constants))
    }

    #[test]
    fn test_script_constant_and_assign() {
        let handle = script(
            &[
                Instruction::PushConstant { index: 0 },
                Instruction::AssignStackValue {
                    source: StackOffset::Top(-1),
                    destination: StackOffset::Frame(0),
                },
                Instruction::Pop { count: 1 },
                Instruction::Return,
            ],
            vec![Value::new(42.0f64).unwrap()],
        );
        let mut context = ExecutionContext::default();
        let outputs = context.call_handle(handle, vec![], 1).unwrap();
        assert_eq!(outputs[0].get::<f64>(), Some(&42.0));
        assert_eq!(context.top(), 0);
    }

    #[test]
    fn test_script_jump_if_false_requires_boolean() {
        let handle = script(
            &[
                Instruction::PushConstant { index: 0 },
                Instruction::JumpIfFalse { offset: 1 },
                Instruction::Return,
            ],
            vec![Value::new(1.0f64).unwrap()],
        );
        let mut context = ExecutionContext::default();
        assert!(matches!(
            context.call_handle(handle, vec![], 0),
            Err(ExecutionError::TypeMismatch { .. })
        ));
        assert_eq!(context.top(), 0);
        assert_eq!(context.call_depth(), 0);
    }

    #[test]
    fn test_script_pop_below_frame_underflows() {
        let handle = script(&[Instruction::Pop { count: 1 }, Instruction::Return], vec![]);
        let mut context = ExecutionContext::default();
        assert_eq!(
            context.call_handle(handle, vec![Value::new(1.0f64).unwrap()], 0),
            Err(ExecutionError::StackUnderflow)
        );
        assert_eq!(context.top(), 0);
    }

    fn recurse(call: &mut NativeCall<'_>) -> Result<(), ExecutionError> {
        call.context()
            .call_handle(FunctionHandle::Native(recurse), vec![], 0)
            .map(|_| ())
    }

    #[test]
    fn test_runaway_recursion_reports_call_stack_overflow() {
        let mut context = small_context(16, 32);
        assert_eq!(
            context.call_handle(FunctionHandle::Native(recurse), vec![], 0),
            Err(ExecutionError::CallStackOverflow)
        );
        assert_eq!(context.call_depth(), 0);
        assert_eq!(context.top(), 0);
    }

    #[test]
    fn test_offset_address() {
        let handle = script(
            &[
                Instruction::OffsetAddress {
                    position: StackOffset::Frame(0),
                    delta: 8,
                },
                Instruction::Return,
            ],
            vec![],
        );
        let mut context = ExecutionContext::default();
        let mut buffer = [0u64; 2];
        let base = buffer.as_mut_ptr().cast::<u8>();
        // The address is the script's only input and is adjusted in place.
        context.push(MemoryAddress(base)).unwrap();
        let depth = context.call_depth();
        assert!(context.enter(handle, 1, 0).unwrap());
        context.run(depth).unwrap();
        assert_eq!(
            context.get::<MemoryAddress>(StackOffset::Top(-1)).unwrap().as_ptr(),
            base.wrapping_add(8)
        );
        context.pop(1).unwrap();
    }

    #[test]
    fn test_with_current_reentrant_fallback() {
        let outer_size = with_current(|outer| {
            let inner_size = with_current(|inner| inner.stack_size());
            (outer.stack_size(), inner_size)
        });
        assert_eq!(outer_size.1, TEMPORARY_STACK_SIZE);
    }

    static RECURSIVE: spin::Once<Arc<Function>> = spin::Once::new();

    fn call_self(_call: &mut NativeCall<'_>) -> Result<(), ExecutionError> {
        match RECURSIVE.get() {
            Some(function) => function.call::<(), _>(()),
            None => Ok(()),
        }
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_call_depth_spans_nested_contexts() {
        // Every level nests a fallback context; give the recursion room.
        std::thread::Builder::new()
            .stack_size(32 << 20)
            .spawn(|| {
                let function =
                    RECURSIVE.call_once(|| Function::make_native(call_self, vec![], vec![]));
                assert_eq!(
                    function.call::<(), _>(()),
                    Err(ExecutionError::CallStackOverflow)
                );
                assert_eq!(nesting::depth(), 0);
                with_current(|context| {
                    assert_eq!(context.top(), 0);
                    assert_eq!(context.call_depth(), 0);
                });
            })
            .unwrap()
            .join()
            .unwrap();
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_fallback_contexts_are_reused() {
        with_current(|_outer| {
            let first = with_current(|inner| inner.slots.as_ptr() as usize);
            let second = with_current(|inner| inner.slots.as_ptr() as usize);
            assert_eq!(first, second);
        });
    }
}
