//! Cooperation layer with the managed runtime inside the inferior.
//!
//! The runtime publishes a well-known data symbol (the debugger info block)
//! containing a notification trampoline, the symbol table, a metadata-offset
//! descriptor and a table of entry points. Everything in here either parses
//! that block or drives those entry points through the invocation engine.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

use strum::{Display, FromRepr};
use tracing::{trace, warn};

use crate::breakpoint::{BreakpointId, VirtualAddress};
use crate::errors::{ServerCommandError, ServerResult};
use crate::message::{MessageKind, StatusMessage};
use crate::server::Server;
use crate::trace::TracedProcess;

/// First quadword of the debugger info block.
pub const DEBUGGER_INFO_MAGIC: u64 = 0x6d64_625f_696e_666f; // "mdb_info"
/// Contract version; bumped whenever the block layout or the metadata
/// descriptor changes.
pub const DEBUGGER_INFO_VERSION: u32 = 5;

/// Size of one executable-code arena chunk.
pub const EXECUTABLE_CODE_CHUNK_SIZE: u32 = 4096;

/// Events the managed runtime reports through its notification trampoline.
/// Delivered with up to two 64-bit data words.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, FromRepr)]
#[repr(u32)]
pub enum NotificationType {
    AddModule = 1,
    ReloadSymtabs = 2,
    MethodCompiled = 3,
    ClassInitialized = 4,
    InitializeManagedCode = 5,
    InitializeThreadManager = 6,
    FinalizeManagedCode = 7,
    ReachedMain = 8,
    MainExited = 9,
    WrapperMain = 10,
    ThreadCreated = 11,
    ThreadExited = 12,
    ThreadAbort = 13,
    AcquireGlobalThreadLock = 14,
    ReleaseGlobalThreadLock = 15,
    UnhandledException = 16,
    HandleException = 17,
    ThrowException = 18,
}

impl NotificationType {
    pub fn decode(arg: u64) -> Option<Self> {
        u32::try_from(arg).ok().and_then(Self::from_repr)
    }
}

/// Little-endian field reader for records copied out of inferior memory.
struct FieldReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn u32(&mut self) -> Option<u32> {
        let end = self.pos.checked_add(4)?;
        let raw = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(u32::from_le_bytes(raw.try_into().ok()?))
    }

    fn u64(&mut self) -> Option<u64> {
        let end = self.pos.checked_add(8)?;
        let raw = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(u64::from_le_bytes(raw.try_into().ok()?))
    }
}

/// Addresses of the runtime entry points the debugger may invoke, in block
/// order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FunctionTable {
    pub compile_method: u64,
    pub get_virtual_method: u64,
    pub get_boxed_object: u64,
    pub insert_breakpoint: u64,
    pub remove_breakpoint: u64,
    pub register_class_init_callback: u64,
    pub remove_class_init_callback: u64,
    pub runtime_invoke: u64,
    pub create_string: u64,
    pub lookup_class: u64,
    pub lookup_assembly: u64,
    pub run_finally: u64,
    pub get_current_thread: u64,
    pub class_get_static_field_data: u64,
    pub get_method_addr_or_bpt: u64,
    pub remove_method_breakpoint: u64,
    pub attach: u64,
    pub detach: u64,
    pub initialize: u64,
}

/// The debugger info block, as read from the exported symbol.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DebuggerInfo {
    pub magic: u64,
    pub version: u32,
    pub total_size: u32,
    pub symbol_table_size: u32,
    pub notification_function: u64,
    pub trampoline_code: u64,
    pub symbol_table: u64,
    pub metadata_info: u64,
    pub table: FunctionTable,
}

impl DebuggerInfo {
    /// magic + 4 u32s + 4 pointers + 19 table entries.
    pub const SIZE: usize = 8 + 16 + 23 * 8;

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let mut r = FieldReader::new(bytes);
        let magic = r.u64()?;
        let version = r.u32()?;
        let total_size = r.u32()?;
        let symbol_table_size = r.u32()?;
        let _reserved = r.u32()?;
        let notification_function = r.u64()?;
        let trampoline_code = r.u64()?;
        let symbol_table = r.u64()?;
        let metadata_info = r.u64()?;

        let mut table = FunctionTable::default();
        for field in [
            &mut table.compile_method,
            &mut table.get_virtual_method,
            &mut table.get_boxed_object,
            &mut table.insert_breakpoint,
            &mut table.remove_breakpoint,
            &mut table.register_class_init_callback,
            &mut table.remove_class_init_callback,
            &mut table.runtime_invoke,
            &mut table.create_string,
            &mut table.lookup_class,
            &mut table.lookup_assembly,
            &mut table.run_finally,
            &mut table.get_current_thread,
            &mut table.class_get_static_field_data,
            &mut table.get_method_addr_or_bpt,
            &mut table.remove_method_breakpoint,
            &mut table.attach,
            &mut table.detach,
            &mut table.initialize,
        ] {
            *field = r.u64()?;
        }

        Some(Self {
            magic,
            version,
            total_size,
            symbol_table_size,
            notification_function,
            trampoline_code,
            symbol_table,
            metadata_info,
            table,
        })
    }

    /// Read and validate the block at `addr`. Magic or version mismatch is
    /// fatal for the session.
    pub fn read(trace: &TracedProcess, addr: u64) -> ServerResult<Self> {
        let bytes = trace.read_memory(addr, Self::SIZE)?;
        let info = Self::parse(&bytes).ok_or(ServerCommandError::InternalError)?;

        if info.magic != DEBUGGER_INFO_MAGIC {
            warn!("bad debugger info magic: {:#x}", info.magic);
            return Err(ServerCommandError::InternalError);
        }
        if info.version != DEBUGGER_INFO_VERSION {
            warn!(
                version = info.version,
                expected = DEBUGGER_INFO_VERSION,
                "debugger info version mismatch"
            );
            return Err(ServerCommandError::InternalError);
        }
        Ok(info)
    }
}

/// Frozen record of field offsets and sizes inside the runtime's internal
/// types; lets the debugger read runtime memory without guessing. Read-only
/// and versioned by the info block's `version`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MetadataInfo {
    pub total_size: u32,
    pub defaults_size: u32,
    pub defaults_address: u64,
    pub type_size: u32,
    pub array_type_size: u32,
    pub class_size: u32,
    pub thread_size: u32,
    pub thread_tid_offset: u32,
    pub thread_stack_ptr_offset: u32,
    pub thread_end_stack_offset: u32,
    pub class_instance_size_offset: u32,
    pub class_parent_offset: u32,
    pub class_token_offset: u32,
    pub class_fields_offset: u32,
    pub class_methods_offset: u32,
    pub class_method_count_offset: u32,
    pub class_this_arg_offset: u32,
    pub class_byval_arg_offset: u32,
    pub field_info_size: u32,
}

impl MetadataInfo {
    pub const SIZE: usize = 8 + 18 * 4;

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let mut r = FieldReader::new(bytes);
        let total_size = r.u32()?;
        let defaults_size = r.u32()?;
        let defaults_address = r.u64()?;
        Some(Self {
            total_size,
            defaults_size,
            defaults_address,
            type_size: r.u32()?,
            array_type_size: r.u32()?,
            class_size: r.u32()?,
            thread_size: r.u32()?,
            thread_tid_offset: r.u32()?,
            thread_stack_ptr_offset: r.u32()?,
            thread_end_stack_offset: r.u32()?,
            class_instance_size_offset: r.u32()?,
            class_parent_offset: r.u32()?,
            class_token_offset: r.u32()?,
            class_fields_offset: r.u32()?,
            class_methods_offset: r.u32()?,
            class_method_count_offset: r.u32()?,
            class_this_arg_offset: r.u32()?,
            class_byval_arg_offset: r.u32()?,
            field_info_size: r.u32()?,
        })
    }

    pub fn read(trace: &TracedProcess, addr: u64) -> ServerResult<Self> {
        let bytes = trace.read_memory(addr, Self::SIZE)?;
        let info = Self::parse(&bytes).ok_or(ServerCommandError::InternalError)?;
        if (info.total_size as usize) < Self::SIZE {
            warn!(total_size = info.total_size, "metadata descriptor too small");
            return Err(ServerCommandError::InternalError);
        }
        Ok(info)
    }
}

/// Fixed-size pool tracked by a bitmap; one bit per slot.
#[derive(Clone, Debug)]
struct BitSlots {
    bits: Vec<u8>,
    count: u32,
}

impl BitSlots {
    fn new(count: u32) -> Self {
        Self {
            bits: vec![0; count.div_ceil(8) as usize],
            count,
        }
    }

    fn allocate(&mut self) -> Option<u32> {
        for slot in 0..self.count {
            let (byte, bit) = (slot as usize / 8, slot % 8);
            if self.bits[byte] & (1 << bit) == 0 {
                self.bits[byte] |= 1 << bit;
                return Some(slot);
            }
        }
        None
    }

    fn free(&mut self, slot: u32) {
        let (byte, bit) = (slot as usize / 8, slot % 8);
        debug_assert!(self.bits[byte] & (1 << bit) != 0, "double free of slot {slot}");
        self.bits[byte] &= !(1 << bit);
    }

    fn in_use(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }
}

/// A chunk handed out by the executable-code arena.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CodeChunk {
    pub index: u32,
    pub address: u64,
    pub size: u32,
}

/// Scratch region inside the inferior into which the debugger writes the
/// small instruction sequences used by invocations.
#[derive(Clone, Debug)]
pub struct CodeArena {
    base: u64,
    size: u32,
    chunk_size: u32,
    slots: BitSlots,
}

impl CodeArena {
    pub fn new(base: u64, size: u32, chunk_size: u32) -> Self {
        Self {
            base,
            size,
            chunk_size,
            slots: BitSlots::new(size / chunk_size),
        }
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn allocate(&mut self) -> Option<CodeChunk> {
        let index = self.slots.allocate()?;
        Some(CodeChunk {
            index,
            address: self.base + u64::from(index) * u64::from(self.chunk_size),
            size: self.chunk_size,
        })
    }

    pub fn free(&mut self, chunk: CodeChunk) {
        self.slots.free(chunk.index);
    }

    pub fn chunks_in_use(&self) -> u32 {
        self.slots.in_use()
    }
}

/// Describes the managed runtime inside one inferior.
#[derive(Clone, Debug)]
pub struct RuntimeInfo {
    pub address_size: u32,
    pub notification_address: u64,
    pub executable_code: CodeArena,
    breakpoint_info_base: u64,
    breakpoint_slots: BitSlots,
}

impl RuntimeInfo {
    pub fn new(
        address_size: u32,
        notification_address: u64,
        code_base: u64,
        code_size: u32,
        breakpoint_info_base: u64,
        breakpoint_slot_count: u32,
    ) -> Self {
        Self {
            address_size,
            notification_address,
            executable_code: CodeArena::new(code_base, code_size, EXECUTABLE_CODE_CHUNK_SIZE),
            breakpoint_info_base,
            breakpoint_slots: BitSlots::new(breakpoint_slot_count),
        }
    }

    /// Replace the executable-code buffer, e.g. after the runtime grows it.
    pub fn initialize_code_buffer(&mut self, base: u64, size: u32) {
        self.executable_code = CodeArena::new(base, size, EXECUTABLE_CODE_CHUNK_SIZE);
    }

    pub fn allocate_breakpoint_slot(&mut self) -> Option<(u32, u64)> {
        let slot = self.breakpoint_slots.allocate()?;
        Some((slot, self.breakpoint_info_base + u64::from(slot) * 8))
    }

    pub fn free_breakpoint_slot(&mut self, slot: u32) {
        self.breakpoint_slots.free(slot);
    }
}

/// Counting reentrant lock around runtime-visible mutations.
///
/// Nested acquisitions only bump the counter; the outermost release reports
/// whether a symbol-table reload notification must be emitted. The caller
/// emits it *after* the lock is gone, never while holding it.
pub struct RuntimeLock {
    state: Mutex<LockState>,
    unlocked: Condvar,
}

struct LockState {
    owner: Option<ThreadId>,
    level: u32,
    must_reload_symtabs: bool,
}

impl RuntimeLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                owner: None,
                level: 0,
                must_reload_symtabs: false,
            }),
            unlocked: Condvar::new(),
        }
    }

    pub fn lock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();
        while state.owner.is_some() && state.owner != Some(me) {
            state = self.unlocked.wait(state).unwrap();
        }
        state.owner = Some(me);
        state.level += 1;
    }

    /// Flag that symbol tables changed; only meaningful while holding the
    /// lock.
    pub fn set_must_reload_symtabs(&self) {
        let mut state = self.state.lock().unwrap();
        assert_eq!(
            state.owner,
            Some(thread::current().id()),
            "must_reload_symtabs set without holding the runtime lock"
        );
        state.must_reload_symtabs = true;
    }

    /// Release one level. Returns `true` when this was the outermost release
    /// and a `ReloadSymtabs` notification should be emitted by the caller.
    pub fn unlock(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        assert_eq!(
            state.owner,
            Some(thread::current().id()),
            "unlock of a runtime lock not held by this thread"
        );
        state.level -= 1;
        if state.level > 0 {
            return false;
        }
        state.owner = None;
        let reload = std::mem::take(&mut state.must_reload_symtabs);
        drop(state);
        self.unlocked.notify_one();
        reload
    }
}

impl Default for RuntimeLock {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered class-init callback; fires exactly once.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClassInitCallback {
    pub image: u64,
    pub type_token: u32,
    pub index: u32,
    pub descriptor: String,
}

/// Result of a runtime invoke: a value reference, or the exception's string
/// form when the invoked method threw.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RuntimeInvokeResult {
    pub result: u64,
    pub exception: u64,
}

/// Debugger-side driver of the managed-runtime contract. All entry points are
/// executed inside the inferior through the invocation engine.
pub struct ManagedRuntime {
    pub info: DebuggerInfo,
    pub metadata: MetadataInfo,
    lock: RuntimeLock,
    class_init_callbacks: Mutex<BTreeMap<u32, ClassInitCallback>>,
    /// Runtime-side tokens for breakpoints inserted by method descriptor.
    method_breakpoints: Mutex<BTreeMap<BreakpointId, u64>>,
    /// `Object.ToString` entry used to render exceptions; resolved by the
    /// frontend during the attach handshake.
    to_string_method: Mutex<u64>,
    /// Mirror of the runtime's single pinned temporary. Holds the original
    /// exception reference until the next invoke replaces it.
    last_exception: Mutex<u64>,
    /// Same single-slot pin for the most recent boxed temporary.
    last_boxed_object: Mutex<u64>,
    next_callback_id: Mutex<u64>,
}

impl ManagedRuntime {
    pub fn new(info: DebuggerInfo, metadata: MetadataInfo) -> Self {
        Self {
            info,
            metadata,
            lock: RuntimeLock::new(),
            class_init_callbacks: Mutex::new(BTreeMap::new()),
            method_breakpoints: Mutex::new(BTreeMap::new()),
            to_string_method: Mutex::new(0),
            last_exception: Mutex::new(0),
            last_boxed_object: Mutex::new(0),
            next_callback_id: Mutex::new(0x1000_0000),
        }
    }

    /// Read the whole block and its metadata descriptor from the inferior.
    pub fn from_inferior(trace: &TracedProcess, info_addr: u64) -> ServerResult<Self> {
        let info = DebuggerInfo::read(trace, info_addr)?;
        let metadata = MetadataInfo::read(trace, info.metadata_info)?;
        Ok(Self::new(info, metadata))
    }

    pub fn lock(&self) -> &RuntimeLock {
        &self.lock
    }

    pub fn set_to_string_method(&self, addr: u64) {
        *self.to_string_method.lock().unwrap() = addr;
    }

    fn fresh_callback_id(&self) -> u64 {
        let mut next = self.next_callback_id.lock().unwrap();
        *next += 1;
        *next
    }

    /// Emitted after the outermost unlock when the symbol tables changed.
    fn reload_message(&self) -> StatusMessage {
        StatusMessage::simple(
            MessageKind::ChildNotification,
            NotificationType::ReloadSymtabs as u32 as u64,
        )
    }

    pub fn attach(&self, server: &mut Server) -> ServerResult<()> {
        let cb = self.fresh_callback_id();
        server.call_method(self.info.table.attach, cb)?;
        server.wait_for_callback(cb)?;
        Ok(())
    }

    pub fn detach(&self, server: &mut Server) -> ServerResult<()> {
        let cb = self.fresh_callback_id();
        server.call_method(self.info.table.detach, cb)?;
        server.wait_for_callback(cb)?;
        Ok(())
    }

    pub fn initialize(&self, server: &mut Server) -> ServerResult<()> {
        let cb = self.fresh_callback_id();
        server.call_method(self.info.table.initialize, cb)?;
        server.wait_for_callback(cb)?;
        Ok(())
    }

    pub fn compile_method(&self, server: &mut Server, method: u64) -> ServerResult<u64> {
        let cb = self.fresh_callback_id();
        server.call_method_1(self.info.table.compile_method, method, cb)?;
        let (addr, _) = server.wait_for_callback(cb)?;
        Ok(addr)
    }

    pub fn get_virtual_method(
        &self,
        server: &mut Server,
        object: u64,
        method: u64,
    ) -> ServerResult<u64> {
        let cb = self.fresh_callback_id();
        server.call_method_2(self.info.table.get_virtual_method, object, method, cb)?;
        let (addr, _) = server.wait_for_callback(cb)?;
        Ok(addr)
    }

    /// Box a value type. The runtime pins the result against collection; we
    /// mirror the reference so the frontend can rely on it staying alive
    /// until the next boxing request.
    pub fn get_boxed_object(&self, server: &mut Server, class: u64, value: u64) -> ServerResult<u64> {
        let cb = self.fresh_callback_id();
        server.call_method_2(self.info.table.get_boxed_object, class, value, cb)?;
        let (boxed, _) = server.wait_for_callback(cb)?;
        *self.last_boxed_object.lock().unwrap() = boxed;
        Ok(boxed)
    }

    pub fn create_string(&self, server: &mut Server, text: &str) -> ServerResult<u64> {
        let cb = self.fresh_callback_id();
        server.call_method_string(self.info.table.create_string, 0, 0, text, cb)?;
        let (string_ref, _) = server.wait_for_callback(cb)?;
        Ok(string_ref)
    }

    pub fn lookup_class(&self, server: &mut Server, image: u64, full_name: &str) -> ServerResult<i64> {
        let cb = self.fresh_callback_id();
        server.call_method_string(self.info.table.lookup_class, image, 0, full_name, cb)?;
        let (class, _) = server.wait_for_callback(cb)?;
        Ok(class as i64)
    }

    /// Find an image in the runtime's symbol table, opening it when missing.
    /// A successful open flags the symbol tables dirty; the reload
    /// notification is handed back once the outermost lock level drops.
    pub fn lookup_assembly(
        &self,
        server: &mut Server,
        path: &str,
    ) -> ServerResult<(i64, Option<StatusMessage>)> {
        self.lock.lock();
        let result = (|| -> ServerResult<i64> {
            let cb = self.fresh_callback_id();
            server.call_method_string(self.info.table.lookup_assembly, 0, 0, path, cb)?;
            let (index, opened) = server.wait_for_callback(cb)?;
            if opened != 0 {
                self.lock.set_must_reload_symtabs();
            }
            Ok(index as i64)
        })();
        let reload = self.lock.unlock();

        let index = result?;
        Ok((index, reload.then(|| self.reload_message())))
    }

    pub fn run_finally(&self, server: &mut Server, context: u64) -> ServerResult<()> {
        let cb = self.fresh_callback_id();
        server.call_method_1(self.info.table.run_finally, context, cb)?;
        server.wait_for_callback(cb)?;
        Ok(())
    }

    pub fn get_current_thread(&self, server: &mut Server) -> ServerResult<u64> {
        let cb = self.fresh_callback_id();
        server.call_method(self.info.table.get_current_thread, cb)?;
        let (thread, _) = server.wait_for_callback(cb)?;
        Ok(thread)
    }

    pub fn class_get_static_field_data(&self, server: &mut Server, class: u64) -> ServerResult<u64> {
        let cb = self.fresh_callback_id();
        server.call_method_1(self.info.table.class_get_static_field_data, class, cb)?;
        let (data, _) = server.wait_for_callback(cb)?;
        Ok(data)
    }

    /// Insert a breakpoint on a method that may not be compiled yet. The
    /// table entry stays symbolic until the runtime reports an address.
    pub fn insert_method_breakpoint(
        &self,
        server: &mut Server,
        descriptor: &str,
    ) -> ServerResult<BreakpointId> {
        let id = server
            .breakpoints()
            .lock()
            .unwrap()
            .insert_method_pending(descriptor);

        self.lock.lock();
        let result = (|| -> ServerResult<u64> {
            let cb = self.fresh_callback_id();
            server.call_method_string(
                self.info.table.insert_breakpoint,
                u64::from(id.value()),
                0,
                descriptor,
                cb,
            )?;
            let (token, _) = server.wait_for_callback(cb)?;
            Ok(token)
        })();
        let reload = self.lock.unlock();
        debug_assert!(!reload, "method breakpoint insert must not dirty symtabs");

        let token = result?;
        self.method_breakpoints.lock().unwrap().insert(id, token);
        Ok(id)
    }

    pub fn remove_method_breakpoint(
        &self,
        server: &mut Server,
        id: BreakpointId,
    ) -> ServerResult<()> {
        let token = self
            .method_breakpoints
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or(ServerCommandError::NoSuchBreakpoint)?;

        let cb = self.fresh_callback_id();
        server.call_method_2(self.info.table.remove_method_breakpoint, 0, token, cb)?;
        server.wait_for_callback(cb)?;
        server.remove_breakpoint(id)?;
        Ok(())
    }

    /// Either the compiled address of `method`, or zero after arming a
    /// runtime-side trap that fires once it is compiled. Negative means the
    /// method cannot be trapped at all.
    pub fn get_method_addr_or_bpt(
        &self,
        server: &mut Server,
        method: u64,
        index: u32,
    ) -> ServerResult<i64> {
        let cb = self.fresh_callback_id();
        server.call_method_2(
            self.info.table.get_method_addr_or_bpt,
            method,
            u64::from(index),
            cb,
        )?;
        let (addr, _) = server.wait_for_callback(cb)?;
        Ok(addr as i64)
    }

    /// Patch a previously pending method breakpoint now that its address is
    /// known (driven by a `MethodCompiled` notification).
    pub fn materialize_method_breakpoint(
        &self,
        server: &mut Server,
        id: BreakpointId,
        address: u64,
    ) -> ServerResult<()> {
        let trace = server.trace_handle()?;
        server
            .breakpoints()
            .lock()
            .unwrap()
            .materialize_method(&trace, id, VirtualAddress::new(address))
    }

    pub fn register_class_init_callback(
        &self,
        server: &mut Server,
        image: u64,
        type_token: u32,
        index: u32,
        descriptor: &str,
    ) -> ServerResult<()> {
        self.lock.lock();
        let result = (|| -> ServerResult<()> {
            let cb = self.fresh_callback_id();
            server.call_method_string(
                self.info.table.register_class_init_callback,
                image,
                u64::from(index),
                descriptor,
                cb,
            )?;
            server.wait_for_callback(cb)?;
            Ok(())
        })();
        let reload = self.lock.unlock();
        debug_assert!(!reload);

        result?;
        self.class_init_callbacks.lock().unwrap().insert(
            index,
            ClassInitCallback {
                image,
                type_token,
                index,
                descriptor: descriptor.to_string(),
            },
        );
        Ok(())
    }

    pub fn remove_class_init_callback(&self, server: &mut Server, index: u32) -> ServerResult<()> {
        let cb = self.fresh_callback_id();
        server.call_method_1(
            self.info.table.remove_class_init_callback,
            u64::from(index),
            cb,
        )?;
        server.wait_for_callback(cb)?;
        self.class_init_callbacks.lock().unwrap().remove(&index);
        Ok(())
    }

    /// Consume the registration behind a `ClassInitialized` notification.
    /// Each registration fires exactly once.
    pub fn take_class_init_callback(&self, index: u32) -> Option<ClassInitCallback> {
        self.class_init_callbacks.lock().unwrap().remove(&index)
    }

    /// Invoke a managed method. A thrown exception is rendered to its string
    /// form through a nested `ToString` invoke; the original reference stays
    /// pinned until the next invocation replaces it.
    pub fn runtime_invoke(
        &self,
        server: &mut Server,
        method: u64,
        object: u64,
        params: u64,
    ) -> ServerResult<RuntimeInvokeResult> {
        let cb = self.fresh_callback_id();
        server.call_method_invoke(self.info.table.runtime_invoke, method, object, params, cb)?;
        server.mark_rti_frame()?;
        let (result, exception) = server.wait_for_callback(cb)?;

        if exception == 0 {
            return Ok(RuntimeInvokeResult { result, exception: 0 });
        }

        *self.last_exception.lock().unwrap() = exception;
        trace!("invoked method threw: {exception:#x}");

        let to_string = *self.to_string_method.lock().unwrap();
        if to_string == 0 {
            // No ToString resolved yet; surface the raw reference.
            return Ok(RuntimeInvokeResult { result, exception });
        }

        let virt = self.get_virtual_method(server, exception, to_string)?;
        let cb = self.fresh_callback_id();
        server.call_method_invoke(self.info.table.runtime_invoke, virt, exception, 0, cb)?;
        server.mark_rti_frame()?;
        let (string_ref, nested_exc) = server.wait_for_callback(cb)?;
        if nested_exc != 0 {
            warn!("ToString threw while rendering an exception");
            return Ok(RuntimeInvokeResult { result, exception });
        }

        Ok(RuntimeInvokeResult {
            result,
            exception: string_ref,
        })
    }

    /// Raw bytes of the runtime's symbol table, re-read on reload
    /// notifications.
    pub fn read_symbol_table(&self, trace: &TracedProcess) -> ServerResult<Vec<u8>> {
        trace.read_memory(self.info.symbol_table, self.info.symbol_table_size as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info_bytes() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&DEBUGGER_INFO_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&DEBUGGER_INFO_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(DebuggerInfo::SIZE as u32).to_le_bytes());
        bytes.extend_from_slice(&0x1000u32.to_le_bytes()); // symbol table size
        bytes.extend_from_slice(&0u32.to_le_bytes()); // reserved
        for i in 0..23u64 {
            bytes.extend_from_slice(&(0x7000_0000 + i * 8).to_le_bytes());
        }
        bytes
    }

    #[test]
    fn info_block_parses_in_declared_order() {
        let info = DebuggerInfo::parse(&sample_info_bytes()).expect("parse");
        assert_eq!(info.magic, DEBUGGER_INFO_MAGIC);
        assert_eq!(info.version, DEBUGGER_INFO_VERSION);
        assert_eq!(info.notification_function, 0x7000_0000);
        assert_eq!(info.trampoline_code, 0x7000_0008);
        assert_eq!(info.symbol_table, 0x7000_0010);
        assert_eq!(info.metadata_info, 0x7000_0018);
        assert_eq!(info.table.compile_method, 0x7000_0020);
        assert_eq!(info.table.initialize, 0x7000_0020 + 18 * 8);
    }

    #[test]
    fn info_block_rejects_truncation() {
        let bytes = sample_info_bytes();
        assert!(DebuggerInfo::parse(&bytes[..bytes.len() - 1]).is_none());
    }

    #[test]
    fn arena_chunks_allocate_and_free_by_bit() {
        let mut arena = CodeArena::new(0x9000_0000, 4 * EXECUTABLE_CODE_CHUNK_SIZE, EXECUTABLE_CODE_CHUNK_SIZE);
        let a = arena.allocate().expect("chunk");
        let b = arena.allocate().expect("chunk");
        assert_eq!(a.address, 0x9000_0000);
        assert_eq!(b.address, 0x9000_0000 + u64::from(EXECUTABLE_CODE_CHUNK_SIZE));
        assert_eq!(arena.chunks_in_use(), 2);

        arena.free(a);
        assert_eq!(arena.chunks_in_use(), 1);
        // Freed chunk is handed out again first.
        let c = arena.allocate().expect("chunk");
        assert_eq!(c.index, a.index);
    }

    #[test]
    fn arena_exhaustion_returns_none() {
        let mut arena = CodeArena::new(0x9000_0000, 2 * EXECUTABLE_CODE_CHUNK_SIZE, EXECUTABLE_CODE_CHUNK_SIZE);
        assert!(arena.allocate().is_some());
        assert!(arena.allocate().is_some());
        assert!(arena.allocate().is_none());
    }

    #[test]
    fn runtime_lock_reports_reload_only_at_outermost_release() {
        let lock = RuntimeLock::new();
        lock.lock();
        lock.lock();
        lock.set_must_reload_symtabs();
        assert!(!lock.unlock(), "nested release must not report");
        assert!(lock.unlock(), "outermost release reports the reload");
        // Flag was consumed.
        lock.lock();
        assert!(!lock.unlock());
    }

    #[test]
    fn runtime_lock_blocks_other_threads() {
        use std::sync::Arc;
        use std::sync::mpsc;

        let lock = Arc::new(RuntimeLock::new());
        lock.lock();

        let (tx, rx) = mpsc::channel();
        let thread_lock = Arc::clone(&lock);
        let handle = std::thread::spawn(move || {
            thread_lock.lock();
            tx.send(()).unwrap();
            thread_lock.unlock();
        });

        assert!(
            rx.recv_timeout(std::time::Duration::from_millis(50)).is_err(),
            "second thread acquired a held lock"
        );
        lock.unlock();
        rx.recv_timeout(std::time::Duration::from_secs(5))
            .expect("second thread never got the lock");
        handle.join().unwrap();
    }

    #[test]
    fn class_init_callbacks_fire_exactly_once() {
        let runtime = ManagedRuntime::new(
            DebuggerInfo::parse(&sample_info_bytes()).unwrap(),
            MetadataInfo {
                total_size: MetadataInfo::SIZE as u32,
                defaults_size: 0,
                defaults_address: 0,
                type_size: 0,
                array_type_size: 0,
                class_size: 0,
                thread_size: 0,
                thread_tid_offset: 0,
                thread_stack_ptr_offset: 0,
                thread_end_stack_offset: 0,
                class_instance_size_offset: 0,
                class_parent_offset: 0,
                class_token_offset: 0,
                class_fields_offset: 0,
                class_methods_offset: 0,
                class_method_count_offset: 0,
                class_this_arg_offset: 0,
                class_byval_arg_offset: 0,
                field_info_size: 0,
            },
        );
        runtime.class_init_callbacks.lock().unwrap().insert(
            7,
            ClassInitCallback {
                image: 0x1000,
                type_token: 0x0200_0001,
                index: 7,
                descriptor: "Foo.Bar".to_string(),
            },
        );

        let first = runtime.take_class_init_callback(7);
        assert!(first.is_some());
        assert!(runtime.take_class_init_callback(7).is_none());
    }

    #[test]
    fn notification_codes_round_trip() {
        assert_eq!(
            NotificationType::decode(NotificationType::ReloadSymtabs as u32 as u64),
            Some(NotificationType::ReloadSymtabs)
        );
        assert_eq!(NotificationType::decode(0), None);
        assert_eq!(NotificationType::decode(u64::MAX), None);
    }
}
