//! Executable memory and the host/guest control-transfer thunks.
//!
//! [`JitRuntime`] owns everything with process-scoped lifetime: the
//! executable buffer, the immutable [`RegisterMap`], the shared
//! [`CodeCache`], and two thunks: the call thunk (host into translated code)
//! and the finale (translated code back to host). Both are constructed once in
//! [`JitRuntime::new`] and reached only through the runtime; there is no
//! global state.
//!
//! The buffer is mapped read+write+execute for the process lifetime. Blocks
//! are appended while earlier blocks remain callable from other threads, and
//! generated code is never collected, so a W^X flip per append would
//! serialize all execution for no benefit here (see DESIGN.md).

use std::io;
use std::ptr;
use std::sync::Mutex;

use thiserror::Error;

use espresso_cpu::Core;

use crate::block::{
    translate_unit, BlockDecoder, BlockLimits, CodePtr, JitBlock, TranslateError,
};
use crate::cache::CodeCache;
use crate::emit::Assembler;
use crate::regs::{HostReg, RegisterMap};

/// Default executable buffer capacity.
const DEFAULT_CODE_CAPACITY: usize = 64 * 1024 * 1024;

/// Signature of the call thunk: `(core, membase, entry) -> next guest
/// address`. SysV: core in RDI, membase in RSI, entry in RDX.
pub type CallThunkFn = unsafe extern "sysv64" fn(*mut Core, *mut u8, *const u8) -> u32;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to map executable memory")]
    Map(#[source] io::Error),
    #[error("executable buffer exhausted: need {needed} bytes, {remaining} remaining")]
    OutOfCodeMemory { needed: usize, remaining: usize },
    #[error("thunk generation failed")]
    Thunk(#[from] crate::emit::CodegenError),
    #[error(transparent)]
    Translate(#[from] TranslateError),
}

/// Anonymous RWX mapping with an append-only cursor. Pointers handed out are
/// stable for the life of the runtime.
pub struct ExecBuffer {
    ptr: *mut u8,
    capacity: usize,
    cursor: Mutex<usize>,
}

// SAFETY: the mapping is owned exclusively and the cursor is mutex-guarded;
// published code bytes are never rewritten.
unsafe impl Send for ExecBuffer {}
unsafe impl Sync for ExecBuffer {}

impl ExecBuffer {
    pub fn new(capacity: usize) -> Result<Self, RuntimeError> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let capacity = (capacity + page - 1) & !(page - 1);

        // SAFETY: anonymous private mapping, no file backing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(RuntimeError::Map(io::Error::last_os_error()));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            capacity,
            cursor: Mutex::new(0),
        })
    }

    /// Copy `code` into the buffer, returning the address of the copy.
    pub fn append(&self, code: &[u8]) -> Result<CodePtr, RuntimeError> {
        let mut cursor = self.cursor.lock().unwrap();
        let aligned = (*cursor + 15) & !15;
        if aligned + code.len() > self.capacity {
            return Err(RuntimeError::OutOfCodeMemory {
                needed: code.len(),
                remaining: self.capacity.saturating_sub(aligned),
            });
        }
        // SAFETY: range checked against capacity above; cursor lock makes the
        // reservation exclusive.
        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), self.ptr.add(aligned), code.len());
        }
        *cursor = aligned + code.len();
        Ok(CodePtr::from_addr(self.ptr as usize + aligned))
    }

    pub fn used(&self) -> usize {
        *self.cursor.lock().unwrap()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for ExecBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr/capacity came from the successful mmap in `new`.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.capacity);
        }
    }
}

/// Process-scoped translation and execution state.
pub struct JitRuntime {
    map: RegisterMap,
    cache: CodeCache,
    buf: ExecBuffer,
    call_thunk: CodePtr,
    finale: CodePtr,
}

impl JitRuntime {
    pub fn new() -> Result<Self, RuntimeError> {
        Self::with_capacity(DEFAULT_CODE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Result<Self, RuntimeError> {
        let map = RegisterMap::new();
        let buf = ExecBuffer::new(capacity)?;

        // Finale: translated code arrives here by `jmp` with `nia` already
        // stored; recover the host frame set up by the call thunk and hand
        // the resume address back as the return value.
        let mut asm = Assembler::new();
        asm.load(HostReg::Rax, map.nia());
        for reg in [
            HostReg::R15,
            HostReg::R14,
            HostReg::R13,
            HostReg::R12,
            HostReg::Rbp,
            HostReg::Rbx,
        ] {
            asm.pop_reg(reg);
        }
        asm.ret();
        let finale = buf.append(&asm.finish()?)?;

        // Call thunk (SysV: rdi = core, rsi = membase, rdx = entry): spill
        // callee-saved registers, establish the fixed roles, transfer into
        // the block. `membase` already arrives in its role register.
        let mut asm = Assembler::new();
        for reg in [
            HostReg::Rbx,
            HostReg::Rbp,
            HostReg::R12,
            HostReg::R13,
            HostReg::R14,
            HostReg::R15,
        ] {
            asm.push_reg(reg);
        }
        asm.mov_reg(map.context, HostReg::Rdi);
        asm.jmp_reg(HostReg::Rdx);
        let call_thunk = buf.append(&asm.finish()?)?;

        Ok(Self {
            map,
            cache: CodeCache::new(),
            buf,
            call_thunk,
            finale,
        })
    }

    pub fn register_map(&self) -> &RegisterMap {
        &self.map
    }

    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    /// Address terminal instructions transfer to after storing `nia`.
    pub fn finale(&self) -> CodePtr {
        self.finale
    }

    /// Translate the unit starting at `start`, or return the block already
    /// cached for it. Concurrent callers for the same address race to a
    /// single insertion; the loser's translation is discarded whole.
    pub fn translate<D: BlockDecoder>(
        &self,
        start: u32,
        decoder: &mut D,
        limits: BlockLimits,
    ) -> Result<std::sync::Arc<JitBlock>, RuntimeError> {
        if let Some(existing) = self.cache.block_at(start) {
            return Ok(existing);
        }

        let pending = translate_unit(start, decoder, &self.map, limits)?;
        let base = self.buf.append(&pending.code)?;
        let block = pending.into_block(base.addr());
        let (winner, _inserted) = self.cache.insert(block);
        Ok(winner)
    }

    /// Compiled entry for `address`, or `None` if untranslated.
    pub fn lookup(&self, address: u32) -> Option<CodePtr> {
        self.cache.lookup(address)
    }

    /// Transfer control into translated code.
    ///
    /// Returns the next guest address to execute.
    ///
    /// # Safety
    ///
    /// `entry` must be an entry produced by this runtime, `membase` must
    /// point at the guest flat-memory image, and `core` must be the state of
    /// the calling guest thread.
    pub unsafe fn call(&self, core: &mut Core, membase: *mut u8, entry: CodePtr) -> u32 {
        let thunk: CallThunkFn = core::mem::transmute(self.call_thunk.as_ptr());
        thunk(core as *mut Core, membase, entry.as_ptr())
    }
}
