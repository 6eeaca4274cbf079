//! Type-2 memory window wrapper.

use std::{io, ptr::NonNull};

use rdma_sys::{ibv_alloc_mw, ibv_dealloc_mw, ibv_mw, ibv_mw_type};

use crate::{
    error::{log_last_os_err, log_ret_last_os_err},
    protection_domain::ProtectionDomain,
};

/// A type-2 memory window, bound and invalidated through the send queue.
pub(crate) struct MemoryWindow {
    /// Internal `ibv_mw` pointer
    inner_mw: NonNull<ibv_mw>,
}

impl MemoryWindow {
    /// Get the internal mw pointer
    pub(crate) const fn as_ptr(&self) -> *mut ibv_mw {
        self.inner_mw.as_ptr()
    }

    /// Allocate an unbound type-2 window on `pd`.
    pub(crate) fn alloc(pd: &ProtectionDomain) -> io::Result<Self> {
        // SAFETY: ffi
        let inner_mw =
            NonNull::new(unsafe {
                ibv_alloc_mw(pd.as_ptr(), ibv_mw_type::IBV_MW_TYPE_2).unwrap_or(std::ptr::null_mut())
            })
            .ok_or_else(log_ret_last_os_err)?;
        Ok(Self { inner_mw })
    }

    /// Current rkey of the window; changes on every bind.
    pub(crate) fn rkey(&self) -> u32 {
        // SAFETY: the window is alive
        unsafe { (*self.as_ptr()).rkey }
    }

    /// The rkey to hand a bind request: same index, bumped tag byte.
    pub(crate) fn next_rkey(&self) -> u32 {
        let cur = self.rkey();
        (cur & 0xFFFF_FF00) | (cur.wrapping_add(1) & 0xFF)
    }
}

impl Drop for MemoryWindow {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_dealloc_mw(self.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err();
        }
    }
}

unsafe impl Send for MemoryWindow {}

unsafe impl Sync for MemoryWindow {}
