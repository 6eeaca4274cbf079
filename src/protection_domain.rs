//! Protection domain wrapper.

use std::{io, ptr::NonNull};

use rdma_sys::{ibv_alloc_pd, ibv_dealloc_pd, ibv_pd};

use crate::{
    context::Context,
    error::{log_last_os_err, log_ret_last_os_err},
};

/// Protection domain all memory regions, windows and queue pairs of one run
/// are allocated under.
pub(crate) struct ProtectionDomain {
    /// Internal `ibv_pd` pointer
    inner_pd: NonNull<ibv_pd>,
}

impl ProtectionDomain {
    /// Get the internal pd pointer
    pub(crate) const fn as_ptr(&self) -> *mut ibv_pd {
        self.inner_pd.as_ptr()
    }

    /// Allocate a protection domain on `ctx`.
    pub(crate) fn create(ctx: &Context) -> io::Result<Self> {
        // SAFETY: ffi
        let inner_pd =
            NonNull::new(unsafe { ibv_alloc_pd(ctx.as_ptr()) }).ok_or_else(log_ret_last_os_err)?;
        Ok(Self { inner_pd })
    }
}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_dealloc_pd(self.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err();
        }
    }
}

unsafe impl Send for ProtectionDomain {}

unsafe impl Sync for ProtectionDomain {}
