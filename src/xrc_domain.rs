//! XRC domain the receive-only transport halves hang their queues off.

use std::{io, mem, ptr::NonNull};

use rdma_sys::{
    ibv_close_xrcd, ibv_open_xrcd, ibv_xrcd, ibv_xrcd_init_attr, ibv_xrcd_init_attr_mask,
};

use crate::{
    context::Context,
    error::{log_last_os_err, log_ret_last_os_err_with_note},
};

/// An opened XRC domain. The XRC-typed shared receive queue and the XRC
/// receive queue pair both reference it instead of a protection domain.
pub(crate) struct XrcDomain {
    /// Internal `ibv_xrcd` pointer
    inner_xrcd: NonNull<ibv_xrcd>,
}

impl XrcDomain {
    /// Get the internal xrcd pointer
    pub(crate) const fn as_ptr(&self) -> *mut ibv_xrcd {
        self.inner_xrcd.as_ptr()
    }

    /// Open an anonymous process-private domain. Passing no file descriptor
    /// with `O_CREAT` asks the driver for a fresh domain instead of sharing
    /// one through the filesystem.
    pub(crate) fn open(ctx: &Context) -> io::Result<Self> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { mem::zeroed::<ibv_xrcd_init_attr>() };
        attr.comp_mask = (ibv_xrcd_init_attr_mask::IBV_XRCD_INIT_ATTR_FD
            | ibv_xrcd_init_attr_mask::IBV_XRCD_INIT_ATTR_OFLAGS)
            .0;
        attr.fd = -1_i32;
        attr.oflags = libc::O_CREAT;
        // SAFETY: ffi
        let inner_xrcd = unsafe { ibv_open_xrcd(ctx.as_ptr(), &mut attr) }
            .and_then(NonNull::new)
            .ok_or_else(|| log_ret_last_os_err_with_note("XRC domain open"))?;
        Ok(Self { inner_xrcd })
    }
}

impl Drop for XrcDomain {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_close_xrcd(self.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err();
        }
    }
}

unsafe impl Send for XrcDomain {}

unsafe impl Sync for XrcDomain {}
