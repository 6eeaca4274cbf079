//! Shared receive queue for the receive-only transport halves.

use std::{io, ptr::NonNull};

use rdma_sys::{
    ibv_create_srq_ex, ibv_destroy_srq, ibv_get_srq_num, ibv_post_srq_recv, ibv_recv_wr, ibv_srq,
    ibv_srq_init_attr_mask, ibv_srq_init_attr_ex, ibv_srq_type,
};

use crate::{
    completion_queue::CompletionQueue,
    context::Context,
    error::{log_last_os_err, log_ret_last_os_err, log_ret_last_os_err_with_note},
    protection_domain::ProtectionDomain,
    xrc_domain::XrcDomain,
};

/// Shared receive queue backing the DC-target and XRC-receive halves.
///
/// Always created XRC-typed: only that type answers `ibv_get_srq_num`, and
/// the sending half needs the number either way.
pub(crate) struct SharedReceiveQueue {
    /// Internal `ibv_srq` pointer
    inner_srq: NonNull<ibv_srq>,
}

impl SharedReceiveQueue {
    /// Get the internal srq pointer
    pub(crate) const fn as_ptr(&self) -> *mut ibv_srq {
        self.inner_srq.as_ptr()
    }

    /// Create a queue deep enough for the whole pipeline window, tied to
    /// the XRC domain and draining its completions into `cq`.
    pub(crate) fn create(
        ctx: &Context,
        pd: &ProtectionDomain,
        xrcd: &XrcDomain,
        cq: &CompletionQueue,
        max_wr: u32,
        max_sge: u32,
    ) -> io::Result<Self> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { std::mem::zeroed::<ibv_srq_init_attr_ex>() };
        attr.attr.max_wr = max_wr;
        attr.attr.max_sge = max_sge;
        attr.srq_type = ibv_srq_type::IBV_SRQT_XRC;
        attr.pd = pd.as_ptr();
        attr.xrcd = xrcd.as_ptr();
        attr.cq = cq.as_ptr();
        attr.comp_mask = (ibv_srq_init_attr_mask::IBV_SRQ_INIT_ATTR_TYPE
            | ibv_srq_init_attr_mask::IBV_SRQ_INIT_ATTR_PD
            | ibv_srq_init_attr_mask::IBV_SRQ_INIT_ATTR_XRCD
            | ibv_srq_init_attr_mask::IBV_SRQ_INIT_ATTR_CQ)
            .0;
        // SAFETY: ffi
        let inner_srq = unsafe { ibv_create_srq_ex(ctx.as_ptr(), &mut attr) }
            .and_then(NonNull::new)
            .ok_or_else(|| log_ret_last_os_err_with_note("extended shared receive queue creation"))?;
        Ok(Self { inner_srq })
    }

    /// The queue number the sending half targets.
    pub(crate) fn srq_num(&self) -> io::Result<u32> {
        let mut num: u32 = 0;
        // SAFETY: ffi
        let errno = unsafe { ibv_get_srq_num(self.as_ptr(), &mut num) };
        if errno != 0_i32 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(num)
    }

    /// Submit one receive work request.
    pub(crate) fn post_recv(&self, wr: &mut ibv_recv_wr) -> io::Result<()> {
        let mut bad_wr = std::ptr::null_mut::<ibv_recv_wr>();
        // SAFETY: ffi; the sge list in `wr` points into a live registration
        let errno = unsafe { ibv_post_srq_recv(self.as_ptr(), wr, &mut bad_wr) };
        if errno != 0_i32 {
            return Err(log_ret_last_os_err());
        }
        Ok(())
    }
}

impl Drop for SharedReceiveQueue {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_destroy_srq(self.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err();
        }
    }
}

unsafe impl Send for SharedReceiveQueue {}

unsafe impl Sync for SharedReceiveQueue {}
