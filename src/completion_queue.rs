//! Completion queue wrapper and work-completion status taxonomy.

use std::{fmt::Debug, io, mem, ptr::NonNull};

use clippy_utilities::Cast;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use rdma_sys::{ibv_cq, ibv_create_cq, ibv_destroy_cq, ibv_poll_cq, ibv_wc, ibv_wc_status};
use thiserror::Error;
use tracing::error;

use crate::{
    context::Context,
    error::{log_last_os_err, log_ret_last_os_err},
};

/// Completion queue shared by the send and receive sides of the benchmark
/// queue pair. Polled synchronously, never armed for events.
pub(crate) struct CompletionQueue {
    /// Internal `ibv_cq` pointer
    inner_cq: NonNull<ibv_cq>,
}

impl CompletionQueue {
    /// Get the internal cq ptr
    pub(crate) const fn as_ptr(&self) -> *mut ibv_cq {
        self.inner_cq.as_ptr()
    }

    /// Create a completion queue with room for `cq_size` entries.
    ///
    /// On failure of `ibv_create_cq`, errno indicates the failure reason:
    ///
    /// `EINVAL`    Invalid cqe, channel or `comp_vector`
    ///
    /// `ENOMEM`    Not enough resources to complete this operation
    pub(crate) fn create(ctx: &Context, cq_size: u32) -> io::Result<Self> {
        // SAFETY: ffi
        let inner_cq = NonNull::new(unsafe {
            ibv_create_cq(
                ctx.as_ptr(),
                cq_size.cast(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                0_i32,
            )
        })
        .ok_or_else(log_ret_last_os_err)?;
        Ok(Self { inner_cq })
    }

    /// Drain up to `wc_buf.len()` completions without blocking.
    ///
    /// Returns the number of entries written into the front of `wc_buf`;
    /// zero means nothing has completed yet. A negative poll return is a
    /// device error and fatal.
    pub(crate) fn poll(&self, wc_buf: &mut [WorkCompletion]) -> io::Result<usize> {
        if wc_buf.is_empty() {
            return Ok(0);
        }
        // SAFETY: ffi; `WorkCompletion` is repr(C) over `ibv_wc`
        let n = unsafe {
            ibv_poll_cq(self.as_ptr(), wc_buf.len().cast(), wc_buf.as_mut_ptr().cast())
        };
        if n < 0_i32 {
            error!("poll returned {n}");
            return Err(io::Error::new(io::ErrorKind::Other, "completion poll failed"));
        }
        Ok(n.cast())
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_destroy_cq(self.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err();
        }
    }
}

unsafe impl Send for CompletionQueue {}

unsafe impl Sync for CompletionQueue {}

/// Work completion
#[repr(C)]
pub(crate) struct WorkCompletion {
    /// The internal ibv work completion
    inner_wc: ibv_wc,
}

impl WorkCompletion {
    /// Work request id carried through from the submission.
    pub(crate) const fn wr_id(&self) -> u64 {
        self.inner_wc.wr_id
    }

    /// Success or the classified failure status.
    pub(crate) fn result(&self) -> Result<(), WcError> {
        if self.inner_wc.status == ibv_wc_status::IBV_WC_SUCCESS {
            Ok(())
        } else {
            error!("error wc wrid : {}", self.inner_wc.wr_id);
            Err(WcError::from_u32(self.inner_wc.status).unwrap_or(WcError::Unexpected))
        }
    }
}

impl Debug for WorkCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkCompletion")
            .field("wr_id", &self.wr_id())
            .field("status", &self.inner_wc.status)
            .finish()
    }
}

impl Default for WorkCompletion {
    fn default() -> Self {
        Self {
            // SAFETY: POD FFI type
            inner_wc: unsafe { mem::zeroed() },
        }
    }
}

/// Non-success work completion statuses.
#[allow(clippy::missing_docs_in_private_items)]
#[derive(Error, Debug, FromPrimitive, Copy, Clone)]
pub(crate) enum WcError {
    #[error("local length error: the posted message or receive buffer exceeds what the port or queue supports")]
    LocLen = 1,
    #[error("local QP operation error: internal consistency error while processing the work request")]
    LocQpOp = 2,
    #[error("local EE context operation error")]
    LocEecOp = 3,
    #[error("local protection error: a scatter/gather entry does not reference a valid memory region")]
    LocProt = 4,
    #[error("work request flushed: the queue pair transitioned into the error state with this request outstanding")]
    WrFlush = 5,
    #[error("memory window binding failed")]
    MwBind = 6,
    #[error("bad response: unexpected transport layer opcode from the responder")]
    BadResp = 7,
    #[error("local access error on an incoming RDMA write with immediate")]
    LocAccess = 8,
    #[error("remote invalid request: the responder rejected the message, check its access flags and buffering")]
    RemInvReq = 9,
    #[error("remote access error: protection failure on the remote buffer")]
    RemAccess = 10,
    #[error("remote operation error: the responder could not complete the request")]
    RemOp = 11,
    #[error("transport retry counter exceeded: no ack from the remote side, connection attributes may be wrong")]
    RetryExc = 12,
    #[error("RNR retry counter exceeded: the remote receive queue stayed empty")]
    RnrRetryExc = 13,
    #[error("local RDD violation error")]
    LocRddViol = 14,
    #[error("remote invalid RD request")]
    RemInvRdReq = 15,
    #[error("remote aborted the operation")]
    RemAbort = 16,
    #[error("invalid EE context number")]
    InvEecn = 17,
    #[error("invalid EE context state")]
    InvEecState = 18,
    #[error("fatal error")]
    Fatal = 19,
    #[error("response timeout")]
    RespTimeout = 20,
    #[error("general error")]
    General = 21,
    #[error("unexpected completion status")]
    Unexpected = 100,
}

impl From<WcError> for io::Error {
    #[inline]
    fn from(e: WcError) -> Self {
        Self::new(io::ErrorKind::Other, e)
    }
}

#[cfg(test)]
mod tests {
    use num_traits::FromPrimitive;

    use super::WcError;

    #[test]
    fn status_codes_map_to_errors() {
        assert!(matches!(WcError::from_u32(12), Some(WcError::RetryExc)));
        assert!(matches!(WcError::from_u32(5), Some(WcError::WrFlush)));
        assert!(WcError::from_u32(77).is_none());
    }
}
