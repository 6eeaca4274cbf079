//! Registered memory region backing the data plane.

use std::{io, ptr::NonNull};

use clippy_utilities::Cast;
use rdma_sys::{ibv_access_flags, ibv_dereg_mr, ibv_mr, ibv_reg_mr, ibv_sge};

use crate::{
    error::{log_last_os_err, log_ret_last_os_err},
    protection_domain::ProtectionDomain,
};

/// One registered buffer shared by every work request of the run.
///
/// The backing store is a `u64` slice so atomic operations always see an
/// 8-byte-aligned target address.
pub(crate) struct MemoryRegion {
    /// Backing buffer, kept alive for the lifetime of the registration
    buf: Box<[u64]>,
    /// Usable length in bytes
    len: usize,
    /// Internal `ibv_mr` pointer
    inner_mr: NonNull<ibv_mr>,
}

impl MemoryRegion {
    /// Get the internal mr pointer
    pub(crate) const fn as_ptr(&self) -> *mut ibv_mr {
        self.inner_mr.as_ptr()
    }

    /// Allocate a zeroed buffer of at least `len` bytes and register it with
    /// every access right the benchmark can exercise.
    pub(crate) fn register(pd: &ProtectionDomain, len: usize) -> io::Result<Self> {
        let words = len.div_ceil(8).max(1);
        let mut buf = vec![0_u64; words].into_boxed_slice();
        let access = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_READ
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC
            | ibv_access_flags::IBV_ACCESS_MW_BIND;
        // SAFETY: ffi; the buffer outlives the registration
        let inner_mr = NonNull::new(unsafe {
            ibv_reg_mr(
                pd.as_ptr(),
                buf.as_mut_ptr().cast(),
                words.wrapping_mul(8),
                access.0.cast(),
            )
        })
        .ok_or_else(log_ret_last_os_err)?;
        Ok(Self {
            buf,
            len,
            inner_mr,
        })
    }

    /// Starting address of the buffer.
    pub(crate) fn addr(&self) -> u64 {
        (self.buf.as_ptr() as usize).cast()
    }

    /// Local key of the registration.
    pub(crate) fn lkey(&self) -> u32 {
        // SAFETY: the registration is alive
        unsafe { (*self.as_ptr()).lkey }
    }

    /// Remote key of the registration.
    pub(crate) fn rkey(&self) -> u32 {
        // SAFETY: the registration is alive
        unsafe { (*self.as_ptr()).rkey }
    }

    /// Fill the first `len` bytes with `byte`.
    pub(crate) fn fill(&mut self, byte: u8) {
        // SAFETY: within the allocation; u64 backing store is POD
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(self.buf.as_mut_ptr().cast::<u8>(), self.len)
        };
        bytes.fill(byte);
    }

    /// Write raw bytes at the start of the buffer. Panics in debug builds if
    /// `data` does not fit.
    pub(crate) fn write_at_start(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= self.len, "payload larger than buffer");
        let n = data.len().min(self.len);
        // SAFETY: within the allocation
        let bytes =
            unsafe { std::slice::from_raw_parts_mut(self.buf.as_mut_ptr().cast::<u8>(), n) };
        bytes.copy_from_slice(&data[..n]);
    }

    /// Split the first `msg_size` bytes into `num_sge` scatter/gather
    /// elements. The last element absorbs the remainder.
    pub(crate) fn sge_list(&self, msg_size: usize, num_sge: u16) -> Vec<ibv_sge> {
        let num: usize = num_sge.max(1).cast();
        let chunk = (msg_size / num).max(1);
        let mut sges = Vec::with_capacity(num);
        let mut offset: usize = 0;
        for i in 0..num {
            let end = if i == num.wrapping_sub(1) {
                msg_size
            } else {
                (offset.wrapping_add(chunk)).min(msg_size)
            };
            sges.push(ibv_sge {
                addr: self.addr().wrapping_add(offset.cast()),
                length: end.wrapping_sub(offset).cast(),
                lkey: self.lkey(),
            });
            offset = end;
        }
        sges
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_dereg_mr(self.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err();
        }
    }
}

unsafe impl Send for MemoryRegion {}

unsafe impl Sync for MemoryRegion {}

#[cfg(test)]
mod tests {
    // sge splitting is pure arithmetic once the region exists; exercise it
    // through a fake region layout instead of real hardware
    #[test]
    fn sge_split_covers_message() {
        // mirror the splitting rule without a registration
        let split = |msg_size: usize, num: usize| -> Vec<(usize, usize)> {
            let chunk = (msg_size / num).max(1);
            let mut out = Vec::new();
            let mut offset = 0;
            for i in 0..num {
                let end = if i == num - 1 {
                    msg_size
                } else {
                    (offset + chunk).min(msg_size)
                };
                out.push((offset, end - offset));
                offset = end;
            }
            out
        };

        let parts = split(100, 3);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts.iter().map(|p| p.1).sum::<usize>(), 100);
        assert_eq!(parts.last().unwrap().1, 34);

        let tiny = split(2, 4);
        assert_eq!(tiny.iter().map(|p| p.1).sum::<usize>(), 2);
    }
}
