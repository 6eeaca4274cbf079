//! Work-request construction and the submission strategies.
//!
//! Three ways to hand a batch to the device: a linked `ibv_send_wr` chain
//! through the classic post call, the extensible per-operation API, or a
//! per-batch alternation between the two. The classic chain is pinned to the
//! plain send opcode; everything else rides the extensible path.

use std::{io, mem};

use clippy_utilities::Cast;
use rdma_sys::{
    ibv_access_flags, ibv_mw_bind_info, ibv_recv_wr, ibv_send_flags, ibv_send_wr,
    ibv_wr_atomic_cmp_swp, ibv_wr_atomic_fetch_add, ibv_wr_bind_mw, ibv_wr_complete,
    ibv_wr_local_inv, ibv_wr_opcode, ibv_wr_rdma_read, ibv_wr_rdma_write, ibv_wr_rdma_write_imm,
    ibv_wr_send, ibv_wr_send_imm, ibv_wr_send_inv, ibv_wr_set_inline_data, ibv_wr_set_sge,
    ibv_wr_set_sge_list, ibv_wr_set_ud_addr, ibv_wr_set_xrc_srqn, ibv_wr_start,
};

use crate::{
    config::{Config, Operation, PostApi, DEF_QKEY},
    error::log_ret_last_os_err_with_note,
    handshake::RemoteMemory,
    memory_region::MemoryRegion,
    memory_window::MemoryWindow,
    queue_pair::QueuePair,
    shared_receive_queue::SharedReceiveQueue,
    transport::TransportKind,
};

/// Work request id stamped on every benchmark submission.
pub(crate) const BENCH_WR_ID: u64 = 0xFE;
/// Immediate data carried by the `*Imm` opcodes.
const IMM_DATA: u32 = 0x0123_4567;
/// Operand of the fetch-and-add opcode.
const ATOMIC_ADD: u64 = 1;
/// Compare operand of the compare-and-swap opcode.
const ATOMIC_COMPARE: u64 = 0;
/// Swap operand of the compare-and-swap opcode.
const ATOMIC_SWAP: u64 = 1;
/// Ethertype stamped on raw-Ethernet frames (local experimental range).
const RAW_ETH_TYPE: u16 = 0x88B5;
/// Bytes of Ethernet framing at the front of a raw packet.
pub(crate) const RAW_ETH_HEADER_LEN: usize = 14;

/// Send-side submission engine for one run.
pub(crate) struct PostingEngine<'res> {
    /// Queue pair all batches go to
    qp: &'res QueuePair,
    /// The one registered buffer
    mr: &'res MemoryRegion,
    /// Memory window, present for the window opcodes
    mw: Option<&'res MemoryWindow>,
    /// Peer memory, present when the opcode targets remote memory
    remote: Option<RemoteMemory>,
    /// Peer queue pair number, for connectionless sends
    remote_qpn: u32,
    /// Operation of every work request
    opcode: Operation,
    /// Transport the queue pair runs
    transport: TransportKind,
    /// Configured strategy
    post_api: PostApi,
    /// Message size in bytes
    msg_size: usize,
    /// Scatter/gather elements per work request
    num_sge: u16,
    /// Copy the payload into the descriptor
    use_inline: bool,
    /// Alternating strategy: next batch takes the classic chain
    legacy_turn: bool,
}

impl<'res> PostingEngine<'res> {
    /// Assemble the engine from the run's resources.
    pub(crate) fn new(
        qp: &'res QueuePair,
        mr: &'res MemoryRegion,
        mw: Option<&'res MemoryWindow>,
        remote: Option<RemoteMemory>,
        remote_qpn: u32,
        cfg: &Config,
    ) -> Self {
        Self {
            qp,
            mr,
            mw,
            remote,
            remote_qpn,
            opcode: cfg.opcode,
            transport: cfg.transport,
            post_api: cfg.post_api,
            msg_size: cfg.msg_size,
            num_sge: cfg.num_sge,
            use_inline: cfg.use_inline,
            legacy_turn: true,
        }
    }

    /// Completions one iteration produces on the send queue. Invalidation
    /// rides behind a bind, so that opcode completes twice.
    pub(crate) fn completions_per_iteration(&self) -> u32 {
        if matches!(self.opcode, Operation::LocalInv) {
            2
        } else {
            1
        }
    }

    /// Submit one batch of `n` work requests.
    pub(crate) fn post_batch(&mut self, n: u16) -> io::Result<()> {
        let take_legacy = match self.post_api {
            PostApi::Legacy => true,
            PostApi::Extensible => false,
            PostApi::Alternating => {
                let turn = self.legacy_turn;
                self.legacy_turn = !turn;
                turn
            }
        };
        if take_legacy {
            self.post_batch_legacy(n)
        } else {
            self.post_batch_extensible(n)
        }
    }

    /// Classic path: one linked chain, one post call, send opcode only.
    fn post_batch_legacy(&self, n: u16) -> io::Result<()> {
        let n: usize = n.cast();
        let per_wr: usize = self.num_sge.cast();
        let mut sges = Vec::with_capacity(n.wrapping_mul(per_wr));
        for _ in 0..n {
            sges.extend(self.mr.sge_list(self.msg_size, self.num_sge));
        }
        // SAFETY: POD FFI type; built element-wise, the descriptor carries
        // no Clone
        let mut wrs: Vec<ibv_send_wr> = (0..n)
            .map(|_| unsafe { mem::zeroed::<ibv_send_wr>() })
            .collect();
        let mut flags = ibv_send_flags::IBV_SEND_SIGNALED;
        if self.use_inline {
            flags |= ibv_send_flags::IBV_SEND_INLINE;
        }
        for (i, wr) in wrs.iter_mut().enumerate() {
            wr.wr_id = BENCH_WR_ID;
            wr.sg_list = sges.as_mut_ptr().wrapping_add(i.wrapping_mul(per_wr));
            wr.num_sge = self.num_sge.cast();
            wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
            wr.send_flags = flags.0;
            if self.transport.needs_ah() {
                if let Some(ah) = self.qp.ah_ptr() {
                    // SAFETY: write into a zeroed union arm
                    unsafe {
                        wr.wr.ud.ah = ah;
                        wr.wr.ud.remote_qpn = self.remote_qpn;
                        wr.wr.ud.remote_qkey = DEF_QKEY;
                    }
                }
            }
            if matches!(self.transport, TransportKind::XrcSend) {
                if let Some(remote) = self.remote {
                    // SAFETY: write into a zeroed union arm
                    unsafe {
                        wr.qp_type.xrc.remote_srqn = remote.srq_num;
                    }
                }
            }
        }
        // link the chain after the vector stopped reallocating
        for i in 1..n {
            let next: *mut ibv_send_wr = std::ptr::addr_of_mut!(wrs[i]);
            wrs[i.wrapping_sub(1)].next = next;
        }
        self.qp.post_send(&mut wrs[0])
    }

    /// Extensible path: one submission session per batch.
    #[allow(clippy::too_many_lines)]
    fn post_batch_extensible(&self, n: u16) -> io::Result<()> {
        let qp_ex = self.qp.qp_ex_ptr().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "extensible submission needs an extended queue pair",
            )
        })?;
        let sges = self.mr.sge_list(self.msg_size, self.num_sge);
        // SAFETY: ffi between wr_start and wr_complete; every pointer handed
        // to the device lives past the complete call
        unsafe {
            ibv_wr_start(qp_ex);
            for _ in 0..n {
                (*qp_ex).wr_id = BENCH_WR_ID;
                (*qp_ex).wr_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
                match self.opcode {
                    Operation::Send => ibv_wr_send(qp_ex),
                    Operation::SendImm => ibv_wr_send_imm(qp_ex, IMM_DATA),
                    Operation::SendInv => {
                        let rkey = self.remote_rkey()?;
                        ibv_wr_send_inv(qp_ex, rkey);
                    }
                    Operation::Write => {
                        let remote = self.remote_memory()?;
                        ibv_wr_rdma_write(qp_ex, remote.rkey, remote.addr);
                    }
                    Operation::WriteImm => {
                        let remote = self.remote_memory()?;
                        ibv_wr_rdma_write_imm(qp_ex, remote.rkey, remote.addr, IMM_DATA);
                    }
                    Operation::Read => {
                        let remote = self.remote_memory()?;
                        ibv_wr_rdma_read(qp_ex, remote.rkey, remote.addr);
                    }
                    Operation::FetchAdd => {
                        let remote = self.remote_memory()?;
                        ibv_wr_atomic_fetch_add(qp_ex, remote.rkey, remote.addr, ATOMIC_ADD);
                    }
                    Operation::CmpSwap => {
                        let remote = self.remote_memory()?;
                        ibv_wr_atomic_cmp_swp(
                            qp_ex,
                            remote.rkey,
                            remote.addr,
                            ATOMIC_COMPARE,
                            ATOMIC_SWAP,
                        );
                    }
                    Operation::BindMw => {
                        self.wr_bind_window(qp_ex)?;
                    }
                    Operation::LocalInv => {
                        let bound_rkey = self.wr_bind_window(qp_ex)?;
                        (*qp_ex).wr_id = BENCH_WR_ID;
                        (*qp_ex).wr_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
                        ibv_wr_local_inv(qp_ex, bound_rkey);
                    }
                }
                if self.opcode.carries_payload() {
                    if self.use_inline {
                        ibv_wr_set_inline_data(
                            qp_ex,
                            self.mr.addr() as usize as *mut libc::c_void,
                            self.msg_size,
                        );
                    } else if sges.len() == 1 {
                        ibv_wr_set_sge(qp_ex, sges[0].lkey, sges[0].addr, sges[0].length);
                    } else {
                        ibv_wr_set_sge_list(qp_ex, sges.len(), sges.as_ptr());
                    }
                    if self.transport.needs_ah() {
                        if let Some(ah) = self.qp.ah_ptr() {
                            ibv_wr_set_ud_addr(qp_ex, ah, self.remote_qpn, DEF_QKEY);
                        }
                    }
                    if matches!(self.transport, TransportKind::XrcSend) {
                        if let Some(remote) = self.remote {
                            ibv_wr_set_xrc_srqn(qp_ex, remote.srq_num);
                        }
                    }
                }
            }
            let errno = ibv_wr_complete(qp_ex);
            if errno != 0_i32 {
                return Err(log_ret_last_os_err_with_note("submission session"));
            }
        }
        Ok(())
    }

    /// Queue a bind of the window over the local region; returns the rkey
    /// the bind installs.
    ///
    /// # Safety
    /// Must run between `ibv_wr_start` and `ibv_wr_complete` on `qp_ex`.
    unsafe fn wr_bind_window(&self, qp_ex: *mut rdma_sys::ibv_qp_ex) -> io::Result<u32> {
        let mw = self.mw.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "window opcode without an allocated memory window",
            )
        })?;
        // SAFETY: inside the caller's submission session
        Ok(unsafe { queue_window_bind(qp_ex, mw, self.mr, self.msg_size) })
    }

    /// Peer memory for the one-sided opcodes.
    fn remote_memory(&self) -> io::Result<RemoteMemory> {
        self.remote.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "remote-access opcode without peer memory",
            )
        })
    }

    /// Peer rkey for send-with-invalidate.
    fn remote_rkey(&self) -> io::Result<u32> {
        Ok(self.remote_memory()?.rkey)
    }
}

impl Operation {
    /// Window maintenance opcodes carry no data segment.
    pub(crate) fn carries_payload(self) -> bool {
        !matches!(self, Self::BindMw | Self::LocalInv)
    }
}

/// Queue a bind work request for `mw` over the region's first `msg_size`
/// bytes; returns the rkey the bind installs.
///
/// # Safety
/// Must run between `ibv_wr_start` and `ibv_wr_complete` on `qp_ex`.
unsafe fn queue_window_bind(
    qp_ex: *mut rdma_sys::ibv_qp_ex,
    mw: &MemoryWindow,
    mr: &MemoryRegion,
    msg_size: usize,
) -> u32 {
    let access = ibv_access_flags::IBV_ACCESS_REMOTE_READ
        | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
        | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC;
    let bind_info = ibv_mw_bind_info {
        mr: mr.as_ptr(),
        addr: mr.addr(),
        length: msg_size.cast(),
        mw_access_flags: access.0,
    };
    let new_rkey = mw.next_rkey();
    // SAFETY: inside the caller's submission session
    unsafe { ibv_wr_bind_mw(qp_ex, mw.as_ptr(), new_rkey, &bind_info) };
    new_rkey
}

/// Bind `mw` in a submission session of its own. The receiving side of a
/// send-with-invalidate run arms its window this way before the ready
/// barrier; the resulting completion must be drained before real counting
/// begins.
pub(crate) fn bind_window(
    qp: &QueuePair,
    mw: &MemoryWindow,
    mr: &MemoryRegion,
    msg_size: usize,
) -> io::Result<u32> {
    let qp_ex = qp.qp_ex_ptr().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "window bind needs an extended queue pair",
        )
    })?;
    // SAFETY: ffi; one complete submission session
    unsafe {
        ibv_wr_start(qp_ex);
        (*qp_ex).wr_id = BENCH_WR_ID;
        (*qp_ex).wr_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        let rkey = queue_window_bind(qp_ex, mw, mr, msg_size);
        let errno = ibv_wr_complete(qp_ex);
        if errno != 0_i32 {
            return Err(log_ret_last_os_err_with_note("window bind session"));
        }
        Ok(rkey)
    }
}

/// Where a receive work request lands.
pub(crate) enum RecvTarget<'res> {
    /// The queue pair's own receive queue
    Qp(&'res QueuePair),
    /// A shared receive queue
    Srq(&'res SharedReceiveQueue),
}

/// Receive-side posting helper.
pub(crate) struct RecvPoster<'res> {
    /// Destination queue
    target: RecvTarget<'res>,
    /// The registered buffer receives land in
    mr: &'res MemoryRegion,
    /// Message size in bytes
    msg_size: usize,
    /// Scatter/gather elements per work request
    num_sge: u16,
}

impl<'res> RecvPoster<'res> {
    /// Assemble a poster over `target`.
    pub(crate) fn new(
        target: RecvTarget<'res>,
        mr: &'res MemoryRegion,
        msg_size: usize,
        num_sge: u16,
    ) -> Self {
        Self {
            target,
            mr,
            msg_size,
            num_sge,
        }
    }

    /// Post `n` receive work requests one by one.
    pub(crate) fn post(&self, n: u32) -> io::Result<()> {
        for _ in 0..n {
            let mut sges = self.mr.sge_list(self.msg_size, self.num_sge);
            // SAFETY: POD FFI type
            let mut wr = unsafe { mem::zeroed::<ibv_recv_wr>() };
            wr.wr_id = BENCH_WR_ID;
            wr.sg_list = sges.as_mut_ptr();
            wr.num_sge = self.num_sge.cast();
            match self.target {
                RecvTarget::Qp(qp) => qp.post_recv(&mut wr)?,
                RecvTarget::Srq(srq) => srq.post_recv(&mut wr)?,
            }
        }
        Ok(())
    }
}

/// Stamp the Ethernet framing a raw packet run sends: destination MAC,
/// source MAC, ethertype.
pub(crate) fn write_eth_header(mr: &mut MemoryRegion, dst: [u8; 6], src: [u8; 6]) {
    let mut header = [0_u8; RAW_ETH_HEADER_LEN];
    header[..6].copy_from_slice(&dst);
    header[6..12].copy_from_slice(&src);
    header[12..].copy_from_slice(&RAW_ETH_TYPE.to_be_bytes());
    mr.write_at_start(&header);
}

#[cfg(test)]
mod tests {
    use crate::config::Operation;

    #[test]
    fn window_opcodes_carry_no_payload() {
        assert!(!Operation::BindMw.carries_payload());
        assert!(!Operation::LocalInv.carries_payload());
        assert!(Operation::SendInv.carries_payload());
        assert!(Operation::Send.carries_payload());
        assert!(Operation::Read.carries_payload());
    }
}
