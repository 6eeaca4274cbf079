//! Queue pair creation and the connection state machine.
//!
//! A queue pair walks Reset -> Init -> RTR (-> RTS for the initiating role);
//! each transition carries exactly the attribute mask its transport kind
//! needs. A failed transition leaves the queue pair in its previous state
//! and is fatal to the run.

use std::{io, mem, ptr::NonNull};

use clippy_utilities::Cast;
use rdma_sys::{
    ibv_ah, ibv_ah_attr, ibv_create_ah, ibv_create_flow, ibv_create_qp, ibv_create_qp_ex,
    ibv_destroy_ah, ibv_destroy_flow, ibv_destroy_qp, ibv_flow, ibv_flow_attr, ibv_flow_attr_type,
    ibv_flow_spec_eth, ibv_flow_spec_type, ibv_modify_qp, ibv_mtu, ibv_post_recv, ibv_post_send,
    ibv_qp, ibv_qp_attr, ibv_qp_attr_mask, ibv_qp_create_send_ops_flags, ibv_qp_ex,
    ibv_qp_init_attr, ibv_qp_init_attr_ex, ibv_qp_init_attr_mask, ibv_qp_state, ibv_qp_to_qp_ex,
    ibv_recv_wr, ibv_send_wr,
};

use crate::{
    completion_queue::CompletionQueue,
    config::{Config, Operation, PostApi, DEF_QKEY, IB_PORT},
    context::Context,
    error::{log_last_os_err, log_ret_last_os_err, log_ret_last_os_err_with_note},
    protection_domain::ProtectionDomain,
    shared_receive_queue::SharedReceiveQueue,
    transport::TransportKind,
    xrc_domain::XrcDomain,
};

/// Path MTU used on every connected transport.
const DEFAULT_MTU: u32 = ibv_mtu::IBV_MTU_1024;
/// Receive queue packet sequence number
const DEFAULT_RQ_PSN: u32 = 0;
/// Send queue packet sequence number
const DEFAULT_SQ_PSN: u32 = 0;
/// Minimum RNR NAK timer
const DEFAULT_MIN_RNR_TIMER: u8 = 0x10;
/// Local ACK timeout, expressed as 4.096us * 2^timeout
const DEFAULT_TIMEOUT: u8 = 0x10;
/// Send retry counter
const DEFAULT_RETRY_CNT: u8 = 7;
/// RNR NAK retry counter; 7 means infinite
const DEFAULT_RNR_RETRY: u8 = 7;
/// Outstanding RDMA read / atomic budget, both directions
const DEFAULT_MAX_RD_ATOMIC: u8 = 1;

/// The benchmark queue pair plus the per-transport helpers it owns.
pub(crate) struct QueuePair {
    /// Internal `ibv_qp` pointer
    inner_qp: NonNull<ibv_qp>,
    /// Extended submission context, present when the run uses the
    /// extensible post API
    qp_ex: Option<NonNull<ibv_qp_ex>>,
    /// Transport kind fixed at creation
    transport: TransportKind,
    /// Address handle for connectionless initiators
    ah: Option<AddressHandle>,
    /// Steering rule for raw-Ethernet receive
    flow: Option<FlowRule>,
}

impl QueuePair {
    /// Get the internal qp pointer
    pub(crate) const fn as_ptr(&self) -> *mut ibv_qp {
        self.inner_qp.as_ptr()
    }

    /// Extended submission context, if the queue pair was created with one.
    pub(crate) fn qp_ex_ptr(&self) -> Option<*mut ibv_qp_ex> {
        self.qp_ex.map(NonNull::as_ptr)
    }

    /// Queue pair number advertised to the peer.
    pub(crate) fn qp_num(&self) -> u32 {
        // SAFETY: the queue pair is alive
        unsafe { (*self.as_ptr()).qp_num }
    }

    /// Address handle of a connectionless initiator, set by
    /// [`Self::create_ah`].
    pub(crate) fn ah_ptr(&self) -> Option<*mut ibv_ah> {
        self.ah.as_ref().map(AddressHandle::as_ptr)
    }

    /// Create the queue pair in the Reset state.
    ///
    /// The legacy post API goes through `ibv_create_qp`; the extensible
    /// strategies need `ibv_create_qp_ex` so the send-operation flags for
    /// the configured opcode are declared up front. The XRC receive half
    /// always takes the extended call: its creation attribute is the XRC
    /// domain, which the legacy call cannot carry.
    pub(crate) fn create(
        ctx: &Context,
        pd: &ProtectionDomain,
        cq: &CompletionQueue,
        srq: Option<&SharedReceiveQueue>,
        xrcd: Option<&XrcDomain>,
        cfg: &Config,
    ) -> io::Result<Self> {
        let uses_ex = !matches!(cfg.post_api, PostApi::Legacy);
        // SRQ-backed halves never send, so they skip the send-operation
        // declaration and the extended submission handle
        let sends = !cfg.transport.uses_srq();
        let inner_qp = if matches!(cfg.transport, TransportKind::XrcRecv) {
            let xrcd = xrcd.ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "XRC receive half needs an XRC domain",
                )
            })?;
            // SAFETY: POD FFI type
            let mut attr = unsafe { mem::zeroed::<ibv_qp_init_attr_ex>() };
            attr.send_cq = cq.as_ptr();
            attr.recv_cq = cq.as_ptr();
            attr.cap.max_recv_wr = cfg.ring_depth.cast();
            attr.cap.max_recv_sge = cfg.num_sge.cast();
            attr.qp_type = cfg.transport.qp_type();
            attr.sq_sig_all = 0_i32;
            // the receive half hangs off the XRC domain, not a protection
            // domain; its receives arrive through the XRC-typed queue
            attr.xrcd = xrcd.as_ptr();
            attr.comp_mask = ibv_qp_init_attr_mask::IBV_QP_INIT_ATTR_XRCD.0;
            // SAFETY: ffi
            unsafe { ibv_create_qp_ex(ctx.as_ptr(), &mut attr) }
                .and_then(NonNull::new)
                .ok_or_else(|| log_ret_last_os_err_with_note("XRC receive queue pair creation"))?
        } else if uses_ex && sends {
            // SAFETY: POD FFI type
            let mut attr = unsafe { mem::zeroed::<ibv_qp_init_attr_ex>() };
            attr.send_cq = cq.as_ptr();
            attr.recv_cq = cq.as_ptr();
            attr.srq = srq.map_or(std::ptr::null_mut(), SharedReceiveQueue::as_ptr);
            attr.cap.max_send_wr = cfg.ring_depth.cast();
            attr.cap.max_recv_wr = cfg.ring_depth.cast();
            attr.cap.max_send_sge = cfg.num_sge.cast();
            attr.cap.max_recv_sge = cfg.num_sge.cast();
            attr.cap.max_inline_data = if cfg.use_inline {
                cfg.msg_size.cast()
            } else {
                0
            };
            attr.qp_type = cfg.transport.qp_type();
            attr.sq_sig_all = 0_i32;
            attr.pd = pd.as_ptr();
            attr.comp_mask = (ibv_qp_init_attr_mask::IBV_QP_INIT_ATTR_PD
                | ibv_qp_init_attr_mask::IBV_QP_INIT_ATTR_SEND_OPS_FLAGS)
                .0;
            attr.send_ops_flags = u64::from(send_ops_flags(cfg.opcode).0);
            // SAFETY: ffi
            unsafe { ibv_create_qp_ex(ctx.as_ptr(), &mut attr) }
                .and_then(NonNull::new)
                .ok_or_else(|| log_ret_last_os_err_with_note("extended queue pair creation"))?
        } else {
            // SAFETY: POD FFI type
            let mut attr = unsafe { mem::zeroed::<ibv_qp_init_attr>() };
            attr.send_cq = cq.as_ptr();
            attr.recv_cq = cq.as_ptr();
            attr.srq = srq.map_or(std::ptr::null_mut(), SharedReceiveQueue::as_ptr);
            attr.cap.max_send_wr = cfg.ring_depth.cast();
            attr.cap.max_recv_wr = cfg.ring_depth.cast();
            attr.cap.max_send_sge = cfg.num_sge.cast();
            attr.cap.max_recv_sge = cfg.num_sge.cast();
            attr.cap.max_inline_data = if cfg.use_inline {
                cfg.msg_size.cast()
            } else {
                0
            };
            attr.qp_type = cfg.transport.qp_type();
            attr.sq_sig_all = 0_i32;
            // SAFETY: ffi
            NonNull::new(unsafe { ibv_create_qp(pd.as_ptr(), &mut attr) })
                .ok_or_else(|| log_ret_last_os_err_with_note("queue pair creation"))?
        };
        let qp_ex = if uses_ex && sends {
            // SAFETY: ffi; aliases the queue pair, no separate teardown
            Some(
                NonNull::new(unsafe { ibv_qp_to_qp_ex(inner_qp.as_ptr()) })
                    .ok_or_else(log_ret_last_os_err)?,
            )
        } else {
            None
        };
        Ok(Self {
            inner_qp,
            qp_ex,
            transport: cfg.transport,
            ah: None,
            flow: None,
        })
    }

    /// Reset -> Init.
    ///
    /// On failure of `ibv_modify_qp`, errno indicates the failure reason:
    ///
    /// `EINVAL`    Invalid value provided in attr or in `attr_mask`
    ///
    /// `ENOMEM`    Not enough resources to complete this operation
    pub(crate) fn modify_to_init(&self) -> io::Result<()> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
        attr.pkey_index = 0;
        attr.port_num = IB_PORT;
        let mut flags = ibv_qp_attr_mask::IBV_QP_STATE | ibv_qp_attr_mask::IBV_QP_PORT;
        // raw packet queue pairs reject pkey and access attributes
        if !self.transport.is_raw_eth() {
            flags |= ibv_qp_attr_mask::IBV_QP_PKEY_INDEX;
            if let Some(access) = self.transport.init_access() {
                attr.qp_access_flags = access.0;
                flags |= ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
            }
            if self.transport.uses_qkey() {
                attr.qkey = DEF_QKEY;
                flags |= ibv_qp_attr_mask::IBV_QP_QKEY;
            }
        }
        self.modify(&mut attr, flags)
    }

    /// Init -> RTR. Connected kinds carry the peer endpoint; datagram and
    /// raw kinds transition on state alone.
    pub(crate) fn modify_to_rtr(&self, remote_qpn: u32, remote_lid: u16) -> io::Result<()> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
        let mut flags = ibv_qp_attr_mask::IBV_QP_STATE;
        if self.transport.rtr_carries_peer() {
            attr.path_mtu = DEFAULT_MTU;
            attr.dest_qp_num = remote_qpn;
            attr.rq_psn = DEFAULT_RQ_PSN;
            attr.max_dest_rd_atomic = DEFAULT_MAX_RD_ATOMIC;
            attr.min_rnr_timer = DEFAULT_MIN_RNR_TIMER;
            attr.ah_attr.dlid = remote_lid;
            attr.ah_attr.is_global = 0;
            attr.ah_attr.sl = 0;
            attr.ah_attr.src_path_bits = 0;
            attr.ah_attr.port_num = IB_PORT;
            flags = flags
                | ibv_qp_attr_mask::IBV_QP_AV
                | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
        }
        self.modify(&mut attr, flags)
    }

    /// RTR -> RTS, initiating roles only.
    pub(crate) fn modify_to_rts(&self) -> io::Result<()> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        let mut flags = ibv_qp_attr_mask::IBV_QP_STATE;
        match self.transport {
            TransportKind::Rc | TransportKind::XrcSend | TransportKind::DcIni => {
                attr.timeout = DEFAULT_TIMEOUT;
                attr.retry_cnt = DEFAULT_RETRY_CNT;
                attr.rnr_retry = DEFAULT_RNR_RETRY;
                attr.sq_psn = DEFAULT_SQ_PSN;
                attr.max_rd_atomic = DEFAULT_MAX_RD_ATOMIC;
                flags = flags
                    | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                    | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                    | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                    | ibv_qp_attr_mask::IBV_QP_SQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
            }
            TransportKind::Ud => {
                attr.sq_psn = DEFAULT_SQ_PSN;
                flags |= ibv_qp_attr_mask::IBV_QP_SQ_PSN;
            }
            TransportKind::RawEth => {}
            TransportKind::DcTgt | TransportKind::XrcRecv => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "receive-only transport halves stop at ready-to-receive",
                ));
            }
        }
        self.modify(&mut attr, flags)
    }

    /// Walk the full state machine for this endpoint's role.
    pub(crate) fn connect(&self, cfg: &Config, remote_qpn: u32, remote_lid: u16) -> io::Result<()> {
        self.modify_to_init()?;
        self.modify_to_rtr(remote_qpn, remote_lid)?;
        if self.transport.needs_rts(cfg.role) {
            self.modify_to_rts()?;
        }
        Ok(())
    }

    /// Create the address handle a connectionless initiator sends through.
    pub(crate) fn create_ah(&mut self, pd: &ProtectionDomain, remote_lid: u16) -> io::Result<()> {
        self.ah = Some(AddressHandle::create(pd, remote_lid)?);
        Ok(())
    }

    /// Attach the receive steering rule for raw-Ethernet traffic addressed
    /// to `local_mac`.
    pub(crate) fn attach_flow(&mut self, local_mac: [u8; 6]) -> io::Result<()> {
        self.flow = Some(FlowRule::attach(self.as_ptr(), local_mac)?);
        Ok(())
    }

    /// Submit a chain of send work requests.
    ///
    /// On failure of `ibv_post_send`, errno indicates the failure reason:
    ///
    /// `EINVAL`    Invalid value provided in wr
    ///
    /// `ENOMEM`    Send queue is full or not enough resources to complete this operation
    pub(crate) fn post_send(&self, wr: &mut ibv_send_wr) -> io::Result<()> {
        let mut bad_wr = std::ptr::null_mut::<ibv_send_wr>();
        // SAFETY: ffi; the sge lists in `wr` point into a live registration
        let errno = unsafe { ibv_post_send(self.as_ptr(), wr, &mut bad_wr) };
        if errno != 0_i32 {
            return Err(log_ret_last_os_err_with_note("send submission"));
        }
        Ok(())
    }

    /// Submit one receive work request to the queue pair's own receive
    /// queue.
    pub(crate) fn post_recv(&self, wr: &mut ibv_recv_wr) -> io::Result<()> {
        let mut bad_wr = std::ptr::null_mut::<ibv_recv_wr>();
        // SAFETY: ffi; the sge list in `wr` points into a live registration
        let errno = unsafe { ibv_post_recv(self.as_ptr(), wr, &mut bad_wr) };
        if errno != 0_i32 {
            return Err(log_ret_last_os_err_with_note("receive submission"));
        }
        Ok(())
    }

    /// Shared modify helper.
    fn modify(&self, attr: &mut ibv_qp_attr, flags: ibv_qp_attr_mask) -> io::Result<()> {
        // SAFETY: ffi; the queue pair is not shared across threads
        let errno = unsafe { ibv_modify_qp(self.as_ptr(), attr, flags.0.cast()) };
        if errno != 0_i32 {
            return Err(log_ret_last_os_err_with_note("state transition"));
        }
        Ok(())
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        // steering rule and address handle go before the queue pair itself
        drop(self.flow.take());
        drop(self.ah.take());
        // SAFETY: ffi
        let errno = unsafe { ibv_destroy_qp(self.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err();
        }
    }
}

unsafe impl Send for QueuePair {}

unsafe impl Sync for QueuePair {}

/// The send-operation declaration an extended queue pair needs for the
/// configured opcode.
fn send_ops_flags(opcode: Operation) -> ibv_qp_create_send_ops_flags {
    match opcode {
        Operation::Send => ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_SEND,
        Operation::SendImm => ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_SEND_WITH_IMM,
        Operation::SendInv => {
            // the daemon binds the targeted window through its own send queue
            ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_SEND_WITH_INV
                | ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_BIND_MW
        }
        Operation::Write => ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_RDMA_WRITE,
        Operation::WriteImm => ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_RDMA_WRITE_WITH_IMM,
        Operation::Read => ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_RDMA_READ,
        Operation::FetchAdd => ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_ATOMIC_FETCH_AND_ADD,
        Operation::CmpSwap => ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_ATOMIC_CMP_AND_SWP,
        Operation::BindMw => ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_BIND_MW,
        Operation::LocalInv => {
            // invalidation follows a bind in the same submission session
            ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_BIND_MW
                | ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_LOCAL_INV
        }
    }
}

/// Address handle a connectionless initiator sends through.
pub(crate) struct AddressHandle {
    /// Internal `ibv_ah` pointer
    inner_ah: NonNull<ibv_ah>,
}

impl AddressHandle {
    /// Get the internal ah pointer
    pub(crate) const fn as_ptr(&self) -> *mut ibv_ah {
        self.inner_ah.as_ptr()
    }

    /// Create a handle addressing the peer's link identifier.
    pub(crate) fn create(pd: &ProtectionDomain, remote_lid: u16) -> io::Result<Self> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { mem::zeroed::<ibv_ah_attr>() };
        attr.dlid = remote_lid;
        attr.is_global = 0;
        attr.sl = 0;
        attr.src_path_bits = 0;
        attr.port_num = IB_PORT;
        // SAFETY: ffi
        let inner_ah = NonNull::new(unsafe { ibv_create_ah(pd.as_ptr(), &mut attr) })
            .ok_or_else(log_ret_last_os_err)?;
        Ok(Self { inner_ah })
    }
}

impl Drop for AddressHandle {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_destroy_ah(self.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err();
        }
    }
}

/// A single-spec Ethernet steering rule: everything addressed to the local
/// MAC lands on the raw packet queue pair.
#[repr(C)]
struct EthFlowRule {
    /// Rule header
    attr: ibv_flow_attr,
    /// The one Ethernet match spec
    spec: ibv_flow_spec_eth,
}

/// Attached steering rule, detached on drop.
pub(crate) struct FlowRule {
    /// Internal `ibv_flow` pointer
    inner_flow: NonNull<ibv_flow>,
}

impl FlowRule {
    /// Build and attach the rule to `qp`.
    fn attach(qp: *mut ibv_qp, local_mac: [u8; 6]) -> io::Result<Self> {
        // SAFETY: POD FFI type
        let mut rule = unsafe { mem::zeroed::<EthFlowRule>() };
        rule.attr.type_ = ibv_flow_attr_type::IBV_FLOW_ATTR_NORMAL;
        rule.attr.size = size_of::<EthFlowRule>().cast();
        rule.attr.priority = 0;
        rule.attr.num_of_specs = 1;
        rule.attr.port = IB_PORT;
        rule.spec.type_ = ibv_flow_spec_type::IBV_FLOW_SPEC_ETH;
        rule.spec.size = size_of::<ibv_flow_spec_eth>().cast();
        rule.spec.val.dst_mac = local_mac;
        rule.spec.mask.dst_mac = [0xFF; 6];
        // SAFETY: ffi; the rule struct is only read during the call
        let inner_flow =
            NonNull::new(unsafe {
                ibv_create_flow(qp, std::ptr::addr_of_mut!(rule.attr)).unwrap_or(std::ptr::null_mut())
            })
                .ok_or_else(|| log_ret_last_os_err_with_note("flow rule attach"))?;
        Ok(Self { inner_flow })
    }
}

impl Drop for FlowRule {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_destroy_flow(self.inner_flow.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err();
        }
    }
}

#[cfg(test)]
mod tests {
    use rdma_sys::ibv_qp_create_send_ops_flags;

    use super::send_ops_flags;
    use crate::config::Operation;

    #[test]
    fn local_invalidate_declares_bind_too() {
        let flags = send_ops_flags(Operation::LocalInv);
        assert!(flags.0 & ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_BIND_MW.0 != 0);
        assert!(flags.0 & ibv_qp_create_send_ops_flags::IBV_QP_EX_WITH_LOCAL_INV.0 != 0);
    }
}
