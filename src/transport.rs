//! Transport-kind policies.
//!
//! Every transport the benchmark can drive answers the same three questions:
//! how the queue pair is typed at creation, which attribute set each
//! connection-state transition carries, and how the kind is represented on
//! the control channel. Keeping the answers on one closed enum replaces the
//! per-call-site conditionals the equivalent C tools grow.

use clap::ValueEnum;
use rdma_sys::{ibv_access_flags, ibv_qp_type};

use crate::config::Role;

/// Bytes of global routing header the device deposits in front of every
/// datagram payload on the receive side.
const GRH_LEN: usize = 40;

/// Transport service type of the benchmark endpoint, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// Reliable connected
    Rc,
    /// Unreliable datagram
    Ud,
    /// Dynamically connected initiator
    DcIni,
    /// Dynamically connected target (SRQ-backed)
    DcTgt,
    /// XRC send half
    XrcSend,
    /// XRC receive half (SRQ-backed)
    XrcRecv,
    /// Raw Ethernet (raw packet QP)
    RawEth,
}

impl TransportKind {
    /// The verbs QP type used at creation time.
    pub(crate) fn qp_type(self) -> u32 {
        match self {
            Self::Rc => ibv_qp_type::IBV_QPT_RC,
            Self::Ud => ibv_qp_type::IBV_QPT_UD,
            // DC queue pairs are created through the driver QP type; devices
            // without DC support reject the creation call.
            Self::DcIni | Self::DcTgt => ibv_qp_type::IBV_QPT_DRIVER,
            Self::XrcSend => ibv_qp_type::IBV_QPT_XRC_SEND,
            Self::XrcRecv => ibv_qp_type::IBV_QPT_XRC_RECV,
            Self::RawEth => ibv_qp_type::IBV_QPT_RAW_PACKET,
        }
    }

    /// Control-channel representation. Receive-only halves of SRQ-backed
    /// transports are represented as their send counterpart so the
    /// connection-parameter comparison is symmetric between peers.
    #[must_use]
    pub fn wire_code(self) -> u32 {
        match self.normalized() {
            Self::Rc => 0,
            Self::Ud => 1,
            Self::DcIni => 2,
            Self::XrcSend => 4,
            Self::RawEth => 6,
            // normalized() never returns a receive half
            Self::DcTgt | Self::XrcRecv => unreachable!("normalized receive role"),
        }
    }

    /// Collapse receive-only halves onto their send counterpart.
    #[must_use]
    pub fn normalized(self) -> Self {
        match self {
            Self::DcTgt => Self::DcIni,
            Self::XrcRecv => Self::XrcSend,
            other => other,
        }
    }

    /// Access-permission flags applied on the Reset→Init transition, when
    /// the kind carries any.
    pub(crate) fn init_access(self) -> Option<ibv_access_flags> {
        match self {
            Self::Rc | Self::DcTgt | Self::XrcRecv | Self::XrcSend => Some(
                ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                    | ibv_access_flags::IBV_ACCESS_REMOTE_READ
                    | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
                    | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC,
            ),
            Self::Ud | Self::DcIni | Self::RawEth => None,
        }
    }

    /// Datagram kinds carry a queue key instead of access flags.
    #[must_use]
    pub fn uses_qkey(self) -> bool {
        matches!(self, Self::Ud)
    }

    /// Receive-only halves post their buffers to a shared receive queue.
    #[must_use]
    pub fn uses_srq(self) -> bool {
        matches!(self, Self::DcTgt | Self::XrcRecv)
    }

    /// Extra receive-buffer bytes this kind needs ahead of the payload.
    /// Datagram receives land behind a global routing header, so their
    /// buffers and scatter elements must cover `msg_size` plus this.
    #[must_use]
    pub fn recv_headroom(self) -> usize {
        match self {
            Self::Ud => GRH_LEN,
            Self::Rc | Self::DcIni | Self::DcTgt | Self::XrcSend | Self::XrcRecv | Self::RawEth => {
                0
            }
        }
    }

    /// Connectionless initiators address every send through an address
    /// handle bound to the target's link identifier.
    #[must_use]
    pub fn needs_ah(self) -> bool {
        matches!(self, Self::Ud | Self::DcIni)
    }

    /// Whether the Init→RTR transition carries the peer endpoint number and
    /// link address.
    pub(crate) fn rtr_carries_peer(self) -> bool {
        matches!(self, Self::Rc | Self::XrcSend | Self::XrcRecv)
    }

    /// Whether this role must continue to Ready-to-Send. Initiating roles
    /// do; the receive-only half of an SRQ transport and the datagram
    /// receiver stop at Ready-to-Receive.
    #[must_use]
    pub fn needs_rts(self, role: Role) -> bool {
        match self {
            Self::DcTgt | Self::XrcRecv => false,
            Self::Rc | Self::Ud | Self::DcIni | Self::XrcSend | Self::RawEth => {
                matches!(role, Role::Client)
            }
        }
    }

    /// Raw packet QPs skip the verbs addressing attributes entirely.
    #[must_use]
    pub fn is_raw_eth(self) -> bool {
        matches!(self, Self::RawEth)
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Rc => "RC",
            Self::Ud => "UD",
            Self::DcIni => "DC-INI",
            Self::DcTgt => "DC-TGT",
            Self::XrcSend => "XRC-SEND",
            Self::XrcRecv => "XRC-RECV",
            Self::RawEth => "RAW-ETH",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::TransportKind;
    use crate::config::Role;

    #[test]
    fn receive_roles_normalize_to_send_counterpart() {
        assert_eq!(
            TransportKind::XrcRecv.wire_code(),
            TransportKind::XrcSend.wire_code()
        );
        assert_eq!(
            TransportKind::DcTgt.wire_code(),
            TransportKind::DcIni.wire_code()
        );
        assert_ne!(
            TransportKind::Rc.wire_code(),
            TransportKind::Ud.wire_code()
        );
    }

    #[test]
    fn datagram_kinds_skip_access_flags() {
        assert!(TransportKind::Ud.init_access().is_none());
        assert!(TransportKind::RawEth.init_access().is_none());
        assert!(TransportKind::Rc.init_access().is_some());
    }

    #[test]
    fn rts_only_for_initiating_roles() {
        assert!(TransportKind::Rc.needs_rts(Role::Client));
        assert!(!TransportKind::Rc.needs_rts(Role::Daemon));
        assert!(!TransportKind::XrcRecv.needs_rts(Role::Client));
        assert!(!TransportKind::DcTgt.needs_rts(Role::Daemon));
    }

    #[test]
    fn datagram_receives_reserve_grh_headroom() {
        assert_eq!(TransportKind::Ud.recv_headroom(), 40);
        assert_eq!(TransportKind::Rc.recv_headroom(), 0);
        assert_eq!(TransportKind::XrcRecv.recv_headroom(), 0);
        assert_eq!(TransportKind::RawEth.recv_headroom(), 0);
    }

    #[test]
    fn srq_roles() {
        assert!(TransportKind::XrcRecv.uses_srq());
        assert!(TransportKind::DcTgt.uses_srq());
        assert!(!TransportKind::Rc.uses_srq());
    }
}
