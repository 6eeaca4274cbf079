//! TCP out-of-band control channel and connection handshake.
//!
//! Before any verbs traffic the two processes exchange three fixed-size
//! records over a plain TCP connection: the run parameters (which must match
//! on both sides), the queue-pair endpoint, and, when the opcode or the
//! transport needs it, the registered-memory description. All multi-byte
//! fields travel as big-endian 32-bit words so mixed-endian hosts agree.
//!
//! The client always transmits first and the daemon always receives first;
//! that fixed order is what makes the exchange deadlock-free without any
//! framing negotiation.

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
};

use clippy_utilities::Cast;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::{Config, Operation, Role},
    error::{BenchError, Result},
    transport::TransportKind,
};

/// Barrier byte pattern exchanged when both sides are armed.
const READY_MAGIC: [u8; 4] = *b"qpb!";
/// Barrier byte pattern exchanged after the measured loop.
const DONE_MAGIC: [u8; 4] = *b"qpb.";
/// Upper bound on a control record; anything larger is a framing error.
const MAX_INFO_LEN: usize = 256;

/// The control-channel connection.
#[derive(Debug)]
pub struct OobChannel {
    /// Underlying TCP stream
    stream: TcpStream,
}

impl OobChannel {
    /// Connect (client) or accept one connection (daemon).
    pub fn establish(cfg: &Config) -> Result<Self> {
        let stream = match cfg.role {
            Role::Client => TcpStream::connect((cfg.ip.as_str(), cfg.tcp_port))?,
            Role::Daemon => {
                let listener = TcpListener::bind(("0.0.0.0", cfg.tcp_port))?;
                info!("listening on port {}", cfg.tcp_port);
                let (stream, peer) = listener.accept()?;
                debug!("control connection from {peer}");
                stream
            }
        };
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Wrap an already-connected stream.
    #[must_use]
    pub fn from_stream(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Send one length-prefixed record. The payload must be a whole number
    /// of 32-bit words.
    pub fn send_info<T: Serialize>(&mut self, info: &T) -> Result<()> {
        let encoded =
            bincode::serialize(info).map_err(|err| BenchError::protocol(format!("encode: {err}")))?;
        // a misaligned record means this side was built with a bad record
        // layout, not that the peer misbehaved
        if encoded.len() % 4 != 0 {
            return Err(BenchError::config(format!(
                "control record of {} bytes is not word-aligned",
                encoded.len()
            )));
        }
        let len: u32 = encoded.len().cast();
        self.stream.write_all(&len.to_be_bytes())?;
        self.stream.write_all(&encoded)?;
        Ok(())
    }

    /// Receive one length-prefixed record.
    pub fn recv_info<T: DeserializeOwned>(&mut self) -> Result<T> {
        let mut len_buf = [0_u8; 4];
        self.stream.read_exact(&mut len_buf)?;
        let len: usize = u32::from_be_bytes(len_buf).cast();
        if len % 4 != 0 || len > MAX_INFO_LEN {
            return Err(BenchError::protocol(format!(
                "peer announced a control record of {len} bytes"
            )));
        }
        let mut buf = vec![0_u8; len];
        self.stream.read_exact(&mut buf)?;
        bincode::deserialize(&buf).map_err(|err| BenchError::protocol(format!("decode: {err}")))
    }

    /// Role-ordered exchange: the client sends first, the daemon receives
    /// first.
    pub fn exchange<T: Serialize + DeserializeOwned>(
        &mut self,
        role: Role,
        local: &T,
    ) -> Result<T> {
        match role {
            Role::Client => {
                self.send_info(local)?;
                self.recv_info()
            }
            Role::Daemon => {
                let remote = self.recv_info()?;
                self.send_info(local)?;
                Ok(remote)
            }
        }
    }

    /// Barrier crossed when both sides have armed their queues.
    pub fn sync_ready(&mut self, role: Role) -> Result<()> {
        self.barrier(role, READY_MAGIC)
    }

    /// Barrier crossed after the measured loop, before teardown.
    pub fn sync_done(&mut self, role: Role) -> Result<()> {
        self.barrier(role, DONE_MAGIC)
    }

    /// Four-byte magic exchange in the same fixed order as the records.
    fn barrier(&mut self, role: Role, magic: [u8; 4]) -> Result<()> {
        let mut echo = [0_u8; 4];
        match role {
            Role::Client => {
                self.stream.write_all(&magic)?;
                self.stream.read_exact(&mut echo)?;
            }
            Role::Daemon => {
                self.stream.read_exact(&mut echo)?;
                self.stream.write_all(&magic)?;
            }
        }
        if echo == magic {
            Ok(())
        } else {
            Err(BenchError::protocol("barrier byte pattern mismatch"))
        }
    }
}

/// Run parameters both sides must agree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnParams {
    /// Total operations the run completes
    pub num_of_iter: u32,
    /// Operation wire code
    pub opcode: u32,
    /// Transport wire code
    pub transport: u32,
}

impl ConnParams {
    /// Derive from the local configuration.
    #[must_use]
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            num_of_iter: cfg.iterations,
            opcode: cfg.opcode.wire_code(),
            transport: cfg.transport.wire_code(),
        }
    }

    /// Field-wise big-endian view for transmission.
    #[must_use]
    pub const fn into_be(self) -> Self {
        Self {
            num_of_iter: u32::to_be(self.num_of_iter),
            opcode: u32::to_be(self.opcode),
            transport: u32::to_be(self.transport),
        }
    }

    /// Back to host order after reception.
    #[must_use]
    pub const fn into_le(self) -> Self {
        Self {
            num_of_iter: u32::from_be(self.num_of_iter),
            opcode: u32::from_be(self.opcode),
            transport: u32::from_be(self.transport),
        }
    }
}

/// Queue-pair endpoint advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// Queue pair number
    pub qp_num: u32,
    /// Port link identifier, widened to a word
    pub lid: u32,
    /// First two MAC octets
    pub mac_hi: u32,
    /// Last four MAC octets
    pub mac_lo: u32,
}

impl EndpointInfo {
    /// Build from the local endpoint parts.
    #[must_use]
    pub fn new(qp_num: u32, lid: u16, mac: [u8; 6]) -> Self {
        let (mac_hi, mac_lo) = pack_mac(mac);
        Self {
            qp_num,
            lid: u32::from(lid),
            mac_hi,
            mac_lo,
        }
    }

    /// Field-wise big-endian view for transmission.
    #[must_use]
    pub const fn into_be(self) -> Self {
        Self {
            qp_num: u32::to_be(self.qp_num),
            lid: u32::to_be(self.lid),
            mac_hi: u32::to_be(self.mac_hi),
            mac_lo: u32::to_be(self.mac_lo),
        }
    }

    /// Back to host order after reception.
    #[must_use]
    pub const fn into_le(self) -> Self {
        Self {
            qp_num: u32::from_be(self.qp_num),
            lid: u32::from_be(self.lid),
            mac_hi: u32::from_be(self.mac_hi),
            mac_lo: u32::from_be(self.mac_lo),
        }
    }
}

/// Registered-memory advertisement, exchanged only when the run needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryInfo {
    /// Remote key of the region (or window) the peer may target
    pub rkey: u32,
    /// High word of the buffer address
    pub addr_hi: u32,
    /// Low word of the buffer address
    pub addr_lo: u32,
    /// Shared receive queue number, zero when unused
    pub srq_num: u32,
}

impl MemoryInfo {
    /// Build from the local memory description.
    #[must_use]
    pub fn new(rkey: u32, addr: u64, srq_num: u32) -> Self {
        Self {
            rkey,
            addr_hi: (addr >> 32_i32).cast(),
            addr_lo: (addr & 0xFFFF_FFFF).cast(),
            srq_num,
        }
    }

    /// Reassemble the 64-bit buffer address.
    #[must_use]
    pub fn addr(&self) -> u64 {
        (u64::from(self.addr_hi) << 32_i32) | u64::from(self.addr_lo)
    }

    /// Field-wise big-endian view for transmission.
    #[must_use]
    pub const fn into_be(self) -> Self {
        Self {
            rkey: u32::to_be(self.rkey),
            addr_hi: u32::to_be(self.addr_hi),
            addr_lo: u32::to_be(self.addr_lo),
            srq_num: u32::to_be(self.srq_num),
        }
    }

    /// Back to host order after reception.
    #[must_use]
    pub const fn into_le(self) -> Self {
        Self {
            rkey: u32::from_be(self.rkey),
            addr_hi: u32::from_be(self.addr_hi),
            addr_lo: u32::from_be(self.addr_lo),
            srq_num: u32::from_be(self.srq_num),
        }
    }
}

/// Pack six MAC octets into two words: the first two octets in the low
/// bytes of `hi`, the last four in `lo`.
#[must_use]
pub fn pack_mac(mac: [u8; 6]) -> (u32, u32) {
    let hi = (u32::from(mac[0]) << 8_i32) | u32::from(mac[1]);
    let lo = u32::from_be_bytes([mac[2], mac[3], mac[4], mac[5]]);
    (hi, lo)
}

/// Inverse of [`pack_mac`].
#[must_use]
pub fn unpack_mac(hi: u32, lo: u32) -> [u8; 6] {
    let lo = lo.to_be_bytes();
    [
        (hi >> 8_i32).cast(),
        (hi & 0xFF).cast(),
        lo[0],
        lo[1],
        lo[2],
        lo[3],
    ]
}

/// Whether this run exchanges a [`MemoryInfo`] record. Both sides compute
/// this from fields the parameter exchange already proved equal.
#[must_use]
pub fn needs_memory_exchange(cfg: &Config) -> bool {
    cfg.opcode.needs_remote_access()
        || matches!(cfg.opcode, Operation::SendInv)
        || matches!(
            cfg.transport.normalized(),
            TransportKind::DcIni | TransportKind::XrcSend
        )
}

/// Everything learned about the peer during the handshake.
#[derive(Debug, Clone, Copy)]
pub struct RemotePeer {
    /// Peer queue pair number
    pub qp_num: u32,
    /// Peer port link identifier
    pub lid: u16,
    /// Peer MAC address, raw-Ethernet only
    pub mac: [u8; 6],
    /// Peer registered memory, when exchanged
    pub memory: Option<RemoteMemory>,
}

/// The peer's registered-memory description in host order.
#[derive(Debug, Clone, Copy)]
pub struct RemoteMemory {
    /// Remote key
    pub rkey: u32,
    /// Buffer address
    pub addr: u64,
    /// Shared receive queue number, zero when unused
    pub srq_num: u32,
}

/// The local half of the handshake inputs.
#[derive(Debug, Clone, Copy)]
pub struct LocalEndpoint {
    /// Local queue pair number
    pub qp_num: u32,
    /// Local port link identifier
    pub lid: u16,
    /// Local MAC address, raw-Ethernet only
    pub mac: [u8; 6],
    /// Local registered memory, when the run exchanges one
    pub memory: Option<MemoryInfo>,
}

/// Run the full handshake: validate parameters, then exchange endpoints and
/// optionally memory.
pub fn run(channel: &mut OobChannel, cfg: &Config, local: &LocalEndpoint) -> Result<RemotePeer> {
    let local_params = ConnParams::from_config(cfg);
    let remote_params = channel
        .exchange(cfg.role, &local_params.into_be())?
        .into_le();
    validate_params(&local_params, &remote_params)?;

    let local_ep = EndpointInfo::new(local.qp_num, local.lid, local.mac);
    let remote_ep = channel.exchange(cfg.role, &local_ep.into_be())?.into_le();
    // the wire widens the link identifier to a word; reject peers that
    // claim more than the field holds
    let remote_lid = u16::try_from(remote_ep.lid).map_err(|_| {
        BenchError::protocol(format!(
            "peer link identifier {:#x} exceeds 16 bits",
            remote_ep.lid
        ))
    })?;
    debug!(
        "remote endpoint: qp_num={:#x} lid={remote_lid:#x}",
        remote_ep.qp_num
    );

    let memory = if needs_memory_exchange(cfg) {
        let local_mem = local.memory.ok_or_else(|| {
            BenchError::protocol("run needs a memory exchange but no local memory was prepared")
        })?;
        let remote_mem = channel.exchange(cfg.role, &local_mem.into_be())?.into_le();
        debug!(
            "remote memory: rkey={:#x} addr={:#x} srq={:#x}",
            remote_mem.rkey,
            remote_mem.addr(),
            remote_mem.srq_num
        );
        Some(RemoteMemory {
            rkey: remote_mem.rkey,
            addr: remote_mem.addr(),
            srq_num: remote_mem.srq_num,
        })
    } else {
        None
    };

    Ok(RemotePeer {
        qp_num: remote_ep.qp_num,
        lid: remote_lid,
        mac: unpack_mac(remote_ep.mac_hi, remote_ep.mac_lo),
        memory,
    })
}

/// Every parameter must match; name the first one that does not.
fn validate_params(local: &ConnParams, remote: &ConnParams) -> Result<()> {
    if local.num_of_iter != remote.num_of_iter {
        return Err(BenchError::protocol(format!(
            "iteration count mismatch: local {} remote {}",
            local.num_of_iter, remote.num_of_iter
        )));
    }
    if local.opcode != remote.opcode {
        return Err(BenchError::protocol(format!(
            "opcode mismatch: local {} remote {}",
            local.opcode, remote.opcode
        )));
    }
    if local.transport != remote.transport {
        return Err(BenchError::protocol(format!(
            "transport mismatch: local {} remote {}",
            local.transport, remote.transport
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{needs_memory_exchange, pack_mac, unpack_mac, validate_params, ConnParams, MemoryInfo};
    use crate::config::{tests::base_config, Config, Operation, PostApi};
    use crate::transport::TransportKind;

    #[test]
    fn mac_words_round_trip() {
        let mac = [0x02, 0xAB, 0x33, 0x44, 0x55, 0x66];
        let (hi, lo) = pack_mac(mac);
        assert_eq!(unpack_mac(hi, lo), mac);
    }

    #[test]
    fn endianness_normalization_round_trips() {
        let params = ConnParams {
            num_of_iter: 1000,
            opcode: 3,
            transport: 0,
        };
        assert_eq!(params.into_be().into_le(), params);

        let mem = MemoryInfo::new(0xDEAD_BEEF, 0x1234_5678_9ABC_DEF0, 7);
        assert_eq!(mem.into_be().into_le(), mem);
        assert_eq!(mem.addr(), 0x1234_5678_9ABC_DEF0);
    }

    #[test]
    fn mismatched_params_are_rejected() {
        let a = ConnParams {
            num_of_iter: 10,
            opcode: 0,
            transport: 0,
        };
        let mut b = a;
        assert!(validate_params(&a, &b).is_ok());
        b.opcode = 3;
        assert!(validate_params(&a, &b).is_err());
        b = a;
        b.num_of_iter = 11;
        assert!(validate_params(&a, &b).is_err());
    }

    #[test]
    fn memory_exchange_predicate() {
        let send_rc = base_config();
        assert!(!needs_memory_exchange(&send_rc));

        let write = Config {
            opcode: Operation::Write,
            post_api: PostApi::Extensible,
            ..base_config()
        };
        assert!(needs_memory_exchange(&write));

        let send_inv = Config {
            opcode: Operation::SendInv,
            post_api: PostApi::Extensible,
            batch_size: 1,
            iterations: 1,
            ..base_config()
        };
        assert!(needs_memory_exchange(&send_inv));

        // both SRQ halves agree through normalization
        let dc_ini = Config {
            transport: TransportKind::DcIni,
            ..base_config()
        };
        let dc_tgt = Config {
            transport: TransportKind::DcTgt,
            role: crate::config::Role::Daemon,
            ..base_config()
        };
        assert_eq!(needs_memory_exchange(&dc_ini), needs_memory_exchange(&dc_tgt));
        assert!(needs_memory_exchange(&dc_ini));
    }
}
