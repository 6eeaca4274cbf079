//! Immutable run configuration.
//!
//! The binary builds one [`Config`] from the command line, runs it through
//! [`Config::normalize_and_validate`] and hands out shared references; no
//! component reads ambient global state. Every legality rule below is
//! enforced here, before any hardware or network resource is touched.

use clap::ValueEnum;
use tracing::info;

use crate::{
    error::{BenchError, Result},
    transport::TransportKind,
};

/// Well-known queue key used by both peers for datagram transports.
pub(crate) const DEF_QKEY: u32 = 0x1111_1111;
/// Physical port the benchmark always drives.
pub(crate) const IB_PORT: u8 = 1;
/// Smallest buffer a standard 8-byte atomic can operate on.
const ATOMIC_MSG_SIZE: usize = 8;
/// A raw-Ethernet message must at least hold its frame header.
const RAW_ETH_MIN_MSG: usize = 14;

/// Which side of the benchmark this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// Connects, sends first during the handshake, drives the send pipeline.
    Client,
    /// Binds/accepts, receives first, drives the receive pipeline.
    Daemon,
}

/// Elementary operation driven by every work request of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Operation {
    /// Two-sided send
    Send,
    /// Send with immediate data
    SendImm,
    /// Send with remote-key invalidation
    SendInv,
    /// One-sided RDMA write
    Write,
    /// RDMA write with immediate data
    WriteImm,
    /// One-sided RDMA read
    Read,
    /// Atomic fetch-and-add
    FetchAdd,
    /// Atomic compare-and-swap
    CmpSwap,
    /// Memory-window bind
    BindMw,
    /// Local key invalidation
    LocalInv,
}

impl Operation {
    /// Operations that target remote memory and need the peer's rkey/addr.
    #[must_use]
    pub fn needs_remote_access(self) -> bool {
        matches!(
            self,
            Self::Write | Self::WriteImm | Self::Read | Self::FetchAdd | Self::CmpSwap
        )
    }

    /// Atomic operations carry extra sizing/segment constraints.
    #[must_use]
    pub fn is_atomic(self) -> bool {
        matches!(self, Self::FetchAdd | Self::CmpSwap)
    }

    /// Memory-window opcodes produce dependent completions and are pinned to
    /// single-shot runs.
    #[must_use]
    pub fn involves_memory_window(self) -> bool {
        matches!(self, Self::BindMw | Self::LocalInv | Self::SendInv)
    }

    /// Operations that land in a posted receive buffer on the far side; the
    /// receiver only runs a drain loop for these.
    #[must_use]
    pub fn consumes_receive_buffer(self) -> bool {
        matches!(self, Self::Send | Self::SendImm | Self::SendInv | Self::WriteImm)
    }

    /// Inline payload is only legal for operations whose data travels in the
    /// request itself.
    #[must_use]
    pub fn allows_inline(self) -> bool {
        matches!(self, Self::Send | Self::SendImm | Self::Write | Self::WriteImm)
    }

    /// Control-channel representation.
    #[must_use]
    pub fn wire_code(self) -> u32 {
        match self {
            Self::Send => 0,
            Self::SendImm => 1,
            Self::SendInv => 2,
            Self::Write => 3,
            Self::WriteImm => 4,
            Self::Read => 5,
            Self::FetchAdd => 6,
            Self::CmpSwap => 7,
            Self::BindMw => 8,
            Self::LocalInv => 9,
        }
    }
}

/// Work-request submission strategy, selected once at setup time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PostApi {
    /// Linked `ibv_send_wr` batch through one classic post call
    Legacy,
    /// Extensible per-operation submission context
    Extensible,
    /// Toggle between the two on successive batches
    Alternating,
}

/// Validated, immutable configuration of one benchmark run.
#[derive(Debug, Clone)]
pub struct Config {
    /// HCA to open; first active device when unset
    pub dev_name: Option<String>,
    /// Peer address the client connects to
    pub ip: String,
    /// Control-channel TCP port
    pub tcp_port: u16,
    /// Process role
    pub role: Role,
    /// Transport service type
    pub transport: TransportKind,
    /// Operation every work request performs
    pub opcode: Operation,
    /// Message size in bytes
    pub msg_size: usize,
    /// Pipeline (ring) depth: max outstanding work requests
    pub ring_depth: u16,
    /// Nominal number of work requests per submission
    pub batch_size: u16,
    /// Scatter/gather elements per work request
    pub num_sge: u16,
    /// Submission strategy
    pub post_api: PostApi,
    /// Copy payload into the submission descriptor
    pub use_inline: bool,
    /// Vendor wide-atomic mode: relaxes the 8-byte atomic sizing rule
    pub ext_atomics: bool,
    /// Local MAC address, raw-Ethernet transport only
    pub local_mac: [u8; 6],
    /// Total number of operations to complete
    pub iterations: u32,
}

impl Config {
    /// Apply dependency normalization, then reject every contradictory
    /// combination. Called exactly once, before resource setup.
    pub fn normalize_and_validate(mut self) -> Result<Self> {
        // a batch must fit in the pipeline window
        self.ring_depth = self.ring_depth.max(self.batch_size);

        if self.iterations == 0 {
            return Err(BenchError::config("iteration count must be non-zero"));
        }
        if self.batch_size == 0 {
            return Err(BenchError::config("batch size must be non-zero"));
        }
        if self.num_sge == 0 {
            return Err(BenchError::config("at least one scatter/gather segment required"));
        }
        if self.msg_size == 0 {
            return Err(BenchError::config("message size must be non-zero"));
        }

        if self.opcode.involves_memory_window() && (self.batch_size != 1 || self.iterations != 1) {
            return Err(BenchError::config(format!(
                "opcode {:?} produces dependent completions and requires batch size 1 and a single iteration",
                self.opcode
            )));
        }

        if self.use_inline && !self.opcode.allows_inline() {
            return Err(BenchError::config(format!(
                "inline transmission is not legal for opcode {:?}",
                self.opcode
            )));
        }

        if self.opcode.is_atomic() {
            if self.num_sge > 1 {
                return Err(BenchError::config(
                    "atomic operations forbid more than one scatter/gather segment",
                ));
            }
            if !self.ext_atomics && self.msg_size < ATOMIC_MSG_SIZE {
                return Err(BenchError::config(format!(
                    "atomic operations require a message size of at least {ATOMIC_MSG_SIZE} bytes",
                )));
            }
        }

        if matches!(self.post_api, PostApi::Legacy | PostApi::Alternating)
            && self.opcode != Operation::Send
        {
            return Err(BenchError::config(
                "the legacy submission path has a fixed send opcode; use the extensible strategy",
            ));
        }

        if self.transport.is_raw_eth() {
            if self.local_mac == [0_u8; 6] {
                return Err(BenchError::config(
                    "raw-Ethernet transport requires a local MAC address",
                ));
            }
            if self.msg_size < RAW_ETH_MIN_MSG {
                return Err(BenchError::config(format!(
                    "raw-Ethernet messages must hold the {RAW_ETH_MIN_MSG}-byte frame header",
                )));
            }
        }

        Ok(self)
    }

    /// Log the effective configuration before the run starts.
    pub fn log(&self) {
        info!("---------------------- config data ---------------");
        info!("side                 : {:?}", self.role);
        if matches!(self.role, Role::Client) {
            info!("server ip            : {}", self.ip);
        }
        info!("tcp port             : {}", self.tcp_port);
        info!(
            "device               : {}",
            self.dev_name.as_deref().unwrap_or("<first active>")
        );
        info!("transport            : {}", self.transport);
        info!("opcode               : {:?}", self.opcode);
        info!("iterations           : {}", self.iterations);
        info!("message size         : {}", self.msg_size);
        info!("ring depth           : {}", self.ring_depth);
        info!("batch size           : {}", self.batch_size);
        info!("sge per wr           : {}", self.num_sge);
        info!("post api             : {:?}", self.post_api);
        info!("inline               : {}", self.use_inline);
        info!("extended atomics     : {}", self.ext_atomics);
        info!("--------------------------------------------------");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{Config, Operation, PostApi, Role};
    use crate::transport::TransportKind;

    /// Baseline valid configuration for tests.
    pub(crate) fn base_config() -> Config {
        Config {
            dev_name: None,
            ip: "127.0.0.1".to_owned(),
            tcp_port: 17500,
            role: Role::Client,
            transport: TransportKind::Rc,
            opcode: Operation::Send,
            msg_size: 8,
            ring_depth: 64,
            batch_size: 1,
            num_sge: 1,
            post_api: PostApi::Legacy,
            use_inline: false,
            ext_atomics: false,
            local_mac: [0; 6],
            iterations: 8,
        }
    }

    #[test]
    fn ring_depth_grows_to_batch_size() {
        let cfg = Config {
            ring_depth: 8,
            batch_size: 16,
            ..base_config()
        };
        let cfg = cfg.normalize_and_validate().unwrap();
        assert_eq!(cfg.ring_depth, 16);
    }

    #[test]
    fn ring_depth_not_shrunk() {
        let cfg = Config {
            ring_depth: 64,
            batch_size: 4,
            ..base_config()
        };
        let cfg = cfg.normalize_and_validate().unwrap();
        assert_eq!(cfg.ring_depth, 64);
    }

    #[test]
    fn memory_window_opcodes_are_single_shot() {
        for opcode in [Operation::BindMw, Operation::LocalInv, Operation::SendInv] {
            let ok = Config {
                opcode,
                post_api: PostApi::Extensible,
                batch_size: 1,
                iterations: 1,
                ..base_config()
            };
            assert!(ok.normalize_and_validate().is_ok(), "{opcode:?}");

            let bad_batch = Config {
                opcode,
                post_api: PostApi::Extensible,
                batch_size: 2,
                iterations: 1,
                ..base_config()
            };
            assert!(bad_batch.normalize_and_validate().is_err(), "{opcode:?}");

            let bad_iter = Config {
                opcode,
                post_api: PostApi::Extensible,
                batch_size: 1,
                iterations: 2,
                ..base_config()
            };
            assert!(bad_iter.normalize_and_validate().is_err(), "{opcode:?}");
        }
    }

    #[test]
    fn inline_only_for_send_and_write() {
        let ok = Config {
            opcode: Operation::Write,
            post_api: PostApi::Extensible,
            use_inline: true,
            ..base_config()
        };
        assert!(ok.normalize_and_validate().is_ok());

        let bad = Config {
            opcode: Operation::Read,
            post_api: PostApi::Extensible,
            use_inline: true,
            ..base_config()
        };
        assert!(bad.normalize_and_validate().is_err());
    }

    #[test]
    fn atomic_sizing_rules() {
        let too_small = Config {
            opcode: Operation::FetchAdd,
            post_api: PostApi::Extensible,
            msg_size: 4,
            ..base_config()
        };
        assert!(too_small.normalize_and_validate().is_err());

        let relaxed = Config {
            opcode: Operation::FetchAdd,
            post_api: PostApi::Extensible,
            msg_size: 4,
            ext_atomics: true,
            ..base_config()
        };
        assert!(relaxed.normalize_and_validate().is_ok());

        let multi_sge = Config {
            opcode: Operation::CmpSwap,
            post_api: PostApi::Extensible,
            num_sge: 2,
            ..base_config()
        };
        assert!(multi_sge.normalize_and_validate().is_err());
    }

    #[test]
    fn legacy_path_is_send_only() {
        for post_api in [PostApi::Legacy, PostApi::Alternating] {
            let bad = Config {
                opcode: Operation::Write,
                post_api,
                ..base_config()
            };
            assert!(bad.normalize_and_validate().is_err());
        }
        let ok = Config {
            opcode: Operation::Write,
            post_api: PostApi::Extensible,
            ..base_config()
        };
        assert!(ok.normalize_and_validate().is_ok());
    }

    #[test]
    fn raw_eth_needs_mac_and_frame_room() {
        let no_mac = Config {
            transport: TransportKind::RawEth,
            msg_size: 64,
            ..base_config()
        };
        assert!(no_mac.normalize_and_validate().is_err());

        let too_short = Config {
            transport: TransportKind::RawEth,
            local_mac: [0x02, 0, 0, 0, 0, 1],
            msg_size: 8,
            ..base_config()
        };
        assert!(too_short.normalize_and_validate().is_err());

        let ok = Config {
            transport: TransportKind::RawEth,
            local_mac: [0x02, 0, 0, 0, 0, 1],
            msg_size: 64,
            ..base_config()
        };
        assert!(ok.normalize_and_validate().is_ok());
    }
}
