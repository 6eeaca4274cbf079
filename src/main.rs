//! Benchmark binary entry point.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use qpbench::{
    config::{Config, Operation, PostApi, Role},
    run,
    transport::TransportKind,
};

/// Point-to-point RDMA queue-pair micro-benchmark.
#[derive(Debug, Parser)]
#[command(name = "qpbench", version, about)]
struct Cli {
    /// RDMA device to open; first device when omitted
    #[arg(short = 'd', long)]
    dev_name: Option<String>,
    /// Daemon address the client connects to
    #[arg(short = 'i', long, default_value = "127.0.0.1")]
    ip: String,
    /// Control-channel TCP port
    #[arg(short = 'p', long, default_value_t = 17500)]
    tcp_port: u16,
    /// Run as the receiving daemon instead of the measuring client
    #[arg(long)]
    daemon: bool,
    /// Transport service type
    #[arg(short = 't', long, value_enum, default_value_t = TransportKind::Rc)]
    transport: TransportKind,
    /// Operation every work request performs
    #[arg(short = 'o', long, value_enum, default_value_t = Operation::Send)]
    opcode: Operation,
    /// Message size in bytes
    #[arg(short = 's', long, default_value_t = 64)]
    msg_size: usize,
    /// Maximum outstanding work requests
    #[arg(short = 'r', long, default_value_t = 64)]
    ring_depth: u16,
    /// Work requests per submission
    #[arg(short = 'b', long, default_value_t = 16)]
    batch_size: u16,
    /// Scatter/gather elements per work request
    #[arg(long, default_value_t = 1)]
    num_sge: u16,
    /// Submission strategy
    #[arg(long, value_enum, default_value_t = PostApi::Legacy)]
    post_api: PostApi,
    /// Copy the payload into the submission descriptor
    #[arg(long)]
    use_inline: bool,
    /// Relax the 8-byte atomic sizing rule (vendor wide atomics)
    #[arg(long)]
    ext_atomics: bool,
    /// Local MAC address, raw-Ethernet transport only
    #[arg(long, default_value = "00:00:00:00:00:00", value_parser = parse_mac)]
    local_mac: [u8; 6],
    /// Total operations to complete
    #[arg(short = 'n', long, default_value_t = 1000)]
    iterations: u32,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Self {
            dev_name: cli.dev_name,
            ip: cli.ip,
            tcp_port: cli.tcp_port,
            role: if cli.daemon { Role::Daemon } else { Role::Client },
            transport: cli.transport,
            opcode: cli.opcode,
            msg_size: cli.msg_size,
            ring_depth: cli.ring_depth,
            batch_size: cli.batch_size,
            num_sge: cli.num_sge,
            post_api: cli.post_api,
            use_inline: cli.use_inline,
            ext_atomics: cli.ext_atomics,
            local_mac: cli.local_mac,
            iterations: cli.iterations,
        }
    }
}

/// Parse a colon-separated MAC address.
fn parse_mac(s: &str) -> Result<[u8; 6], String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(format!("expected six colon-separated octets, got {s}"));
    }
    let mut mac = [0_u8; 6];
    for (byte, part) in mac.iter_mut().zip(parts) {
        *byte =
            u8::from_str_radix(part, 16).map_err(|err| format!("bad MAC octet {part}: {err}"))?;
    }
    Ok(mac)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = match Config::from(cli).normalize_and_validate() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };
    match run::execute(&cfg) {
        Ok(Some(report)) => {
            info!("latency: {report}");
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(err) => {
            error!("run failed: {err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_mac;

    #[test]
    fn mac_parsing() {
        assert_eq!(
            parse_mac("02:ab:33:44:55:66").unwrap(),
            [0x02, 0xAB, 0x33, 0x44, 0x55, 0x66]
        );
        assert!(parse_mac("02:ab:33:44:55").is_err());
        assert!(parse_mac("02:zz:33:44:55:66").is_err());
    }
}
