//! Run orchestration: resource setup, handshake, measured loop, teardown.
//!
//! Setup order is fixed: device, protection domain, completion queue,
//! memory, queues, control channel, handshake, state machine, arming, ready
//! barrier. Teardown happens in reverse through drops after the done
//! barrier, so neither side tears hardware down under the other's traffic.

use std::io;

use clippy_utilities::Cast;
use tracing::{debug, info};

use crate::{
    clock::cycles_per_nsec,
    completion_queue::CompletionQueue,
    config::{Config, Operation, Role, IB_PORT},
    context::Context,
    error::{BenchError, Result},
    handshake::{self, LocalEndpoint, MemoryInfo, OobChannel},
    memory_region::MemoryRegion,
    memory_window::MemoryWindow,
    posting::{self, write_eth_header, PostingEngine, RecvPoster, RecvTarget},
    protection_domain::ProtectionDomain,
    queue_pair::QueuePair,
    shared_receive_queue::SharedReceiveQueue,
    stats::LatencyReport,
    traffic,
    xrc_domain::XrcDomain,
};

/// Execute one benchmark run with a validated configuration.
///
/// The client returns its latency report; the daemon returns `None` after
/// the final barrier.
pub fn execute(cfg: &Config) -> Result<Option<LatencyReport>> {
    cfg.log();

    let ctx = Context::open(cfg.dev_name.as_deref(), IB_PORT)
        .map_err(|err| BenchError::resource("open device context", err))?;
    let pd = ProtectionDomain::create(&ctx)
        .map_err(|err| BenchError::resource("allocate protection domain", err))?;
    // double depth so the invalidation-behind-bind case never overruns
    let cq_size: u32 = u32::from(cfg.ring_depth).saturating_mul(2).max(4);
    let cq = CompletionQueue::create(&ctx, cq_size)
        .map_err(|err| BenchError::resource("create completion queue", err))?;
    // datagram receives land behind a routing header; size the buffer so
    // the receive elements can absorb it on top of the payload
    let headroom = cfg.transport.recv_headroom();
    let mut mr = MemoryRegion::register(&pd, cfg.msg_size.saturating_add(headroom))
        .map_err(|err| BenchError::resource("register memory region", err))?;
    mr.fill(0);

    let xrcd = if cfg.transport.uses_srq() {
        Some(
            XrcDomain::open(&ctx).map_err(|err| BenchError::resource("open XRC domain", err))?,
        )
    } else {
        None
    };
    let srq = match &xrcd {
        Some(xrcd) => Some(
            SharedReceiveQueue::create(
                &ctx,
                &pd,
                xrcd,
                &cq,
                cfg.ring_depth.cast(),
                cfg.num_sge.cast(),
            )
            .map_err(|err| BenchError::resource("create shared receive queue", err))?,
        ),
        None => None,
    };
    let mw = if needs_memory_window(cfg) {
        Some(
            MemoryWindow::alloc(&pd)
                .map_err(|err| BenchError::resource("allocate memory window", err))?,
        )
    } else {
        None
    };

    let mut qp = QueuePair::create(&ctx, &pd, &cq, srq.as_ref(), xrcd.as_ref(), cfg)
        .map_err(|err| BenchError::resource("create queue pair", err))?;

    let mut oob = OobChannel::establish(cfg)?;

    let memory = if handshake::needs_memory_exchange(cfg) {
        let rkey = match (&mw, cfg.role, cfg.opcode) {
            // send-with-invalidate targets the rkey the daemon's window
            // bind will install after the connection is up
            (Some(mw), Role::Daemon, Operation::SendInv) => mw.next_rkey(),
            _ => mr.rkey(),
        };
        let srq_num = match &srq {
            Some(srq) => srq
                .srq_num()
                .map_err(|err| BenchError::resource("query shared receive queue number", err))?,
            None => 0,
        };
        Some(MemoryInfo::new(rkey, mr.addr(), srq_num))
    } else {
        None
    };
    let local = LocalEndpoint {
        qp_num: qp.qp_num(),
        lid: ctx.lid(),
        mac: cfg.local_mac,
        memory,
    };
    let remote = handshake::run(&mut oob, cfg, &local)?;

    qp.connect(cfg, remote.qp_num, remote.lid)
        .map_err(|err| BenchError::resource("connect queue pair", err))?;
    if matches!(cfg.role, Role::Client) && cfg.transport.needs_ah() {
        qp.create_ah(&pd, remote.lid)
            .map_err(|err| BenchError::resource("create address handle", err))?;
    }
    if cfg.transport.is_raw_eth() {
        match cfg.role {
            Role::Client => write_eth_header(&mut mr, remote.mac, cfg.local_mac),
            Role::Daemon => qp
                .attach_flow(cfg.local_mac)
                .map_err(|err| BenchError::resource("attach flow rule", err))?,
        }
    }
    if matches!((cfg.role, cfg.opcode), (Role::Daemon, Operation::SendInv)) {
        // the advertised rkey only becomes valid once the window is bound;
        // binding rides the send queue, so the daemon walks to RTS first
        qp.modify_to_rts()
            .map_err(|err| BenchError::resource("reach ready-to-send for window bind", err))?;
        if let Some(mw) = &mw {
            posting::bind_window(&qp, mw, &mr, cfg.msg_size)
                .map_err(|err| BenchError::resource("bind memory window", err))?;
            traffic::drain_one(&cq)?;
            debug!("window bound, bind completion absorbed");
        }
    }

    match cfg.role {
        Role::Client => {
            let mut engine =
                PostingEngine::new(&qp, &mr, mw.as_ref(), remote.memory, remote.qp_num, cfg);
            oob.sync_ready(cfg.role)?;
            let stats = traffic::run_sender(&mut engine, &cq, cfg)?;
            oob.sync_done(cfg.role)?;
            let report = stats.report(cfg.iterations, cycles_per_nsec());
            Ok(Some(report))
        }
        Role::Daemon => {
            if cfg.opcode.consumes_receive_buffer() {
                let target = srq
                    .as_ref()
                    .map_or(RecvTarget::Qp(&qp), RecvTarget::Srq);
                let poster =
                    RecvPoster::new(target, &mr, cfg.msg_size.saturating_add(headroom), cfg.num_sge);
                let prepost = u32::from(cfg.ring_depth).min(cfg.iterations);
                poster
                    .post(prepost)
                    .map_err(arm_err)?;
                debug!("armed {prepost} receives");
                oob.sync_ready(cfg.role)?;
                traffic::run_receiver(&poster, &cq, cfg, prepost)?;
            } else {
                // one-sided and window opcodes complete entirely on the
                // client; this side only holds resources open
                oob.sync_ready(cfg.role)?;
            }
            oob.sync_done(cfg.role)?;
            info!("daemon run complete");
            Ok(None)
        }
    }
}

/// Which endpoints allocate a memory window: the client for the local
/// window opcodes, the daemon when its rkey is the invalidation target.
fn needs_memory_window(cfg: &Config) -> bool {
    match cfg.opcode {
        Operation::BindMw | Operation::LocalInv => matches!(cfg.role, Role::Client),
        Operation::SendInv => matches!(cfg.role, Role::Daemon),
        _ => false,
    }
}

/// Classify a receive-arming failure.
fn arm_err(err: io::Error) -> BenchError {
    BenchError::data_plane(format!("failed to arm receive queue: {err}"))
}

#[cfg(test)]
mod tests {
    use super::needs_memory_window;
    use crate::config::{tests::base_config, Config, Operation, PostApi, Role};

    #[test]
    fn window_allocation_sides() {
        let bind = Config {
            opcode: Operation::BindMw,
            post_api: PostApi::Extensible,
            batch_size: 1,
            iterations: 1,
            ..base_config()
        };
        assert!(needs_memory_window(&bind));
        let bind_daemon = Config {
            role: Role::Daemon,
            ..bind
        };
        assert!(!needs_memory_window(&bind_daemon));

        let send_inv_daemon = Config {
            opcode: Operation::SendInv,
            post_api: PostApi::Extensible,
            role: Role::Daemon,
            batch_size: 1,
            iterations: 1,
            ..base_config()
        };
        assert!(needs_memory_window(&send_inv_daemon));
        assert!(!needs_memory_window(&base_config()));
    }
}
