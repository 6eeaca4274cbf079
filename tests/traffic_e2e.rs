//! End-to-end runs over a real RDMA device in loopback.
//!
//! These need an HCA whose port can reach itself (software devices such as
//! rxe work); run them explicitly with `cargo test -- --ignored`.

use std::{thread, time::Duration};

use portpicker::pick_unused_port;
use qpbench::{
    config::{Config, Operation, PostApi, Role},
    run,
    transport::TransportKind,
};

fn config(role: Role, port: u16) -> Config {
    Config {
        dev_name: None,
        ip: "127.0.0.1".to_owned(),
        tcp_port: port,
        role,
        transport: TransportKind::Rc,
        opcode: Operation::Send,
        msg_size: 64,
        ring_depth: 16,
        batch_size: 4,
        num_sge: 1,
        post_api: PostApi::Legacy,
        use_inline: false,
        ext_atomics: false,
        local_mac: [0; 6],
        iterations: 100,
    }
}

fn run_pair(mutate: impl Fn(&mut Config)) {
    let port = pick_unused_port().unwrap();
    let mut daemon_cfg = config(Role::Daemon, port);
    mutate(&mut daemon_cfg);
    let daemon_cfg = daemon_cfg.normalize_and_validate().unwrap();
    let daemon = thread::spawn(move || run::execute(&daemon_cfg).unwrap());

    // let the daemon reach its accept call
    thread::sleep(Duration::from_millis(200));
    let mut client_cfg = config(Role::Client, port);
    mutate(&mut client_cfg);
    let client_cfg = client_cfg.normalize_and_validate().unwrap();
    let report = run::execute(&client_cfg).unwrap();

    assert!(daemon.join().unwrap().is_none());
    let report = report.expect("client produces a latency report");
    assert!(*report.avg_message_ns() > 0.0);
}

#[test]
#[ignore = "requires an RDMA device"]
fn rc_send_legacy() {
    run_pair(|_| {});
}

#[test]
#[ignore = "requires an RDMA device"]
fn rc_send_extensible_inline() {
    run_pair(|cfg| {
        cfg.post_api = PostApi::Extensible;
        cfg.use_inline = true;
        cfg.msg_size = 32;
    });
}

#[test]
#[ignore = "requires an RDMA device"]
fn rc_send_alternating() {
    run_pair(|cfg| {
        cfg.post_api = PostApi::Alternating;
    });
}

#[test]
#[ignore = "requires an RDMA device"]
fn rc_write_extensible() {
    run_pair(|cfg| {
        cfg.opcode = Operation::Write;
        cfg.post_api = PostApi::Extensible;
    });
}

#[test]
#[ignore = "requires an RDMA device"]
fn rc_read_extensible() {
    run_pair(|cfg| {
        cfg.opcode = Operation::Read;
        cfg.post_api = PostApi::Extensible;
    });
}

#[test]
#[ignore = "requires an RDMA device"]
fn rc_fetch_add() {
    run_pair(|cfg| {
        cfg.opcode = Operation::FetchAdd;
        cfg.post_api = PostApi::Extensible;
        cfg.msg_size = 8;
    });
}

#[test]
#[ignore = "requires an RDMA device"]
fn ud_send_extensible() {
    run_pair(|cfg| {
        cfg.transport = TransportKind::Ud;
        cfg.post_api = PostApi::Extensible;
    });
}

#[test]
#[ignore = "requires an RDMA device with XRC support"]
fn xrc_send_recv_extensible() {
    // the two sides run different transport halves, so the shared mutate
    // helper does not fit here
    let port = pick_unused_port().unwrap();
    let mut daemon_cfg = config(Role::Daemon, port);
    daemon_cfg.transport = TransportKind::XrcRecv;
    daemon_cfg.post_api = PostApi::Extensible;
    let daemon_cfg = daemon_cfg.normalize_and_validate().unwrap();
    let daemon = thread::spawn(move || run::execute(&daemon_cfg).unwrap());

    thread::sleep(Duration::from_millis(200));
    let mut client_cfg = config(Role::Client, port);
    client_cfg.transport = TransportKind::XrcSend;
    client_cfg.post_api = PostApi::Extensible;
    let client_cfg = client_cfg.normalize_and_validate().unwrap();
    let report = run::execute(&client_cfg).unwrap();

    assert!(daemon.join().unwrap().is_none());
    assert!(report.is_some());
}

#[test]
#[ignore = "requires an RDMA device with memory-window support"]
fn bind_memory_window() {
    run_pair(|cfg| {
        cfg.opcode = Operation::BindMw;
        cfg.post_api = PostApi::Extensible;
        cfg.batch_size = 1;
        cfg.iterations = 1;
    });
}
