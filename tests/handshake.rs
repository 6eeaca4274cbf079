//! Control-channel integration tests over loopback TCP. No RDMA hardware
//! involved: the handshake layer is exercised with synthetic endpoints.

use std::{
    net::{TcpListener, TcpStream},
    thread,
};

use portpicker::pick_unused_port;
use qpbench::{
    config::{Config, Operation, PostApi, Role},
    error::BenchError,
    handshake::{self, ConnParams, EndpointInfo, LocalEndpoint, MemoryInfo, OobChannel},
    transport::TransportKind,
};

fn config(role: Role, opcode: Operation, iterations: u32) -> Config {
    Config {
        dev_name: None,
        ip: "127.0.0.1".to_owned(),
        tcp_port: 0,
        role,
        transport: TransportKind::Rc,
        opcode,
        msg_size: 64,
        ring_depth: 16,
        batch_size: 4,
        num_sge: 1,
        post_api: PostApi::Extensible,
        use_inline: false,
        ext_atomics: false,
        local_mac: [0; 6],
        iterations,
    }
}

fn channel_pair() -> (OobChannel, OobChannel) {
    let port = pick_unused_port().unwrap();
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    let connector = thread::spawn(move || TcpStream::connect(("127.0.0.1", port)).unwrap());
    let (daemon_stream, _) = listener.accept().unwrap();
    let client_stream = connector.join().unwrap();
    (
        OobChannel::from_stream(client_stream),
        OobChannel::from_stream(daemon_stream),
    )
}

#[test]
fn endpoints_cross_the_channel() {
    let (mut client_ch, mut daemon_ch) = channel_pair();
    let client_cfg = config(Role::Client, Operation::Send, 100);
    let daemon_cfg = config(Role::Daemon, Operation::Send, 100);

    let daemon = thread::spawn(move || {
        let local = LocalEndpoint {
            qp_num: 0x22,
            lid: 0x2,
            mac: [0; 6],
            memory: None,
        };
        let remote = handshake::run(&mut daemon_ch, &daemon_cfg, &local).unwrap();
        daemon_ch.sync_ready(daemon_cfg.role).unwrap();
        daemon_ch.sync_done(daemon_cfg.role).unwrap();
        remote
    });

    let local = LocalEndpoint {
        qp_num: 0x11,
        lid: 0x1,
        mac: [0; 6],
        memory: None,
    };
    let remote = handshake::run(&mut client_ch, &client_cfg, &local).unwrap();
    client_ch.sync_ready(client_cfg.role).unwrap();
    client_ch.sync_done(client_cfg.role).unwrap();

    let daemon_view = daemon.join().unwrap();
    assert_eq!(remote.qp_num, 0x22);
    assert_eq!(remote.lid, 0x2);
    assert!(remote.memory.is_none());
    assert_eq!(daemon_view.qp_num, 0x11);
    assert_eq!(daemon_view.lid, 0x1);
}

#[test]
fn remote_access_opcodes_exchange_memory() {
    let (mut client_ch, mut daemon_ch) = channel_pair();
    let client_cfg = config(Role::Client, Operation::Write, 10);
    let daemon_cfg = config(Role::Daemon, Operation::Write, 10);

    let daemon = thread::spawn(move || {
        let local = LocalEndpoint {
            qp_num: 2,
            lid: 2,
            mac: [0; 6],
            memory: Some(MemoryInfo::new(0xBEEF, 0x1122_3344_5566_7788, 0)),
        };
        handshake::run(&mut daemon_ch, &daemon_cfg, &local).unwrap()
    });

    let local = LocalEndpoint {
        qp_num: 1,
        lid: 1,
        mac: [0; 6],
        memory: Some(MemoryInfo::new(0xFACE, 0x8877_6655_4433_2211, 0)),
    };
    let remote = handshake::run(&mut client_ch, &client_cfg, &local).unwrap();
    let daemon_view = daemon.join().unwrap();

    let mem = remote.memory.unwrap();
    assert_eq!(mem.rkey, 0xBEEF);
    assert_eq!(mem.addr, 0x1122_3344_5566_7788);
    let mem = daemon_view.memory.unwrap();
    assert_eq!(mem.rkey, 0xFACE);
    assert_eq!(mem.addr, 0x8877_6655_4433_2211);
}

#[test]
fn parameter_mismatch_fails_both_sides() {
    let (mut client_ch, mut daemon_ch) = channel_pair();
    let client_cfg = config(Role::Client, Operation::Send, 100);
    // daemon disagrees on the iteration count
    let daemon_cfg = config(Role::Daemon, Operation::Send, 200);

    let daemon = thread::spawn(move || {
        let local = LocalEndpoint {
            qp_num: 2,
            lid: 2,
            mac: [0; 6],
            memory: None,
        };
        handshake::run(&mut daemon_ch, &daemon_cfg, &local).is_err()
    });

    let local = LocalEndpoint {
        qp_num: 1,
        lid: 1,
        mac: [0; 6],
        memory: None,
    };
    let client_failed = handshake::run(&mut client_ch, &client_cfg, &local).is_err();
    assert!(client_failed);
    assert!(daemon.join().unwrap());
}

#[test]
fn misaligned_record_is_a_configuration_error() {
    let (mut client_ch, _daemon_ch) = channel_pair();
    // two bytes on the wire can never be a whole number of words
    let err = client_ch.send_info(&5_u16).unwrap_err();
    assert!(matches!(err, BenchError::Config(_)));
}

#[test]
fn oversized_peer_lid_is_rejected() {
    let (mut client_ch, mut daemon_ch) = channel_pair();
    let client_cfg = config(Role::Client, Operation::Send, 100);

    let peer = thread::spawn(move || {
        // echo the parameters, then advertise a link identifier wider than
        // the 16 bits the port attribute holds
        let params: ConnParams = daemon_ch.recv_info().unwrap();
        daemon_ch.send_info(&params).unwrap();
        let _ep: EndpointInfo = daemon_ch.recv_info().unwrap();
        let mut bogus = EndpointInfo::new(2, 0, [0; 6]);
        bogus.lid = 0x1_0000;
        daemon_ch.send_info(&bogus.into_be()).unwrap();
    });

    let local = LocalEndpoint {
        qp_num: 1,
        lid: 1,
        mac: [0; 6],
        memory: None,
    };
    let err = handshake::run(&mut client_ch, &client_cfg, &local).unwrap_err();
    assert!(matches!(err, BenchError::Protocol(_)));
    peer.join().unwrap();
}

#[test]
fn barriers_run_in_fixed_order() {
    let (mut client_ch, mut daemon_ch) = channel_pair();
    let daemon = thread::spawn(move || {
        daemon_ch.sync_ready(Role::Daemon).unwrap();
        daemon_ch.sync_done(Role::Daemon).unwrap();
    });
    client_ch.sync_ready(Role::Client).unwrap();
    client_ch.sync_done(Role::Client).unwrap();
    daemon.join().unwrap();
}
