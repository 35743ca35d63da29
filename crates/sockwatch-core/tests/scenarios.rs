//! End-to-end probe scenarios against the userspace tracer

use proptest::prelude::*;
use sockwatch_common::probe::CorrelationStore;
use sockwatch_core::{
    Event, EventKind, SockEvent, SockRef, SocketTuple, TaskContext, Tracer, TracerConfig,
};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::Ordering;

const HOST: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);

fn outbound(local_port: u16, remote: SocketAddrV4) -> SocketTuple {
    SocketTuple::tcp(SocketAddrV4::new(HOST, local_port), remote)
}

fn connect_event(pid: u32, tuple: SocketTuple) -> Event {
    Event::Connect(SockEvent { pid, tuple })
}

#[test]
fn successful_connect_emits_one_record() {
    let tracer = Tracer::default();
    let t1 = TaskContext::new(0, 1000, 1001);
    let tuple = outbound(51000, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 443));
    let sock = tracer.sockets().open(tuple).unwrap();

    tracer.on_connect_enter(t1, sock);
    tracer.on_connect_return(t1, 0);

    let events = tracer.poll();
    assert_eq!(events, vec![connect_event(1000, tuple)]);

    // the exact bytes a consumer would read off the channel
    let bytes = events[0].encode();
    assert_eq!(bytes.len(), 28);
    assert_eq!(&bytes[0..4], &2u32.to_ne_bytes());
    assert_eq!(&bytes[4..8], &1000u32.to_ne_bytes());
    assert_eq!(&bytes[8..12], &6u32.to_ne_bytes());
    assert_eq!(&bytes[12..16], &HOST.octets());
    assert_eq!(&bytes[16..20], &51000u32.to_ne_bytes());
    assert_eq!(&bytes[20..24], &[10, 0, 0, 5]);
    assert_eq!(&bytes[24..28], &443u32.to_ne_bytes());
}

#[test]
fn refused_connect_emits_nothing() {
    let tracer = Tracer::default();
    let t1 = TaskContext::new(0, 1000, 1001);
    let sock = tracer
        .sockets()
        .open(outbound(51000, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 443)))
        .unwrap();

    tracer.on_connect_enter(t1, sock);
    tracer.on_connect_return(t1, -111);

    assert!(tracer.poll().is_empty());
    assert_eq!(tracer.store().get(t1.tid()), None);
}

#[test]
fn exec_then_exit_in_order() {
    let tracer = Tracer::default();
    let ctx = TaskContext::new(2, 4242, 4242);

    tracer.on_exec(ctx, 4242);
    tracer.on_exit(ctx, 4242);

    assert_eq!(
        tracer.poll(),
        vec![Event::Exec { pid: 4242 }, Event::Exit { pid: 4242 }]
    );
}

#[test]
fn evicted_entry_emits_nothing() {
    let tracer = Tracer::new(TracerConfig {
        correlation_capacity: 1,
        ..TracerConfig::default()
    });
    let remote = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 80);
    let a = TaskContext::new(0, 10, 11);
    let b = TaskContext::new(1, 20, 21);
    let sock_a = tracer.sockets().open(outbound(40001, remote)).unwrap();
    let sock_b = tracer.sockets().open(outbound(40002, remote)).unwrap();

    tracer.on_connect_enter(a, sock_a);
    tracer.on_connect_enter(b, sock_b);
    assert_eq!(tracer.store().len(), 1);

    tracer.on_connect_return(a, 0);
    tracer.on_connect_return(b, 0);

    assert_eq!(tracer.poll(), vec![connect_event(20, outbound(40002, remote))]);
    assert_eq!(tracer.stats().unobserved_connects.load(Ordering::Relaxed), 1);
    assert_eq!(tracer.store().evictions(), 1);
}

#[test]
fn superseded_connect_reports_latest_socket() {
    let tracer = Tracer::default();
    let t1 = TaskContext::new(0, 7, 7);
    let remote = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 22);
    let first = tracer.sockets().open(outbound(1111, remote)).unwrap();
    let second = tracer.sockets().open(outbound(2222, remote)).unwrap();

    tracer.on_connect_enter(t1, first);
    tracer.on_connect_enter(t1, second);
    tracer.on_connect_return(t1, 0);
    tracer.on_connect_return(t1, 0);

    assert_eq!(tracer.poll(), vec![connect_event(7, outbound(2222, remote))]);
}

#[test]
fn accept_null_and_non_null() {
    let tracer = Tracer::default();
    let ctx = TaskContext::new(0, 300, 301);
    let tuple = SocketTuple::tcp(
        SocketAddrV4::new(HOST, 8080),
        SocketAddrV4::new(Ipv4Addr::new(172, 16, 0, 3), 60000),
    );
    let sock = tracer.sockets().open(tuple).unwrap();

    tracer.on_accept_return(ctx, SockRef::NULL);
    tracer.on_accept_return(ctx, sock);

    assert_eq!(
        tracer.poll(),
        vec![Event::Accept(SockEvent { pid: 300, tuple })]
    );
}

#[test]
fn close_emits_and_clears_pending_connect() {
    let tracer = Tracer::default();
    let ctx = TaskContext::new(0, 500, 501);
    let tuple = outbound(45000, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 443));
    let sock = tracer.sockets().open(tuple).unwrap();

    // connect entry never sees its return
    tracer.on_connect_enter(ctx, sock);
    tracer.on_close(ctx, sock);

    assert_eq!(tracer.store().get(ctx.tid()), None);
    assert_eq!(
        tracer.poll(),
        vec![Event::Close(SockEvent { pid: 500, tuple })]
    );

    // the late return is now unobservable
    tracer.on_connect_return(ctx, 0);
    assert!(tracer.poll().is_empty());
}

#[test]
fn close_of_null_socket_still_cleans_up() {
    let tracer = Tracer::default();
    let ctx = TaskContext::new(0, 1, 2);
    tracer.store().put(ctx.tid(), SockRef(99));

    tracer.on_close(ctx, SockRef::NULL);

    assert!(tracer.poll().is_empty());
    assert!(tracer.store().is_empty());
}

#[test]
fn unreadable_socket_on_connect_return_removes_entry() {
    let tracer = Tracer::default();
    let ctx = TaskContext::new(0, 1, 2);
    let sock = tracer
        .sockets()
        .open(outbound(1, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 2)))
        .unwrap();

    tracer.on_connect_enter(ctx, sock);
    tracer.sockets().release(sock);
    tracer.on_connect_return(ctx, 0);

    assert!(tracer.poll().is_empty());
    assert_eq!(tracer.store().get(ctx.tid()), None);
}

#[test]
fn full_channel_drops_without_affecting_state() {
    let tracer = Tracer::new(TracerConfig {
        cpus: 1,
        channel_capacity: 1,
        ..TracerConfig::default()
    });
    let ctx = TaskContext::new(0, 9, 9);
    let sock = tracer
        .sockets()
        .open(outbound(3000, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 443)))
        .unwrap();

    tracer.on_exec(ctx, 9);
    tracer.on_connect_enter(ctx, sock);
    tracer.on_connect_return(ctx, 0);

    assert_eq!(tracer.store().get(ctx.tid()), None);
    let stats = tracer.stats();
    assert_eq!(stats.dropped(EventKind::Connect), 1);
    assert_eq!(tracer.channel().dropped(), 1);
    assert_eq!(tracer.poll(), vec![Event::Exec { pid: 9 }]);
}

#[test]
fn concurrent_cpus_each_report_their_connects() {
    let tracer = Tracer::new(TracerConfig {
        cpus: 4,
        channel_capacity: 256,
        correlation_capacity: 512,
        socket_capacity: 1024,
    });
    let remote = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 443);

    std::thread::scope(|scope| {
        for cpu in 0..4u32 {
            let tracer = &tracer;
            scope.spawn(move || {
                for i in 0..50u32 {
                    let ctx = TaskContext::new(cpu as usize, 100 + cpu, 1000 * (cpu + 1) + i);
                    let sock = tracer.sockets().open(outbound(20000 + i as u16, remote)).unwrap();
                    tracer.on_connect_enter(ctx, sock);
                    tracer.on_connect_return(ctx, 0);
                }
            });
        }
    });

    let events = tracer.poll();
    assert_eq!(events.len(), 200);
    for cpu in 0..4u32 {
        let ports = events
            .iter()
            .filter(|e| e.pid() == 100 + cpu)
            .filter_map(|e| e.tuple().map(|t| t.local.port()))
            .collect::<Vec<_>>();
        // FIFO within one CPU
        assert_eq!(ports, (0..50).map(|i| 20000 + i).collect::<Vec<u16>>());
    }
    assert!(tracer.store().is_empty());
}

proptest! {
    #[test]
    fn prop_connect_preserves_tuple(
        local in any::<[u8; 4]>(),
        local_port in any::<u16>(),
        remote in any::<[u8; 4]>(),
        remote_port in any::<u16>(),
        pid in any::<u32>(),
        tid in any::<u32>(),
    ) {
        let tracer = Tracer::default();
        let ctx = TaskContext::new(0, pid, tid);
        let tuple = SocketTuple::tcp(
            SocketAddrV4::new(Ipv4Addr::from(local), local_port),
            SocketAddrV4::new(Ipv4Addr::from(remote), remote_port),
        );
        let sock = tracer.sockets().open(tuple).unwrap();

        tracer.on_connect_enter(ctx, sock);
        tracer.on_connect_return(ctx, 0);

        prop_assert_eq!(tracer.poll(), vec![connect_event(pid, tuple)]);
    }

    #[test]
    fn prop_failed_connect_is_silent(rc in i32::MIN..0, tid in any::<u32>()) {
        let tracer = Tracer::default();
        let ctx = TaskContext::new(0, 1, tid);
        let sock = tracer
            .sockets()
            .open(outbound(1, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 2)))
            .unwrap();

        tracer.on_connect_enter(ctx, sock);
        tracer.on_connect_return(ctx, rc);

        prop_assert!(tracer.poll().is_empty());
        prop_assert!(tracer.store().is_empty());
    }

    #[test]
    fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
        let _ = Event::decode(&bytes);
    }
}
