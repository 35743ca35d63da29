//! Demo mode - drives the userspace tracer with scripted probe firings
//!
//! No bpf support or privileges needed. The script covers every handler path:
//! exec, a successful connect, a refused connect, a null and a real accept,
//! close and exit.

use crate::sink::EventSink;
use anyhow::Context;
use sockwatch_core::{Event, SockRef, SocketTuple, TaskContext, Tracer, TracerConfig};
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::info;

const HOST: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);

/// Demo options
pub struct DemoConfig {
    pub rounds: u32,
    pub correlation_capacity: usize,
    pub metrics: bool,
}

/// Run one scripted round and return the events it emitted
pub fn run_script(tracer: &Tracer, round: u32) -> anyhow::Result<Vec<Event>> {
    let client_pid = 4242 + round;
    let client = TaskContext::new(0, client_pid, client_pid);
    let server = TaskContext::new(1, 900, 901);
    let sockets = tracer.sockets();

    tracer.on_exec(client, client_pid);

    // outbound connect: the local port is bound while the call is in flight
    let remote = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 443);
    let sock = sockets
        .open(SocketTuple::tcp(SocketAddrV4::new(HOST, 0), remote))
        .context("socket arena exhausted")?;
    tracer.on_connect_enter(client, sock);
    sockets.update(sock, SocketTuple::tcp(SocketAddrV4::new(HOST, 51000), remote));
    tracer.on_connect_return(client, 0);

    // refused connect, ECONNREFUSED
    let refused = sockets
        .open(SocketTuple::tcp(
            SocketAddrV4::new(HOST, 51001),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 6), 8080),
        ))
        .context("socket arena exhausted")?;
    tracer.on_connect_enter(client, refused);
    tracer.on_connect_return(client, -111);
    sockets.release(refused);

    // spurious wakeup then a real inbound connection
    tracer.on_accept_return(server, SockRef::NULL);
    let accepted = sockets
        .open(SocketTuple::tcp(
            SocketAddrV4::new(HOST, 8080),
            SocketAddrV4::new(Ipv4Addr::new(172, 16, 0, 3), 60000),
        ))
        .context("socket arena exhausted")?;
    tracer.on_accept_return(server, accepted);

    tracer.on_close(client, sock);
    sockets.release(sock);
    tracer.on_close(server, accepted);
    sockets.release(accepted);

    tracer.on_exit(client, client_pid);

    Ok(tracer.poll())
}

pub fn demo_command(config: DemoConfig, sink: &mut EventSink) -> anyhow::Result<()> {
    info!("Starting demo mode ({} rounds)", config.rounds);

    let tracer = Tracer::new(TracerConfig {
        cpus: 2,
        correlation_capacity: config.correlation_capacity,
        ..TracerConfig::default()
    });

    for round in 0..config.rounds {
        for event in run_script(&tracer, round)? {
            sink.write(&event)?;
        }
    }
    sink.flush()?;

    let snapshot = tracer.stats().snapshot();
    info!(
        published = snapshot.total_published(),
        dropped = snapshot.total_dropped(),
        failed_connects = snapshot.failed_connects,
        "Demo finished"
    );

    if config.metrics {
        eprint!("{}", tracer.stats().to_prometheus());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sockwatch_core::EventKind;

    #[test]
    fn test_script_covers_every_kind() {
        let tracer = Tracer::default();
        let kinds = run_script(&tracer, 0)
            .unwrap()
            .iter()
            .map(Event::kind)
            .collect::<Vec<_>>();

        // CPU 0 stream first, then CPU 1
        assert_eq!(
            kinds,
            vec![
                EventKind::Exec,
                EventKind::Connect,
                EventKind::Close,
                EventKind::Exit,
                EventKind::Accept,
                EventKind::Close,
            ]
        );
    }

    #[test]
    fn test_connect_sees_bound_port() {
        let tracer = Tracer::default();
        let events = run_script(&tracer, 0).unwrap();
        let connect = events
            .iter()
            .find(|e| e.kind() == EventKind::Connect)
            .and_then(Event::tuple)
            .copied()
            .unwrap();
        assert_eq!(connect.local.port(), 51000);
        assert_eq!(connect.remote, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 443));
    }

    #[test]
    fn test_rounds_release_sockets() {
        let tracer = Tracer::default();
        for round in 0..3 {
            run_script(&tracer, round).unwrap();
        }
        assert_eq!(tracer.sockets().live(), 0);
        assert!(tracer.store().is_empty());
        assert_eq!(tracer.stats().failed_connects.load(std::sync::atomic::Ordering::Relaxed), 3);
    }
}
