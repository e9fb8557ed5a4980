//! End-to-end scenarios run against every engine kind over loopback.

use crate::metrics::{MetricsSink, SharedBuffer, CSV_HEADER};
use crate::protocol::{frame, message, DEFAULT_MAX_FRAME_LEN};
use crate::runtime::{
    async_supported, new_engine_with, ClientLimit, Engine, EngineKind, EngineSettings,
    GrowableBuffer,
};
use crate::transform::{sort_in_place, QuadraticSort, Transform};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const RUN_TIMEOUT: Duration = Duration::from_secs(20);

struct Running {
    engine: Arc<dyn Engine>,
    metrics: SharedBuffer,
    handle: JoinHandle<io::Result<()>>,
}

impl Running {
    fn addr(&self) -> SocketAddr {
        self.engine.local_addr()
    }

    /// Wait for `start` to return.
    fn finish(self) -> (Arc<dyn Engine>, SharedBuffer) {
        let deadline = Instant::now() + RUN_TIMEOUT;
        while !self.handle.is_finished() {
            assert!(Instant::now() < deadline, "engine did not stop in time");
            thread::sleep(Duration::from_millis(5));
        }
        self.handle.join().unwrap().unwrap();
        (self.engine, self.metrics)
    }
}

fn supported(kind: EngineKind) -> bool {
    kind != EngineKind::Async || async_supported()
}

fn launch(kind: EngineKind, limit: ClientLimit, transform: Arc<dyn Transform>) -> Running {
    let mut settings = EngineSettings::new("127.0.0.1:0".parse().unwrap());
    settings.workers = 4;
    settings.initial_buffer = 16;
    settings.dispatchers = 2;

    let metrics = SharedBuffer::new();
    let sink = Arc::new(MetricsSink::new(Box::new(metrics.clone())));
    let engine = new_engine_with(kind, settings, sink, transform).unwrap();

    let handle = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.start(limit))
    };
    Running {
        engine,
        metrics,
        handle,
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(RUN_TIMEOUT)).unwrap();
    stream
}

fn send_array(stream: &mut TcpStream, values: &[i32]) {
    frame::write_frame(stream, &message::encode(values)).unwrap();
}

fn recv_array(stream: &mut TcpStream) -> Vec<i32> {
    let mut buf = GrowableBuffer::new(64);
    frame::read_frame(stream, &mut buf, DEFAULT_MAX_FRAME_LEN)
        .unwrap()
        .expect("connection closed before a response");
    message::decode(buf.filled()).unwrap().values
}

/// Assert the server closed the connection without sending anything.
fn assert_closed_silently(stream: &mut TcpStream) {
    let mut rest = Vec::new();
    // A reset is as good as a close here
    let _ = stream.read_to_end(&mut rest);
    assert!(rest.is_empty(), "unexpected response bytes: {rest:?}");
}

/// Sorts, after sleeping longer for requests whose smallest value is lower.
/// Early requests of a pipeline therefore finish last.
struct StaggeredSort;

impl Transform for StaggeredSort {
    fn apply(&self, values: &mut [i32]) {
        let min = values.iter().copied().min().unwrap_or(0).clamp(0, 10);
        thread::sleep(Duration::from_millis((10 - min) as u64 * 3));
        sort_in_place(values);
    }
}

fn sorts_request(kind: EngineKind) {
    let running = launch(kind, ClientLimit::Bounded(1), Arc::new(QuadraticSort));
    let mut client = connect(running.addr());

    send_array(&mut client, &[5, 3, 3, 1]);
    assert_eq!(recv_array(&mut client), vec![1, 3, 3, 5]);

    let descending: Vec<i32> = (1..=4096).rev().collect();
    send_array(&mut client, &descending);
    assert_eq!(recv_array(&mut client), (1..=4096).collect::<Vec<_>>());
    drop(client);

    let (engine, _) = running.finish();
    let stats = engine.stats();
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.graceful_closes, 1);
    assert_eq!(stats.violations, 0);
}

fn zero_length_header_ends_session(kind: EngineKind) {
    let running = launch(kind, ClientLimit::Bounded(1), Arc::new(QuadraticSort));
    let mut client = connect(running.addr());

    client.write_all(&0i32.to_be_bytes()).unwrap();
    assert_closed_silently(&mut client);

    let (engine, _) = running.finish();
    let stats = engine.stats();
    assert_eq!(stats.requests, 0);
    assert_eq!(stats.graceful_closes, 1);
    assert_eq!(stats.violations, 0);
}

fn truncated_body_is_violation(kind: EngineKind) {
    let running = launch(kind, ClientLimit::Bounded(1), Arc::new(QuadraticSort));
    let mut client = connect(running.addr());

    client.write_all(&100i32.to_be_bytes()).unwrap();
    client.write_all(&[0x0a; 10]).unwrap();
    client.shutdown(Shutdown::Write).unwrap();
    assert_closed_silently(&mut client);

    let (engine, _) = running.finish();
    let stats = engine.stats();
    assert_eq!(stats.requests, 0);
    assert_eq!(stats.violations, 1);
}

fn malformed_payload_is_violation(kind: EngineKind) {
    let running = launch(kind, ClientLimit::Bounded(1), Arc::new(QuadraticSort));
    let mut client = connect(running.addr());

    frame::write_frame(&mut client, &[0x0a, 0x05, 0x01]).unwrap();
    assert_closed_silently(&mut client);

    let (engine, _) = running.finish();
    assert_eq!(engine.stats().violations, 1);
}

fn empty_array_is_violation(kind: EngineKind) {
    let running = launch(kind, ClientLimit::Bounded(1), Arc::new(QuadraticSort));
    let mut client = connect(running.addr());

    frame::write_frame(&mut client, &[0x0a, 0x00]).unwrap();
    assert_closed_silently(&mut client);

    let (engine, _) = running.finish();
    let stats = engine.stats();
    assert_eq!(stats.violations, 1);
    assert_eq!(stats.requests, 0);
}

fn bounded_run_stops_after_clients(kind: EngineKind) {
    let running = launch(kind, ClientLimit::Bounded(3), Arc::new(QuadraticSort));
    let addr = running.addr();

    let clients: Vec<_> = (0..3)
        .map(|i| {
            thread::spawn(move || {
                let mut client = connect(addr);
                send_array(&mut client, &[i, 2, 1]);
                let mut expected = vec![i, 2, 1];
                expected.sort();
                assert_eq!(recv_array(&mut client), expected);
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    let (engine, metrics) = running.finish();
    let stats = engine.stats();
    assert_eq!(stats.accepted, 3);
    assert_eq!(stats.requests, 3);
    assert_eq!(stats.graceful_closes, 3);

    let output = metrics.contents();
    let mut lines = output.lines();
    assert_eq!(lines.next(), Some(CSV_HEADER));
    let records: Vec<(u128, u128)> = lines
        .map(|line| {
            let (processing, response) = line.split_once(',').unwrap();
            (processing.parse().unwrap(), response.parse().unwrap())
        })
        .collect();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|(processing, response)| processing <= response));
}

fn pipelined_responses_keep_order(kind: EngineKind) {
    let running = launch(kind, ClientLimit::Bounded(2), Arc::new(StaggeredSort));
    let addr = running.addr();

    let clients: Vec<_> = (0..2)
        .map(|_| {
            thread::spawn(move || {
                let mut client = connect(addr);
                for i in 0..10 {
                    send_array(&mut client, &[1000, 999, i]);
                }
                for i in 0..10 {
                    assert_eq!(recv_array(&mut client), vec![i, 999, 1000]);
                }
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    let (engine, _) = running.finish();
    assert_eq!(engine.stats().requests, 20);
}

fn shutdown_stops_unbounded_run(kind: EngineKind) {
    let running = launch(kind, ClientLimit::Unbounded, Arc::new(QuadraticSort));
    let mut client = connect(running.addr());
    send_array(&mut client, &[2, 1]);
    assert_eq!(recv_array(&mut client), vec![1, 2]);

    // The connection stays open across the shutdown
    running.engine.shutdown();
    let (engine, _) = running.finish();
    assert_eq!(engine.stats().requests, 1);
    assert_closed_silently(&mut client);
}

fn zero_clients_returns_immediately(kind: EngineKind) {
    let running = launch(kind, ClientLimit::Bounded(0), Arc::new(QuadraticSort));
    let (engine, metrics) = running.finish();
    assert_eq!(engine.stats().accepted, 0);
    assert_eq!(metrics.contents().lines().next(), Some(CSV_HEADER));
}

fn second_start_is_rejected(kind: EngineKind) {
    let running = launch(kind, ClientLimit::Bounded(0), Arc::new(QuadraticSort));
    let (engine, _) = running.finish();
    let err = engine.start(ClientLimit::Bounded(0)).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
}

macro_rules! engine_scenarios {
    ($($module:ident => $kind:expr),* $(,)?) => {
        $(
            mod $module {
                use super::*;

                engine_scenarios!(@tests $kind;
                    sorts_request,
                    zero_length_header_ends_session,
                    truncated_body_is_violation,
                    malformed_payload_is_violation,
                    empty_array_is_violation,
                    bounded_run_stops_after_clients,
                    pipelined_responses_keep_order,
                    shutdown_stops_unbounded_run,
                    zero_clients_returns_immediately,
                    second_start_is_rejected,
                );
            }
        )*
    };
    (@tests $kind:expr; $($scenario:ident),* $(,)?) => {
        $(
            #[test]
            fn $scenario() {
                if supported($kind) {
                    super::$scenario($kind);
                }
            }
        )*
    };
}

engine_scenarios! {
    blocking => EngineKind::Blocking,
    reactor => EngineKind::Reactor,
    completion => EngineKind::Async,
}
