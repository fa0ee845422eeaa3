mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    thread,
};

use bolt_codec::Value;
use bolt_driver::{
    Auth, CellResult, Command, DriverConfig, Pool, ResultKind, message,
};
use common::{MockServer, listen};

fn serve_one_query(mut srv: MockServer) {
    srv.serve_hello_v5();
    srv.expect_tag(message::RUN);
    srv.expect_tag(message::PULL);
    let fields = [Value::String("n")];
    srv.send_success(&[("fields", Value::list(&fields))]);
    srv.send_record(&[Value::Int(7)]);
    srv.send_success(&[]);
    srv.wait_close();
}

#[test]
fn pool_round_robins_live_cells() {
    let (listener, addr) = listen();

    let server = thread::spawn(move || {
        let mut workers = Vec::new();
        for _ in 0..2 {
            let srv = MockServer::accept(&listener);
            workers.push(thread::spawn(move || serve_one_query(srv)));
        }
        for w in workers {
            w.join().unwrap();
        }
    });

    let mut pool = Pool::new(DriverConfig {
        address: addr,
        auth: Auth::Basic { principal: "neo".into(), credentials: "secret".into() },
        cells: 2,
        ..DriverConfig::default()
    });
    assert!(pool.start().is_ok());
    assert_eq!(pool.len(), 2);

    // Two acquires land on the two distinct cells.
    let first = pool.acquire();
    let second = pool.acquire();
    assert_ne!(first.client_id(), second.client_id());

    for cell in [first, second] {
        assert!(cell.enqueue(Command::run("RETURN 7")).is_ok());
    }
    for cell in [first, second] {
        let mut result = CellResult::empty();
        assert_eq!(cell.fetch(&mut result), 1);
        assert_eq!(result.record().expect("record").get(0), Value::Int(7));
        assert_eq!(cell.fetch(&mut result), 0);
    }

    pool.stop();
    server.join().unwrap();
}

#[test]
fn completion_callback_runs_on_decoder_thread() {
    let (listener, addr) = listen();

    let server = thread::spawn(move || {
        let srv = MockServer::accept(&listener);
        serve_one_query(srv);
    });

    let mut pool = Pool::new(DriverConfig {
        address: addr,
        auth: Auth::Basic { principal: "neo".into(), credentials: "secret".into() },
        ..DriverConfig::default()
    });
    assert!(pool.start().is_ok());

    let completions = Arc::new(AtomicU32::new(0));
    let seen = completions.clone();
    let cmd = Command::run("RETURN 7").with_callback(Box::new(move |result| {
        assert_eq!(result.kind(), ResultKind::Summary);
        seen.fetch_add(1, Ordering::Release);
    }));

    let cell = pool.acquire();
    assert!(cell.enqueue(cmd).is_ok());

    let mut result = CellResult::empty();
    assert_eq!(cell.fetch(&mut result), 1);
    assert_eq!(cell.fetch(&mut result), 0);
    // Completion fired exactly once, before its result was fetchable.
    assert_eq!(completions.load(Ordering::Acquire), 1);

    pool.stop();
    server.join().unwrap();
}
