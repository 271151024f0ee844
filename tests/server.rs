use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use hive_net::{EventLoop, TcpClient, TcpServer};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn round_robin_spreads_connections_evenly() {
    init_logging();
    let lp = EventLoop::new().unwrap();
    let addr = "127.0.0.1:0".parse().unwrap();

    let server = TcpServer::new(lp.handle(), &addr);
    server.set_num_threads(3);

    let per_worker: Arc<Mutex<HashMap<ThreadId, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let established = Arc::new(AtomicUsize::new(0));
    {
        let per_worker = per_worker.clone();
        let established = established.clone();
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                *per_worker
                    .lock()
                    .unwrap()
                    .entry(thread::current().id())
                    .or_insert(0) += 1;
                established.fetch_add(1, Ordering::AcqRel);
            }
        });
    }
    server.start();
    let server_addr = server.local_addr();

    let done = Arc::new(AtomicBool::new(false));
    let clients = {
        let done = done.clone();
        thread::spawn(move || {
            let mut streams = Vec::new();
            for _ in 0..6 {
                let mut stream = TcpStream::connect(server_addr).unwrap();
                stream.write_all(b"x").unwrap();
                streams.push(stream);
            }
            while !done.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(10));
            }
        })
    };

    let handle = lp.handle();
    {
        let established = established.clone();
        let quitter = handle.clone();
        lp.run_every(Duration::from_millis(10), move || {
            if established.load(Ordering::Acquire) == 6 {
                quitter.quit();
            }
        });
    }
    {
        let quitter = handle.clone();
        lp.run_after(Duration::from_secs(5), move || quitter.quit());
    }

    lp.run();
    done.store(true, Ordering::Release);
    clients.join().unwrap();

    let per_worker = per_worker.lock().unwrap();
    assert_eq!(established.load(Ordering::Acquire), 6);
    assert_eq!(per_worker.len(), 3, "expected 3 worker loops: {:?}", per_worker);
    for (worker, count) in per_worker.iter() {
        assert_eq!(*count, 2, "worker {:?} got {} connections", worker, count);
    }

    server.stop();
}

#[test]
fn large_transfer_round_trips_exactly() {
    init_logging();
    let lp = EventLoop::new().unwrap();
    let addr = "127.0.0.1:0".parse().unwrap();

    const PAYLOAD_LEN: usize = 100 * 1024;
    let payload: Vec<u8> = (0..PAYLOAD_LEN).map(|i| (i % 251) as u8).collect();

    let server = TcpServer::new(lp.handle(), &addr);
    server.set_num_threads(1);
    server.set_connection_callback(|conn| {
        if conn.connected() {
            conn.set_nodelay(true).unwrap();
        }
    });
    server.set_message_callback(|conn, buf| {
        let data = buf.retrieve_all_as_bytes();
        conn.send(&data);
    });
    server.start();

    let client = TcpClient::new(lp.handle(), server.local_addr());
    let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));
    let write_completed = Arc::new(AtomicBool::new(false));

    {
        let payload = payload.clone();
        client.set_connection_callback(move |conn| {
            if conn.connected() {
                conn.send(&payload);
            }
        });
    }
    {
        let flag = write_completed.clone();
        client.set_write_complete_callback(move |_conn| {
            flag.store(true, Ordering::Release);
        });
    }
    {
        let received = received.clone();
        let done = done.clone();
        client.set_message_callback(move |_conn, buf| {
            let mut received = received.lock().unwrap();
            received.extend_from_slice(&buf.retrieve_all_as_bytes());
            if received.len() >= PAYLOAD_LEN {
                done.store(true, Ordering::Release);
            }
        });
    }
    client.start();

    let handle = lp.handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    {
        let done = done.clone();
        let quitter = handle.clone();
        lp.run_every(Duration::from_millis(10), move || {
            if done.load(Ordering::Acquire) {
                quitter.quit();
            }
        });
    }
    {
        let quitter = handle.clone();
        let flag = timed_out.clone();
        lp.run_after(Duration::from_secs(10), move || {
            flag.store(true, Ordering::Release);
            quitter.quit();
        });
    }

    lp.run();

    assert!(!timed_out.load(Ordering::Acquire), "transfer timed out");
    let received = received.lock().unwrap();
    assert_eq!(received.len(), PAYLOAD_LEN);
    assert_eq!(*received, payload);

    // Steady state after the drain: nothing left in the send queue.
    assert!(write_completed.load(Ordering::Acquire));
    if let Some(conn) = client.connection() {
        assert_eq!(conn.output_readable_bytes(), 0);
    }

    client.stop();
    server.stop();
}

#[test]
fn high_water_mark_reports_backpressure() {
    init_logging();
    let lp = EventLoop::new().unwrap();
    let addr = "127.0.0.1:0".parse().unwrap();

    const PAYLOAD_LEN: usize = 16 * 1024 * 1024;
    const MARK: usize = 64 * 1024;

    let server = TcpServer::new(lp.handle(), &addr);
    server.set_num_threads(1);
    server.set_message_callback(move |conn, buf| {
        buf.retrieve_all();
        conn.send(&vec![b'z'; PAYLOAD_LEN]);
    });
    let high_water_size = Arc::new(AtomicUsize::new(0));
    {
        let high_water_size = high_water_size.clone();
        server.set_high_water_mark_callback(
            move |_conn, size| {
                high_water_size.store(size, Ordering::Release);
            },
            MARK,
        );
    }
    server.start();

    let client = TcpClient::new(lp.handle(), server.local_addr());
    let received = Arc::new(AtomicUsize::new(0));
    let reading = Arc::new(AtomicBool::new(true));
    {
        // Request the flood with reads paused, so the server's output
        // buffer must climb through the mark.
        let reading = reading.clone();
        client.set_connection_callback(move |conn| {
            if conn.connected() {
                conn.stop_read();
                reading.store(false, Ordering::Release);
                conn.send(b"go");
            }
        });
    }
    {
        let received = received.clone();
        client.set_message_callback(move |_conn, buf| {
            let len = buf.readable_bytes();
            buf.retrieve_all();
            received.fetch_add(len, Ordering::AcqRel);
        });
    }
    client.start();

    let handle = lp.handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    {
        let high_water_size = high_water_size.clone();
        let received = received.clone();
        let reading = reading.clone();
        let client = client.clone();
        let quitter = handle.clone();
        lp.run_every(Duration::from_millis(10), move || {
            if !reading.load(Ordering::Acquire) && high_water_size.load(Ordering::Acquire) > 0 {
                if let Some(conn) = client.connection() {
                    conn.start_read();
                    reading.store(true, Ordering::Release);
                }
            }
            if received.load(Ordering::Acquire) == PAYLOAD_LEN {
                quitter.quit();
            }
        });
    }
    {
        let quitter = handle.clone();
        let flag = timed_out.clone();
        lp.run_after(Duration::from_secs(20), move || {
            flag.store(true, Ordering::Release);
            quitter.quit();
        });
    }

    lp.run();

    assert!(!timed_out.load(Ordering::Acquire), "flood timed out");
    assert!(high_water_size.load(Ordering::Acquire) >= MARK);
    assert_eq!(received.load(Ordering::Acquire), PAYLOAD_LEN);

    client.stop();
    server.stop();
}

#[test]
fn stop_force_closes_established_connections() {
    init_logging();
    let lp = EventLoop::new().unwrap();
    let addr = "127.0.0.1:0".parse().unwrap();

    let server = TcpServer::new(lp.handle(), &addr);
    let established = Arc::new(AtomicBool::new(false));
    {
        let established = established.clone();
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                established.store(true, Ordering::Release);
            }
        });
    }
    server.start();
    let server_addr = server.local_addr();

    let eof_seen = Arc::new(AtomicBool::new(false));
    let reader = {
        let eof_seen = eof_seen.clone();
        thread::spawn(move || {
            let mut stream = TcpStream::connect(server_addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut buf = [0u8; 16];
            if let Ok(0) = stream.read(&mut buf) {
                eof_seen.store(true, Ordering::Release);
            }
        })
    };

    let handle = lp.handle();
    {
        let server = server.clone();
        lp.run_after(Duration::from_millis(200), move || server.stop());
    }
    {
        let eof_seen = eof_seen.clone();
        let quitter = handle.clone();
        lp.run_every(Duration::from_millis(10), move || {
            if eof_seen.load(Ordering::Acquire) {
                quitter.quit();
            }
        });
    }
    {
        let quitter = handle.clone();
        lp.run_after(Duration::from_secs(5), move || quitter.quit());
    }

    lp.run();
    reader.join().unwrap();

    assert!(established.load(Ordering::Acquire));
    assert!(eof_seen.load(Ordering::Acquire));
}
