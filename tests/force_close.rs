use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use hive_net::{EventLoop, TcpConnectionRef, TcpServer};

#[test]
fn force_close_from_ten_threads_closes_exactly_once() {
    let _ = env_logger::builder().is_test(true).try_init();

    let lp = EventLoop::new().unwrap();
    let addr = "127.0.0.1:0".parse().unwrap();

    let server = TcpServer::new(lp.handle(), &addr);
    let victim: Arc<Mutex<Option<TcpConnectionRef>>> = Arc::new(Mutex::new(None));
    let disconnects = Arc::new(AtomicUsize::new(0));
    {
        let victim = victim.clone();
        let disconnects = disconnects.clone();
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                *victim.lock().unwrap() = Some(conn.clone());
            } else {
                disconnects.fetch_add(1, Ordering::AcqRel);
            }
        });
    }
    server.start();
    let server_addr = server.local_addr();

    let done = Arc::new(AtomicBool::new(false));
    let holder = {
        let done = done.clone();
        thread::spawn(move || {
            let mut stream = TcpStream::connect(server_addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut buf = [0u8; 1];
            let _ = stream.read(&mut buf);
            while !done.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(10));
            }
        })
    };

    let closers = {
        let victim = victim.clone();
        thread::spawn(move || {
            let conn = loop {
                if let Some(conn) = victim.lock().unwrap().clone() {
                    break conn;
                }
                thread::sleep(Duration::from_millis(5));
            };

            let barrier = Arc::new(Barrier::new(10));
            let mut threads = Vec::new();
            for _ in 0..10 {
                let conn = conn.clone();
                let barrier = barrier.clone();
                threads.push(thread::spawn(move || {
                    barrier.wait();
                    conn.force_close();
                }));
            }
            for thread in threads {
                thread.join().unwrap();
            }
        })
    };

    let handle = lp.handle();
    {
        let disconnects = disconnects.clone();
        let armed = Arc::new(AtomicBool::new(false));
        let scheduler = handle.clone();
        let quitter = handle.clone();
        lp.run_every(Duration::from_millis(10), move || {
            if disconnects.load(Ordering::Acquire) > 0 && !armed.swap(true, Ordering::AcqRel) {
                // Give any late duplicate close a window to surface.
                let quitter = quitter.clone();
                scheduler.run_after(Duration::from_millis(200), move || quitter.quit());
            }
        });
    }
    {
        let quitter = handle.clone();
        lp.run_after(Duration::from_secs(5), move || quitter.quit());
    }

    lp.run();
    done.store(true, Ordering::Release);
    closers.join().unwrap();
    holder.join().unwrap();

    assert_eq!(disconnects.load(Ordering::Acquire), 1);

    server.stop();
}
