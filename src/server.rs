use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use indexmap::IndexMap;

use crate::acceptor::Acceptor;
use crate::callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionRef,
    ThreadInitCallback, WriteCompleteCallback,
};
use crate::connection::TcpConnection;
use crate::event_loop::LoopHandle;
use crate::event_loop_thread_pool::EventLoopThreadPool;

/// Connections owned by one worker loop, in insertion order.
///
/// Only that worker's thread touches the map, so the lock is uncontended;
/// it exists to keep the set reachable from the base loop for teardown.
struct ConnectionSet {
    connections: Mutex<IndexMap<u64, TcpConnectionRef>>,
}

impl ConnectionSet {
    fn new() -> Arc<ConnectionSet> {
        Arc::new(ConnectionSet {
            connections: Mutex::new(IndexMap::new()),
        })
    }
}

/// Multi-reactor TCP server: one acceptor on the base loop, per-connection
/// I/O spread over a worker pool by round-robin.
///
/// There is no global connection table; each accepted connection is owned
/// by the worker loop it was assigned to, for its whole lifetime.
pub struct TcpServer {
    base: LoopHandle,
    acceptor: Arc<Acceptor>,
    pool: Arc<EventLoopThreadPool>,
    local: SocketAddr,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    // Index-aligned with `pool.get_all_loops()`, built at start.
    sets: Mutex<Vec<(LoopHandle, Arc<ConnectionSet>)>>,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    thread_init_cb: Mutex<Option<ThreadInitCallback>>,
    high_water: Mutex<Option<(HighWaterMarkCallback, usize)>>,
    me: Weak<TcpServer>,
}

impl TcpServer {
    /// Create a server bound to `addr`. The listening socket is bound
    /// eagerly, so `local_addr` is exact even for port-0 binds; a bind
    /// failure aborts.
    pub fn new(base: LoopHandle, addr: &SocketAddr) -> Arc<TcpServer> {
        let acceptor = Acceptor::new(base.clone(), addr);
        let local = acceptor.local_addr();
        log::info!("TcpServer::new() {}", local);

        Arc::new_cyclic(|me| TcpServer {
            pool: Arc::new(EventLoopThreadPool::new(base.clone())),
            base,
            acceptor,
            local,
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            sets: Mutex::new(Vec::new()),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            thread_init_cb: Mutex::new(None),
            high_water: Mutex::new(None),
            me: me.clone(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Worker count, excluding the base loop. Must precede `start`.
    pub fn set_num_threads(&self, n: usize) {
        assert!(!self.started.load(Ordering::Acquire));
        self.pool.set_num_threads(n);
    }

    pub fn set_connection_callback<F>(&self, cb: F)
    where
        F: Fn(&TcpConnectionRef) + Send + Sync + 'static,
    {
        *self.connection_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_message_callback<F>(&self, cb: F)
    where
        F: Fn(&TcpConnectionRef, &mut crate::Buffer) + Send + Sync + 'static,
    {
        *self.message_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback<F>(&self, cb: F)
    where
        F: Fn(&TcpConnectionRef) + Send + Sync + 'static,
    {
        *self.write_complete_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_thread_init_callback<F>(&self, cb: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        *self.thread_init_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Install backpressure reporting for every accepted connection.
    pub fn set_high_water_mark_callback<F>(&self, cb: F, mark: usize)
    where
        F: Fn(&TcpConnectionRef, usize) + Send + Sync + 'static,
    {
        *self.high_water.lock().unwrap() = Some((Arc::new(cb), mark));
    }

    /// Start the worker pool and begin accepting. Idempotent; the actual
    /// work runs on the base loop.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(me) = self.me.upgrade() {
            self.base.run_in_loop(move |_| me.start_in_loop());
        }
    }

    fn start_in_loop(&self) {
        self.base.assert_in_loop_thread();

        self.pool.start();
        let loops = self.pool.get_all_loops();

        {
            let mut sets = self.sets.lock().unwrap();
            *sets = loops
                .iter()
                .map(|lp| (lp.clone(), ConnectionSet::new()))
                .collect();
        }

        if let Some(init) = self.thread_init_cb.lock().unwrap().clone() {
            init(0);
            for (index, worker) in loops.iter().enumerate().skip(1) {
                let init = init.clone();
                worker.run_in_loop(move |_| init(index));
            }
        }

        let me = self.me.clone();
        self.acceptor
            .set_new_connection_callback(Box::new(move |_lp, sock, local, peer| {
                if let Some(server) = me.upgrade() {
                    server.new_connection(sock, local, peer);
                }
            }));
        self.acceptor.listen();

        log::info!(
            "TcpServer::start() {} with {} event loop(s)",
            self.local,
            loops.len()
        );
    }

    /// Accepted on the base loop: pick the next worker round-robin and
    /// finish the connection setup over there.
    fn new_connection(&self, sock: crate::sys::socket::TcpSock, local: SocketAddr, peer: SocketAddr) {
        self.base.assert_in_loop_thread();

        let io_loop = self.pool.get_next_loop();
        let set = {
            let sets = self.sets.lock().unwrap();
            match sets.iter().find(|(lp, _)| lp.same_loop(&io_loop)) {
                Some((_, set)) => set.clone(),
                None => {
                    log::error!("TcpServer::new_connection() unknown loop, dropping {}", peer);
                    return;
                }
            }
        };

        let id = self.next_conn_id.fetch_add(1, Ordering::AcqRel);
        let message_cb = self.message_cb.lock().unwrap().clone();
        let write_complete_cb = self.write_complete_cb.lock().unwrap().clone();
        let connection_cb = self.connection_cb.lock().unwrap().clone();
        let high_water = self.high_water.lock().unwrap().clone();

        let close_set = set.clone();
        let close_connection_cb = connection_cb.clone();

        io_loop.run_in_loop(move |lp| {
            let conn = TcpConnection::new(lp.handle(), sock, local, peer);

            if let Some(cb) = message_cb {
                conn.set_message_callback(cb);
            }
            if let Some(cb) = write_complete_cb {
                conn.set_write_complete_callback(cb);
            }
            if let Some((cb, mark)) = high_water {
                conn.set_high_water_mark_callback(cb, mark);
            }
            conn.set_close_callback(Arc::new(move |conn: &TcpConnectionRef| {
                if let Some(cb) = &close_connection_cb {
                    cb(conn);
                }
                close_set.connections.lock().unwrap().shift_remove(&id);
            }));

            set.connections.lock().unwrap().insert(id, conn.clone());
            conn.connect_established(lp);

            if let Some(cb) = &connection_cb {
                cb(&conn);
            }
        });
    }

    /// Stop accepting and force-close every connection on its owning
    /// worker.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }

        let acceptor = self.acceptor.clone();
        self.base.run_in_loop(move |_| acceptor.stop());

        let sets = self.sets.lock().unwrap().clone();
        for (worker, set) in sets {
            worker.run_in_loop(move |_| {
                let connections: Vec<TcpConnectionRef> =
                    set.connections.lock().unwrap().values().cloned().collect();
                for conn in connections {
                    conn.force_close();
                }
            });
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        log::trace!("TcpServer::drop() {}", self.local);
        if self.started.load(Ordering::Acquire) {
            let acceptor = self.acceptor.clone();
            self.base.run_in_loop(move |_| acceptor.stop());
        }
    }
}
