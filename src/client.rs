use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::callbacks::{
    ConnectionCallback, ErrorCallback, MessageCallback, TcpConnectionRef, WriteCompleteCallback,
};
use crate::connection::TcpConnection;
use crate::connector::{ConnectError, Connector};
use crate::event_loop::LoopHandle;
use crate::timer::TimerHandle;

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(3);

/// TCP client: one connector, at most one live connection, and a retry
/// timer that keeps dialing while disconnected.
///
/// The retry timer is canceled on a successful connect and re-armed when
/// the connection is lost (until [`stop`] is called). A
/// [`ConnectError::Fatal`] outcome ends retrying for good: the error
/// callback fires once with the classification and the timer is torn
/// down. Dropping the client force-closes any live connection.
///
/// [`stop`]: TcpClient::stop
pub struct TcpClient {
    loop_: LoopHandle,
    peer: SocketAddr,
    connector: Arc<Connector>,
    connection: Mutex<Option<TcpConnectionRef>>,
    connected: AtomicBool,
    started: AtomicBool,
    fatal_error: AtomicBool,
    retry_timer: Mutex<Option<TimerHandle>>,
    reconnect_interval: Mutex<Duration>,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    error_cb: Mutex<Option<ErrorCallback>>,
    me: Weak<TcpClient>,
}

impl TcpClient {
    pub fn new(loop_: LoopHandle, peer: SocketAddr) -> Arc<TcpClient> {
        let client = Arc::new_cyclic(|me: &Weak<TcpClient>| TcpClient {
            connector: Connector::new(loop_.clone(), peer),
            loop_,
            peer,
            connection: Mutex::new(None),
            connected: AtomicBool::new(false),
            started: AtomicBool::new(false),
            fatal_error: AtomicBool::new(false),
            retry_timer: Mutex::new(None),
            reconnect_interval: Mutex::new(DEFAULT_RECONNECT_INTERVAL),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            error_cb: Mutex::new(None),
            me: me.clone(),
        });

        let weak = Arc::downgrade(&client);
        client
            .connector
            .set_new_connection_callback(Box::new(move |lp, sock, local, peer| {
                if let Some(client) = weak.upgrade() {
                    client.new_connection(lp, sock, local, peer);
                }
            }));

        let weak = Arc::downgrade(&client);
        client
            .connector
            .set_error_callback(Arc::new(move |kind: ConnectError| {
                if let Some(client) = weak.upgrade() {
                    client.connect_error(kind);
                }
            }));

        client
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<TcpConnectionRef> {
        self.connection.lock().unwrap().clone()
    }

    /// Retry pacing; must precede `start`.
    pub fn set_reconnect_interval(&self, interval: Duration) {
        *self.reconnect_interval.lock().unwrap() = interval;
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

    /// Fires on each failed connect attempt with its classification.
    pub fn set_error_callback<F>(&self, cb: F)
    where
        F: Fn(ConnectError) + Send + Sync + 'static,
    {
        *self.error_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Dial the peer and keep retrying while disconnected. Idempotent.
    pub fn start(&self) {
        if self.fatal_error.load(Ordering::Acquire) {
            log::warn!("TcpClient::start() {} failed fatally before, not dialing", self.peer);
            return;
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        self.connector.start();
        self.arm_retry_timer();
    }

    fn arm_retry_timer(&self) {
        let interval = *self.reconnect_interval.lock().unwrap();
        let weak = self.me.clone();
        let timer = self.loop_.run_every(interval, move || {
            if let Some(client) = weak.upgrade() {
                client.retry();
            }
        });
        *self.retry_timer.lock().unwrap() = Some(timer);
    }

    fn retry(&self) {
        if self.connected()
            || self.fatal_error.load(Ordering::Acquire)
            || !self.started.load(Ordering::Acquire)
        {
            return;
        }
        log::warn!("TcpClient::retry() reconnect {}...", self.peer);
        self.connector.restart();
    }

    /// A Fatal classification ends retrying; either way the user's error
    /// callback hears about the attempt.
    fn connect_error(&self, kind: ConnectError) {
        if kind == ConnectError::Fatal {
            log::error!("TcpClient::connect_error() {} fatal, giving up", self.peer);
            self.fatal_error.store(true, Ordering::Release);
            self.cancel_retry_timer();
        }

        let cb = self.error_cb.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(kind);
        }
    }

    fn cancel_retry_timer(&self) {
        if let Some(timer) = self.retry_timer.lock().unwrap().take() {
            timer.cancel();
        }
    }

    fn new_connection(
        &self,
        lp: &crate::EventLoop,
        sock: crate::sys::socket::TcpSock,
        local: SocketAddr,
        peer: SocketAddr,
    ) {
        lp.assert_in_loop_thread();
        self.cancel_retry_timer();
        self.connected.store(true, Ordering::Release);

        let conn = TcpConnection::new(self.loop_.clone(), sock, local, peer);
        *self.connection.lock().unwrap() = Some(conn.clone());

        if let Some(cb) = self.message_cb.lock().unwrap().clone() {
            conn.set_message_callback(cb);
        }
        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }

        let weak = self.me.clone();
        conn.set_close_callback(Arc::new(move |conn: &TcpConnectionRef| {
            if let Some(client) = weak.upgrade() {
                client.close_connection(conn);
            }
        }));

        conn.connect_established(lp);
        let cb = self.connection_cb.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(&conn);
        }
    }

    fn close_connection(&self, conn: &TcpConnectionRef) {
        self.connected.store(false, Ordering::Release);
        self.connection.lock().unwrap().take();

        let cb = self.connection_cb.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(conn);
        }

        // Lost the peer while still started: go back to dialing.
        if self.started.load(Ordering::Acquire) && !self.fatal_error.load(Ordering::Acquire) {
            self.cancel_retry_timer();
            self.arm_retry_timer();
        }
    }

    /// Orderly half-close of the live connection.
    pub fn disconnect(&self) {
        if let Some(conn) = self.connection() {
            if !conn.disconnected() {
                conn.shutdown();
            }
        }
    }

    /// Stop retrying and force-close any live connection.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }

        self.cancel_retry_timer();
        self.connector.stop();
        if let Some(conn) = self.connection() {
            if !conn.disconnected() {
                conn.force_close();
            }
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        log::trace!("TcpClient::drop() {}", self.peer);
        self.cancel_retry_timer();
        self.connector.stop();
        if let Some(conn) = self.connection.lock().unwrap().take() {
            if !conn.disconnected() {
                conn.force_close();
            }
        }
    }
}
