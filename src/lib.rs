//! A multi-reactor TCP networking library built on the
//! one-loop-per-thread model.
//!
//! Applications register byte-stream callbacks and get an event-driven,
//! non-blocking server and client runtime: a base [`EventLoop`] accepts
//! connections, hands each one to a worker loop picked round-robin, and
//! every callback for a connection then runs serialized on that worker.
//! Cross-thread calls funnel through each loop's task queue and wakeup
//! descriptor.
//!
//! # Example
//!
//! ```no_run
//! use hive_net::{EventLoop, TcpServer};
//!
//! let lp = EventLoop::new().unwrap();
//! let addr = "127.0.0.1:9877".parse().unwrap();
//!
//! let server = TcpServer::new(lp.handle(), &addr);
//! server.set_num_threads(4);
//! server.set_message_callback(|conn, buf| {
//!     // Echo whatever arrived.
//!     let data = buf.retrieve_all_as_bytes();
//!     conn.send(&data);
//! });
//! server.start();
//!
//! lp.run();
//! ```

pub mod sys;

mod acceptor;
mod buffer;
mod callbacks;
mod channel;
mod client;
mod connection;
mod connector;
mod event_loop;
mod event_loop_thread;
mod event_loop_thread_pool;
mod poller;
mod ready;
mod server;
mod timer;
mod token;

pub mod logger;

pub use acceptor::Acceptor;
pub use buffer::Buffer;
pub use callbacks::{
    ConnectionCallback, ErrorCallback, EventCallback, HighWaterMarkCallback, MessageCallback,
    NewConnectionCallback, TcpConnectionRef, ThreadInitCallback, WriteCompleteCallback,
};
pub use channel::Channel;
pub use client::{TcpClient, DEFAULT_RECONNECT_INTERVAL};
pub use connection::TcpConnection;
pub use connector::{ConnectError, Connector};
pub use event_loop::{EventLoop, LoopHandle};
pub use event_loop_thread::EventLoopThread;
pub use event_loop_thread_pool::EventLoopThreadPool;
pub use poller::Poller;
pub use ready::Ready;
pub use server::TcpServer;
pub use timer::TimerHandle;
pub use token::Token;
