//! Callback contracts between the engine and the application.
//!
//! Every slot is a stored invocable value; users install only the subset
//! they care about.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::connection::TcpConnection;
use crate::connector::ConnectError;
use crate::event_loop::EventLoop;
use crate::sys::socket::TcpSock;

/// Shared handle to a connection; kept alive by the owning loop's
/// connection set, the channel tie, and any in-flight task.
pub type TcpConnectionRef = Arc<TcpConnection>;

/// Fires when a connection becomes connected or reaches disconnected.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Fires when bytes are appended to the input buffer.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionRef, &mut Buffer) + Send + Sync>;

/// Fires when the output buffer drains after a send.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Fires when the output buffer crosses the high-water mark upward.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionRef, usize) + Send + Sync>;

/// Internal teardown signal from a connection to its server/client.
pub type CloseCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Fires on a failed connect attempt with its classification; a
/// [`ConnectError::Fatal`] outcome is reported once and never retried.
pub type ErrorCallback = Arc<dyn Fn(ConnectError) + Send + Sync>;

/// Hands a freshly established socket to its owner, on the loop that
/// produced it.
pub type NewConnectionCallback =
    Box<dyn Fn(&EventLoop, TcpSock, SocketAddr, SocketAddr) + Send + Sync>;

/// Fires once per worker loop at pool startup, with the worker index
/// (0 = the base loop).
pub type ThreadInitCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Runs when a timer expires.
pub type TimerCallback = Box<dyn Fn() + Send + Sync>;

/// A unit of work scheduled onto a loop's task queue.
pub type Task = Box<dyn FnOnce(&EventLoop) + Send>;

/// A channel event slot.
pub type EventCallback = Box<dyn Fn(&EventLoop) + Send + Sync>;
