//! Tandem RPC - bidirectional JSON-RPC 2.0 over WebSocket and HTTP.
//!
//! Either endpoint of a connection can issue calls and serve calls. A
//! [`Listener`] accepts HTTP POST exchanges and WebSocket upgrades; a
//! [`Connection`] prefers a WebSocket and falls back to HTTP. Streams
//! registered on a [`Callee`] can be subscribed to from the other side.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tandem_rpc::{Callee, ConnectConfig, Connection, ListenConfig, Listener};
//!
//! #[tokio::main]
//! async fn main() -> tandem_rpc::Result<()> {
//!     let callee = Callee::builder()
//!         .method("echo", |params| async move { Ok(params[0].clone()) })
//!         .build();
//!     let handle = Listener::new(Arc::new(callee), ListenConfig::default())
//!         .bind("127.0.0.1:0")
//!         .await?;
//!
//!     let url = format!("http://127.0.0.1:{}/", handle.port());
//!     let conn = Connection::new(ConnectConfig::new(url), None)?;
//!     let echoed = conn.execute("echo", vec!["hi".into()]).await?;
//!     assert_eq!(echoed, "hi");
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod callee;
pub mod caller;
pub mod config;
pub mod connect;
pub mod error;
pub mod listen;
pub mod message;
pub mod transport;

pub use auth::Credentials;
pub use callee::{Callee, CalleeBuilder, HandlerResult, Publisher};
pub use caller::{Caller, Subscription};
pub use config::{ConnectConfig, ListenConfig, RpcConfig};
pub use connect::{Connection, ConnectionState};
pub use error::{Result, TandemError};
pub use listen::{Listener, ListenerHandle};
pub use message::{ErrorObject, Reply, Request, RequestId, Response};
pub use transport::{Transport, TransportEvent};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Every mutex in this crate guards plain maps and options that stay
/// consistent between statements, so a poisoned lock is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
