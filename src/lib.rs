//! SaunaFS chunkserver network-protocol core: the connection state machine,
//! write-chain forwarding, background job pool, and per-folder chunk
//! bookkeeping that sit between a chunkserver's listening socket and its
//! on-disk chunk store.
//!
//! This crate does not open sockets for its own configuration or run a
//! process - it is the protocol/concurrency core a chunkserver binary
//! embeds, supplying its own [`chunk_store::ChunkStore`] implementation for
//! the actual on-disk format.

pub mod acceptor;
pub mod buffer;
pub mod chunk_store;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod folder;
pub mod job_pool;
pub mod packet;
pub mod serializer;
pub mod socket;
pub mod worker;

pub use acceptor::ConnectionAcceptor;
pub use chunk_store::ChunkStore;
pub use config::CoreConfig;
pub use connection::{ConnectionEntry, ConnectionState};
pub use error::{CoreError, SfsStatus};
pub use job_pool::BackgroundJobPool;
pub use worker::NetworkWorkerThread;
