//! Live order book synchronization: a book built from one snapshot plus an
//! ordered stream of diffs, kept correct across startup races, disconnects
//! and resyncs.

pub mod buffer;
pub mod config;
pub mod controller;
pub mod error;
pub mod kraken;
pub mod state;
pub mod store;
pub mod transport;
pub mod types;

// ---- Top-level re-exports for ergonomic usage ----

pub use buffer::UpdateBuffer;
pub use config::SyncConfig;
pub use controller::SyncController;
pub use error::{Result, SyncError, TransportError};
pub use state::{SyncState, SyncStateMachine, Transition};
pub use store::{BookSide, BookView, PriceLevelStore};
pub use transport::{EventSink, SubscriptionHandle, SyncEvent, Transport};
pub use types::{BookSnapshot, PriceLevel, ProcessEntry, Side};

// Kraken transport
pub use kraken::{KrakenTransport, KRAKEN_PUBLIC_WS};
