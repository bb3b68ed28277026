// Library root: live draft event sync for team and hero drafts.
//
// `connection::DraftSync` owns the socket to one draft, folds inbound frames
// into an ordered event log and the latest server snapshot, and fans both out
// to subscribers. `poller` checks for a pending turn over plain HTTP.

pub mod config;
pub mod connection;
pub mod event_log;
pub mod poller;
pub mod protocol;
pub mod reconcile;
pub mod subscription;

pub use connection::{
    ConnectionState, ConnectionStatus, DraftSync, DraftView, Endpoint, ReconnectPolicy, SyncOptions,
};
pub use protocol::{DraftEvent, DraftId, DraftSnapshot, EventId, EventType};
pub use subscription::{Subscriber, Subscription};
