//! Realtime connectivity and location reporting for the courier app.
//!
//! Two kameo actors form the core: [`ConnectionActor`] keeps one authenticated
//! websocket per driver alive (heartbeat, backoff, close-code policy) and
//! [`LocationReporter`] streams device positions through it, restarting the
//! device subscription when it goes stale. [`DriverLink`] wires both to one
//! [`EventBus`].

pub mod config;
pub mod connection;
pub mod core;
pub mod credentials;
pub mod events;
pub mod link;
pub mod location;
pub mod testing;
pub mod transport;

pub use config::{ConnectionConfig, LinkConfig, TrackingConfig};
pub use connection::{
    Connect, ConnectionActor, ConnectionActorArgs, Disconnect, GetConnectionState,
    GetConnectionStats, SendLocation,
};
pub use crate::core::{ConnectionState, ConnectionStats, LinkError, LinkResult};
pub use credentials::{CredentialStore, DriverStatus, InMemoryCredentials, SharedCredentials};
pub use events::{DriverEvent, ErrorEvent, ErrorKind, EventBus, EventKind, ListenerId};
pub use link::{DriverLink, LifecycleEvent};
pub use location::{
    JobReference, LocationError, LocationReporter, LocationReporterArgs, LocationSample,
    PositionFix, PositionProvider, TrackingStart,
};
