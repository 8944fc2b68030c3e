//! Live user positions and the geometry used to query them.
//!
//! [`SpatialStore`] keeps the latest [`UserPresence`](geomesh_types::UserPresence)
//! per user and answers radius, polygon and presence queries. The [`geo`]
//! module holds the pure math shared with the geofence engine.

pub mod geo;
mod store;
mod zone;

pub use store::{LocationListener, SpatialStore, DEFAULT_STALENESS};
pub use zone::{Zone, ZoneNotification};
