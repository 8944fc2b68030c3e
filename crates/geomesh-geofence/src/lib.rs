//! Geofence definitions, per-user membership tracking and trigger actions.
//!
//! The [`GeofenceEngine`] is fed by the spatial store (it implements
//! [`LocationListener`](geomesh_spatial::LocationListener)). Each evaluation
//! compares the user's position against every active fence, publishes the
//! resulting [`GeoEvent`](geomesh_types::GeoEvent)s on the geo events topic
//! and then runs each fence's actions in order.

mod actions;
mod engine;
mod persistence;

pub use engine::{GeofenceEngine, MembershipSnapshot, DEFAULT_DWELL_SECONDS};
