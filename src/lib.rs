//! Attack-cadence prediction for hostile actors.
//!
//! Observations (appearances, animations, projectiles, confirmed hits) flow
//! into a [`CadenceEngine`], which learns per-entity attack intervals, keeps
//! user-configured profiles, and projects a tick countdown for every live
//! instance once per scheduling tick.

pub mod algo;
pub mod config;
pub mod document;
pub mod engine;
pub mod event;
pub mod feedback;
pub mod key;
pub mod persist;
pub mod phase;
pub mod profile;
pub mod projector;
pub mod recording;
pub mod registry;
pub mod simulation;
pub mod store;
pub mod tracker;

/// Game tick counter
pub type Tick = i64;
/// Animation or other per-actor signal id
pub type SignalId = i32;
/// Composition/variant id of an actor
pub type VariantId = i32;
/// Runtime id of a live actor
pub type InstanceId = u32;

pub use config::EngineConfig;
pub use document::Document;
pub use engine::CadenceEngine;
pub use event::{InstanceDescriptor, Observation};
pub use key::EntityKey;
pub use projector::{Countdown, CountdownView, Snapshot};
pub use store::{CadenceStore, StoreChange};
