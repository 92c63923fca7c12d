//! Shared scaffolding, containers and the reflection runtime of the Kan
//! game-engine core.
//!
//! The crate has three layers: process-wide primitives (interned strings,
//! typed ids, event queues), containers (the quantized spatial tree and the
//! type-erased dynamic array), and the reflection runtime — a registry of
//! typed descriptions built by a cooperative multi-pass generation driver and
//! upgraded across reloads by the migration engine.

pub mod container;
pub mod ids;
pub mod interning;
pub mod packing;
pub mod reflection;

pub use crate::ids::{AttachmentId, ContainerId, RegistryId, RequestId};
pub use crate::interning::{intern, InternedString};
