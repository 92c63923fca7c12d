//! Kan runtime core.
//!
//! Facade crate over the two member crates: `kan-core` (interning,
//! containers, the reflection runtime with generation and migration) and
//! `kan-universe` (the typed resource repository and the cached
//! resource-reference manager).

pub use kan_core::{container, ids, interning, packing, reflection};
pub use kan_core::{intern, AttachmentId, ContainerId, InternedString, RegistryId, RequestId};
pub use kan_universe::{event, reference, repository};

pub mod prelude {
    pub use kan_core::container::{NodeId, QuantizedPath, SpatialTree};
    pub use kan_core::reflection::{
        Archetype, Field, MigrationSeed, PatchBuilder, ReflectionSystem, Registry, StructMigrator,
        StructType,
    };
    pub use kan_core::{intern, InternedString};
    pub use kan_universe::{
        ReferenceManager, ReferenceManagerConfig, ReferenceMeta, ResourceRepository,
        ResourceTypeMeta,
    };
}
