//! Universe side of the Kan runtime core: the typed resource repository and
//! the cached resource-reference manager.
//!
//! The repository is the collaborator surface the manager works against:
//! entries, requests, loaded containers and the operation tables live here.
//! The reference manager consumes repository rows plus reflection metadata to
//! detect outgoing references, caches results on disk keyed by source
//! timestamps, and answers per-entry and umbrella requests through events.

pub mod event;
pub mod reference;
pub mod repository;

pub use crate::event::{
    ReferenceEvents, UpdateAllReferencesToTypeRequest, UpdateAllReferencesToTypeResponse,
    UpdateOuterReferencesRequest, UpdateOuterReferencesResponse,
};
pub use crate::reference::{
    DetectedReference, DetectedReferenceContainer, ReferenceManager, ReferenceManagerConfig,
    ReferenceMeta, ReferenceTypeInfoStorage, ResourceTypeMeta,
};
pub use crate::repository::{
    OuterReference, ResourceEntry, ResourceRepository, ResourceRequest,
};
