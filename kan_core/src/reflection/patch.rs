//! Precompiled field-write deltas.
//!
//! A patch records absolute `(offset, size, bytes)` writes against a target
//! struct type. Patches registered on a registry survive reflection reloads:
//! the migration engine rewrites their writes against the new registry.

use crate::interning::InternedString;
use crate::reflection::registry::{Registry, StructType};
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct PatchWrite {
    pub offset: u32,
    pub size: u32,
    pub data: SmallVec<[u8; 8]>,
}

#[derive(Debug)]
pub(crate) struct PatchData {
    pub target_type: InternedString,
    pub writes: Vec<PatchWrite>,
}

/// Shared handle; holders observe migration rewrites in place.
#[derive(Clone)]
pub struct Patch {
    inner: Arc<RwLock<PatchData>>,
}

impl Patch {
    pub fn target_type(&self) -> InternedString {
        self.inner.read().target_type
    }

    pub fn writes(&self) -> Vec<PatchWrite> {
        self.inner.read().writes.clone()
    }

    /// Applies every recorded write into an instance of the target type.
    /// The slice must cover the whole struct.
    pub fn apply(&self, instance: &mut [u8]) {
        let data = self.inner.read();
        for write in &data.writes {
            let begin = write.offset as usize;
            let end = begin + write.size as usize;
            assert!(
                end <= instance.len(),
                "patch write escapes the instance bounds"
            );
            instance[begin..end].copy_from_slice(&write.data);
        }
    }

    pub(crate) fn replace(&self, target_type: InternedString, writes: Vec<PatchWrite>) {
        let mut data = self.inner.write();
        data.target_type = target_type;
        data.writes = writes;
    }
}

pub struct PatchBuilder {
    target_type: InternedString,
    struct_size: u32,
    writes: Vec<PatchWrite>,
}

impl PatchBuilder {
    /// The target type must already be registered; building against an
    /// unknown type is a construction error.
    pub fn new(registry: &Registry, target_type: InternedString) -> Self {
        let descriptor = registry
            .query_struct(target_type)
            .unwrap_or_else(|| panic!("patch target type \"{}\" is not registered", target_type));

        PatchBuilder {
            target_type,
            struct_size: descriptor.size,
            writes: Vec::new(),
        }
    }

    pub fn add_chunk(&mut self, offset: u32, data: &[u8]) -> &mut Self {
        assert!(
            offset + data.len() as u32 <= self.struct_size,
            "patch chunk escapes the target struct"
        );

        self.writes.push(PatchWrite {
            offset,
            size: data.len() as u32,
            data: SmallVec::from_slice(data),
        });
        self
    }

    /// Resolves a top-level field by name and records a full-field write.
    pub fn add_field(
        &mut self,
        descriptor: &StructType,
        field_name: InternedString,
        data: &[u8],
    ) -> &mut Self {
        let field = descriptor
            .field(field_name)
            .unwrap_or_else(|| panic!("patched field \"{}\" does not exist", field_name));
        assert_eq!(
            field.size as usize,
            data.len(),
            "patched field write must cover the whole field"
        );
        self.add_chunk(field.offset, data)
    }

    pub fn build(self, registry: &Registry) -> Patch {
        let patch = Patch {
            inner: Arc::new(RwLock::new(PatchData {
                target_type: self.target_type,
                writes: self.writes,
            })),
        };

        registry.register_patch(patch.clone());
        patch
    }
}
