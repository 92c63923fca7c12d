//! Referencer-type relation precomputed from registry metadata.
//!
//! Struct meta `resource_type` marks resource roots; field meta
//! `resource_reference` on interned-string fields names the referenced
//! resource type. References reach resource types through nested structs and
//! arrays, so the relation is closed transitively before inversion.

use bit_set::BitSet;
use fxhash::{FxHashMap, FxHashSet};
use kan_core::reflection::{Archetype, Meta, Registry, StructType};
use kan_core::{intern, InternedString};
use std::sync::Arc;
use tracing::debug;

/// Marks a struct as a standalone resource type.
#[derive(Debug)]
pub struct ResourceTypeMeta {
    /// Root resources are referenced from outside any other resource.
    pub root: bool,
}

impl Meta for ResourceTypeMeta {}

/// Marks an interned-string field as a reference to a resource of the given
/// type.
#[derive(Debug)]
pub struct ReferenceMeta {
    pub type_name: InternedString,
}

impl Meta for ReferenceMeta {}

pub fn resource_type_meta_name() -> InternedString {
    intern("resource_type")
}

pub fn reference_meta_name() -> InternedString {
    intern("resource_reference")
}

/// For every referenced type, the list of resource types whose instances can
/// carry a reference to it.
pub struct ReferenceTypeInfoStorage {
    referencers: FxHashMap<InternedString, Vec<InternedString>>,
    resource_types: FxHashSet<InternedString>,
}

fn item_struct_type(archetype: &Archetype) -> Option<InternedString> {
    match archetype {
        Archetype::Struct { type_name } => Some(*type_name),
        Archetype::InlineArray { item, .. } | Archetype::DynamicArray { item, .. } => {
            item_struct_type(item)
        }
        _ => None,
    }
}

fn field_references_interned_string(archetype: &Archetype) -> bool {
    match archetype {
        Archetype::InternedString => true,
        Archetype::InlineArray { item, .. } | Archetype::DynamicArray { item, .. } => {
            field_references_interned_string(item)
        }
        _ => false,
    }
}

fn direct_references(registry: &Registry, descriptor: &StructType) -> FxHashSet<InternedString> {
    let mut references = FxHashSet::default();
    for field in &descriptor.fields {
        if !field_references_interned_string(&field.archetype) {
            continue;
        }

        if let Some(meta) = registry.struct_field_meta_as::<ReferenceMeta>(
            descriptor.name,
            field.name,
            reference_meta_name(),
        ) {
            references.insert(meta.type_name);
        }
    }

    references
}

impl ReferenceTypeInfoStorage {
    pub fn build(registry: &Registry) -> Self {
        let structs: Vec<&Arc<StructType>> = registry.iterate_structs().collect();
        let mut index_of = FxHashMap::default();
        for (index, descriptor) in structs.iter().enumerate() {
            index_of.insert(descriptor.name, index);
        }

        let direct: Vec<FxHashSet<InternedString>> = structs
            .iter()
            .map(|descriptor| direct_references(registry, descriptor))
            .collect();

        let nested: Vec<Vec<usize>> = structs
            .iter()
            .map(|descriptor| {
                descriptor
                    .fields
                    .iter()
                    .filter_map(|field| item_struct_type(&field.archetype))
                    .filter_map(|type_name| index_of.get(&type_name).copied())
                    .collect()
            })
            .collect();

        let resource_types: FxHashSet<InternedString> = structs
            .iter()
            .filter(|descriptor| {
                registry
                    .struct_meta(descriptor.name, resource_type_meta_name())
                    .is_some()
            })
            .map(|descriptor| descriptor.name)
            .collect();

        let mut referencers: FxHashMap<InternedString, Vec<InternedString>> =
            FxHashMap::default();

        for (index, descriptor) in structs.iter().enumerate() {
            if !resource_types.contains(&descriptor.name) {
                continue;
            }

            // Depth-first closure over nested struct fields.
            let mut reachable = BitSet::with_capacity(structs.len());
            let mut stack = vec![index];
            let mut referenced = FxHashSet::default();

            while let Some(current) = stack.pop() {
                if reachable.contains(current) {
                    continue;
                }
                reachable.insert(current);

                referenced.extend(direct[current].iter().copied());
                stack.extend(nested[current].iter().copied());
            }

            for referenced_type in referenced {
                referencers
                    .entry(referenced_type)
                    .or_insert_with(Vec::new)
                    .push(descriptor.name);
            }
        }

        for types in referencers.values_mut() {
            types.sort();
            types.dedup();
        }

        debug!(
            resource_types = resource_types.len(),
            referenced_types = referencers.len(),
            "built reference type info storage"
        );

        ReferenceTypeInfoStorage {
            referencers,
            resource_types,
        }
    }

    pub fn referencers_of(&self, type_name: InternedString) -> &[InternedString] {
        self.referencers
            .get(&type_name)
            .map(|types| types.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_resource_type(&self, type_name: InternedString) -> bool {
        self.resource_types.contains(&type_name)
    }
}
