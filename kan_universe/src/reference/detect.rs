//! Reference detection over type-erased resource instances.
//!
//! Walks an instance through its registry descriptor: interned-string fields
//! tagged with `resource_reference` field meta yield detected references;
//! struct fields, inline arrays (honoring the sibling size field) and dynamic
//! arrays recurse.

use crate::reference::info::{reference_meta_name, ReferenceMeta};
use kan_core::container::DynamicArray;
use kan_core::reflection::{Archetype, Field, Registry, StructType};
use kan_core::InternedString;
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DetectedReference {
    pub type_name: InternedString,
    pub name: InternedString,
}

/// What the cache file stores for one entry.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DetectedReferenceContainer {
    pub detected_references: Vec<DetectedReference>,
}

/// Vacant slots in partially filled arrays are zeroed, so the raw pointer is
/// inspected before an `InternedString` is materialized.
unsafe fn read_interned(pointer: *const u8) -> Option<InternedString> {
    let raw = (pointer as *const *const ()).read_unaligned();
    if raw.is_null() {
        return None;
    }

    Some((pointer as *const InternedString).read_unaligned())
}

unsafe fn read_unsigned(pointer: *const u8, size: u32) -> u64 {
    match size {
        1 => pointer.read() as u64,
        2 => (pointer as *const u16).read_unaligned() as u64,
        4 => (pointer as *const u32).read_unaligned() as u64,
        8 => (pointer as *const u64).read_unaligned(),
        _ => 0,
    }
}

unsafe fn push_reference(
    reference_type: InternedString,
    pointer: *const u8,
    output: &mut DetectedReferenceContainer,
) {
    if let Some(name) = read_interned(pointer) {
        if !name.is_empty() {
            output.detected_references.push(DetectedReference {
                type_name: reference_type,
                name,
            });
        }
    }
}

unsafe fn scan_item(
    registry: &Registry,
    owner: &StructType,
    field: &Field,
    item: &Archetype,
    pointer: *const u8,
    output: &mut DetectedReferenceContainer,
) {
    match item {
        Archetype::InternedString => {
            if let Some(meta) = registry.struct_field_meta_as::<ReferenceMeta>(
                owner.name,
                field.name,
                reference_meta_name(),
            ) {
                push_reference(meta.type_name, pointer, output);
            }
        }
        Archetype::Struct { type_name } => {
            if let Some(nested) = registry.query_struct(*type_name) {
                scan_struct(registry, nested, pointer, output);
            }
        }
        _ => {}
    }
}

unsafe fn inline_array_count(
    descriptor: &StructType,
    base: *const u8,
    capacity: u32,
    size_field: &Option<InternedString>,
) -> u32 {
    match size_field {
        None => capacity,
        Some(size_field_name) => match descriptor.field(*size_field_name) {
            Some(size_field) => {
                let count =
                    read_unsigned(base.add(size_field.offset as usize), size_field.size) as u32;
                count.min(capacity)
            }
            None => {
                error!(
                    struct_name = descriptor.name.as_str(),
                    size_field = size_field_name.as_str(),
                    "inline array size field does not exist, scanning full capacity"
                );
                capacity
            }
        },
    }
}

unsafe fn scan_struct(
    registry: &Registry,
    descriptor: &StructType,
    base: *const u8,
    output: &mut DetectedReferenceContainer,
) {
    for field in &descriptor.fields {
        let field_pointer = base.add(field.offset as usize);

        match &field.archetype {
            Archetype::InternedString => {
                if let Some(meta) = registry.struct_field_meta_as::<ReferenceMeta>(
                    descriptor.name,
                    field.name,
                    reference_meta_name(),
                ) {
                    push_reference(meta.type_name, field_pointer, output);
                }
            }
            Archetype::Struct { type_name } => {
                if let Some(nested) = registry.query_struct(*type_name) {
                    scan_struct(registry, nested, field_pointer, output);
                }
            }
            Archetype::InlineArray {
                item,
                item_size,
                capacity,
                size_field,
            } => {
                let count = inline_array_count(descriptor, base, *capacity, size_field);
                for index in 0..count {
                    scan_item(
                        registry,
                        descriptor,
                        field,
                        item,
                        field_pointer.add((index * item_size) as usize),
                        output,
                    );
                }
            }
            Archetype::DynamicArray { item, .. } => {
                let array = &*(field_pointer as *const DynamicArray);
                for index in 0..array.len() {
                    scan_item(registry, descriptor, field, item, array.item_ptr(index), output);
                }
            }
            _ => {}
        }
    }
}

/// Runs reference detection for one instance.
///
/// # Safety
///
/// `instance` must point at a live value laid out exactly as the registry
/// describes `type_name`.
pub unsafe fn detect_references(
    registry: &Registry,
    type_name: InternedString,
    instance: *const u8,
    output: &mut DetectedReferenceContainer,
) {
    match registry.query_struct(type_name) {
        Some(descriptor) => scan_struct(registry, descriptor, instance, output),
        None => error!(
            type_name = type_name.as_str(),
            "cannot detect references for an unregistered type"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::info::resource_type_meta_name;
    use crate::reference::info::ResourceTypeMeta;
    use kan_core::intern;
    use std::sync::Arc;

    #[repr(C)]
    struct Effect {
        material: InternedString,
        strength: u64,
        extra_materials: [InternedString; 2],
        extra_count: u64,
    }

    fn effect_registry() -> Registry {
        let string_size = std::mem::size_of::<InternedString>() as u32;
        assert_eq!(string_size, 8);

        let mut registry = Registry::new();
        registry.add_struct(Arc::new(StructType {
            name: intern("effect"),
            size: std::mem::size_of::<Effect>() as u32,
            alignment: 8,
            lifecycle: None,
            fields: vec![
                Field {
                    name: intern("material"),
                    offset: 0,
                    size: string_size,
                    archetype: Archetype::InternedString,
                },
                Field {
                    name: intern("strength"),
                    offset: 8,
                    size: 8,
                    archetype: Archetype::UnsignedInt,
                },
                Field {
                    name: intern("extra_materials"),
                    offset: 16,
                    size: string_size * 2,
                    archetype: Archetype::InlineArray {
                        item: Box::new(Archetype::InternedString),
                        item_size: string_size,
                        capacity: 2,
                        size_field: Some(intern("extra_count")),
                    },
                },
                Field {
                    name: intern("extra_count"),
                    offset: 32,
                    size: 8,
                    archetype: Archetype::UnsignedInt,
                },
            ],
        }));

        registry.add_struct_meta(
            intern("effect"),
            resource_type_meta_name(),
            Arc::new(ResourceTypeMeta { root: true }),
        );
        registry.add_struct_field_meta(
            intern("effect"),
            intern("material"),
            reference_meta_name(),
            Arc::new(ReferenceMeta {
                type_name: intern("material"),
            }),
        );
        registry.add_struct_field_meta(
            intern("effect"),
            intern("extra_materials"),
            reference_meta_name(),
            Arc::new(ReferenceMeta {
                type_name: intern("material"),
            }),
        );

        registry
    }

    #[test]
    fn detects_direct_and_inline_array_references() {
        let registry = effect_registry();
        let effect = Effect {
            material: intern("brick"),
            strength: 4,
            extra_materials: [intern("moss"), intern("unused")],
            extra_count: 1,
        };

        let mut output = DetectedReferenceContainer::default();
        unsafe {
            detect_references(
                &registry,
                intern("effect"),
                &effect as *const Effect as *const u8,
                &mut output,
            );
        }

        assert_eq!(
            output.detected_references,
            vec![
                DetectedReference {
                    type_name: intern("material"),
                    name: intern("brick"),
                },
                DetectedReference {
                    type_name: intern("material"),
                    name: intern("moss"),
                },
            ]
        );
    }

    #[test]
    fn empty_names_are_skipped() {
        let registry = effect_registry();
        let effect = Effect {
            material: intern(""),
            strength: 0,
            extra_materials: [intern(""), intern("")],
            extra_count: 2,
        };

        let mut output = DetectedReferenceContainer::default();
        unsafe {
            detect_references(
                &registry,
                intern("effect"),
                &effect as *const Effect as *const u8,
                &mut output,
            );
        }

        assert!(output.detected_references.is_empty());
    }
}
