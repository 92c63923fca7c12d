//! Registry diffing and live-data migration.
//!
//! Comparing two registries yields a per-type plan; the migrator applies
//! plans to type-erased instances and rewrites registered patches against
//! the new registry. Matching is by interned name at every level; archetype
//! family changes drop the old value and zero-initialize the new field.

use crate::container::dynamic_array::DynamicArray;
use crate::interning::InternedString;
use crate::reflection::patch::PatchWrite;
use crate::reflection::registry::{
    Archetype, Field, NumericFamily, Registry, StructType,
};
use fxhash::FxHashMap;
use itertools::izip;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NumericConversion {
    pub family: NumericFamily,
    pub from_size: u32,
    pub to_size: u32,
}

#[derive(Clone, Debug)]
pub enum FieldAction {
    Copy,
    Convert(NumericConversion),
    Recurse(InternedString),
    InlineArray {
        item: Box<FieldAction>,
        old_item_size: u32,
        new_item_size: u32,
        count: u32,
    },
    DynamicArray {
        item: Box<FieldAction>,
        old_item_size: u32,
        new_item_size: u32,
        new_item_alignment: u32,
    },
    Added,
    Removed,
}

#[derive(Clone, Debug)]
pub struct FieldPlan {
    pub name: InternedString,
    pub source: Option<usize>,
    pub target: Option<usize>,
    pub action: FieldAction,
}

#[derive(Clone, Debug)]
pub enum StructPlan {
    Identical,
    Changed(Vec<FieldPlan>),
    Removed,
}

/// Per-type diff between an old and a new registry.
pub struct MigrationSeed {
    old: Arc<Registry>,
    new: Arc<Registry>,
    plans: Arc<FxHashMap<InternedString, StructPlan>>,
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum PlanTag {
    Identical,
    Changed,
    Removed,
}

fn fields_equal(old: &StructType, new: &StructType) -> bool {
    if old.size != new.size || old.fields.len() != new.fields.len() {
        return false;
    }

    izip!(&old.fields, &new.fields).all(|(old_field, new_field)| {
        old_field.name == new_field.name
            && old_field.offset == new_field.offset
            && old_field.size == new_field.size
            && old_field.archetype == new_field.archetype
    })
}

fn nested_struct_types(field: &Field) -> Option<InternedString> {
    fn from_archetype(archetype: &Archetype) -> Option<InternedString> {
        match archetype {
            Archetype::Struct { type_name } => Some(*type_name),
            Archetype::InlineArray { item, .. } | Archetype::DynamicArray { item, .. } => {
                from_archetype(item)
            }
            _ => None,
        }
    }

    from_archetype(&field.archetype)
}

impl MigrationSeed {
    pub fn build(old: &Arc<Registry>, new: &Arc<Registry>) -> Self {
        let mut tags: FxHashMap<InternedString, PlanTag> = FxHashMap::default();

        for old_struct in old.iterate_structs() {
            let tag = match new.query_struct(old_struct.name) {
                None => PlanTag::Removed,
                Some(new_struct) => {
                    if fields_equal(old_struct, new_struct) {
                        PlanTag::Identical
                    } else {
                        PlanTag::Changed
                    }
                }
            };
            tags.insert(old_struct.name, tag);
        }

        // Nested changes propagate: a struct is only identical when every
        // struct type reachable from its fields is identical too.
        loop {
            let mut promoted_any = false;
            for old_struct in old.iterate_structs() {
                if tags[&old_struct.name] != PlanTag::Identical {
                    continue;
                }

                let nested_changed = old_struct.fields.iter().any(|field| {
                    nested_struct_types(field).map_or(false, |nested| {
                        tags.get(&nested).map_or(true, |tag| *tag != PlanTag::Identical)
                    })
                });

                if nested_changed {
                    tags.insert(old_struct.name, PlanTag::Changed);
                    promoted_any = true;
                }
            }

            if !promoted_any {
                break;
            }
        }

        let mut plans = FxHashMap::default();
        for old_struct in old.iterate_structs() {
            let plan = match tags[&old_struct.name] {
                PlanTag::Identical => StructPlan::Identical,
                PlanTag::Removed => StructPlan::Removed,
                PlanTag::Changed => {
                    let new_struct = new
                        .query_struct(old_struct.name)
                        .expect("changed struct exists in the new registry");
                    StructPlan::Changed(build_field_plans(old_struct, new_struct, &tags))
                }
            };
            plans.insert(old_struct.name, plan);
        }

        MigrationSeed {
            old: old.clone(),
            new: new.clone(),
            plans: Arc::new(plans),
        }
    }

    pub fn struct_plan(&self, type_name: InternedString) -> Option<&StructPlan> {
        self.plans.get(&type_name)
    }
}

fn classify_action(
    old_archetype: &Archetype,
    old_size: u32,
    new_archetype: &Archetype,
    new_size: u32,
    tags: &FxHashMap<InternedString, PlanTag>,
) -> FieldAction {
    match (old_archetype, new_archetype) {
        (Archetype::Struct { type_name: old_name }, Archetype::Struct { type_name: new_name })
            if old_name == new_name =>
        {
            match tags.get(old_name) {
                Some(PlanTag::Identical) => FieldAction::Copy,
                Some(PlanTag::Changed) => FieldAction::Recurse(*old_name),
                _ => FieldAction::Added,
            }
        }

        (
            Archetype::InlineArray {
                item: old_item,
                item_size: old_item_size,
                capacity: old_capacity,
                ..
            },
            Archetype::InlineArray {
                item: new_item,
                item_size: new_item_size,
                capacity: new_capacity,
                ..
            },
        ) => {
            let item_action =
                classify_action(old_item, *old_item_size, new_item, *new_item_size, tags);
            match item_action {
                FieldAction::Added => FieldAction::Added,
                FieldAction::Copy
                    if old_item_size == new_item_size && old_capacity == new_capacity =>
                {
                    FieldAction::Copy
                }
                item_action => FieldAction::InlineArray {
                    item: Box::new(item_action),
                    old_item_size: *old_item_size,
                    new_item_size: *new_item_size,
                    count: (*old_capacity).min(*new_capacity),
                },
            }
        }

        (
            Archetype::DynamicArray {
                item: old_item,
                item_size: old_item_size,
                ..
            },
            Archetype::DynamicArray {
                item: new_item,
                item_size: new_item_size,
                item_alignment: new_item_alignment,
            },
        ) => {
            let item_action =
                classify_action(old_item, *old_item_size, new_item, *new_item_size, tags);
            match item_action {
                FieldAction::Added => FieldAction::Added,
                item_action => FieldAction::DynamicArray {
                    item: Box::new(item_action),
                    old_item_size: *old_item_size,
                    new_item_size: *new_item_size,
                    new_item_alignment: *new_item_alignment,
                },
            }
        }

        (old_archetype, new_archetype) if old_archetype == new_archetype => {
            if old_size == new_size {
                FieldAction::Copy
            } else {
                match old_archetype.numeric_family() {
                    Some(family) => FieldAction::Convert(NumericConversion {
                        family,
                        from_size: old_size,
                        to_size: new_size,
                    }),
                    None => FieldAction::Added,
                }
            }
        }

        (old_archetype, new_archetype) => {
            match (old_archetype.numeric_family(), new_archetype.numeric_family()) {
                (Some(old_family), Some(new_family)) if old_family == new_family => {
                    FieldAction::Convert(NumericConversion {
                        family: old_family,
                        from_size: old_size,
                        to_size: new_size,
                    })
                }
                // Archetype family changed: the old value does not survive.
                _ => FieldAction::Added,
            }
        }
    }
}

fn build_field_plans(
    old_struct: &StructType,
    new_struct: &StructType,
    tags: &FxHashMap<InternedString, PlanTag>,
) -> Vec<FieldPlan> {
    let mut plans = Vec::with_capacity(new_struct.fields.len());

    for (target_index, new_field) in new_struct.fields.iter().enumerate() {
        let source = old_struct
            .fields
            .iter()
            .position(|old_field| old_field.name == new_field.name);

        match source {
            None => plans.push(FieldPlan {
                name: new_field.name,
                source: None,
                target: Some(target_index),
                action: FieldAction::Added,
            }),
            Some(source_index) => {
                let old_field = &old_struct.fields[source_index];
                plans.push(FieldPlan {
                    name: new_field.name,
                    source: Some(source_index),
                    target: Some(target_index),
                    action: classify_action(
                        &old_field.archetype,
                        old_field.size,
                        &new_field.archetype,
                        new_field.size,
                        tags,
                    ),
                });
            }
        }
    }

    for (source_index, old_field) in old_struct.fields.iter().enumerate() {
        if new_struct.field(old_field.name).is_none() {
            plans.push(FieldPlan {
                name: old_field.name,
                source: Some(source_index),
                target: None,
                action: FieldAction::Removed,
            });
        }
    }

    plans
}

/// Applies migration plans to instances and patches.
pub struct StructMigrator {
    old: Arc<Registry>,
    new: Arc<Registry>,
    plans: Arc<FxHashMap<InternedString, StructPlan>>,
}

unsafe fn read_signed(source: *const u8, size: u32) -> i64 {
    match size {
        1 => (source as *const i8).read_unaligned() as i64,
        2 => (source as *const i16).read_unaligned() as i64,
        4 => (source as *const i32).read_unaligned() as i64,
        8 => (source as *const i64).read_unaligned(),
        _ => panic!("unsupported signed width {}", size),
    }
}

unsafe fn write_signed(target: *mut u8, size: u32, value: i64) {
    match size {
        1 => (target as *mut i8).write_unaligned(value as i8),
        2 => (target as *mut i16).write_unaligned(value as i16),
        4 => (target as *mut i32).write_unaligned(value as i32),
        8 => (target as *mut i64).write_unaligned(value),
        _ => panic!("unsupported signed width {}", size),
    }
}

unsafe fn read_unsigned(source: *const u8, size: u32) -> u64 {
    match size {
        1 => (source as *const u8).read_unaligned() as u64,
        2 => (source as *const u16).read_unaligned() as u64,
        4 => (source as *const u32).read_unaligned() as u64,
        8 => (source as *const u64).read_unaligned(),
        _ => panic!("unsupported unsigned width {}", size),
    }
}

unsafe fn write_unsigned(target: *mut u8, size: u32, value: u64) {
    match size {
        1 => target.write(value as u8),
        2 => (target as *mut u16).write_unaligned(value as u16),
        4 => (target as *mut u32).write_unaligned(value as u32),
        8 => (target as *mut u64).write_unaligned(value),
        _ => panic!("unsupported unsigned width {}", size),
    }
}

unsafe fn read_floating(source: *const u8, size: u32) -> f64 {
    match size {
        4 => (source as *const f32).read_unaligned() as f64,
        8 => (source as *const f64).read_unaligned(),
        _ => panic!("unsupported floating width {}", size),
    }
}

unsafe fn write_floating(target: *mut u8, size: u32, value: f64) {
    match size {
        4 => (target as *mut f32).write_unaligned(value as f32),
        8 => (target as *mut f64).write_unaligned(value),
        _ => panic!("unsupported floating width {}", size),
    }
}

unsafe fn convert_numeric(conversion: &NumericConversion, source: *const u8, target: *mut u8) {
    match conversion.family {
        NumericFamily::Signed => write_signed(
            target,
            conversion.to_size,
            read_signed(source, conversion.from_size),
        ),
        NumericFamily::Unsigned => write_unsigned(
            target,
            conversion.to_size,
            read_unsigned(source, conversion.from_size),
        ),
        NumericFamily::Floating => write_floating(
            target,
            conversion.to_size,
            read_floating(source, conversion.from_size),
        ),
    }
}

impl StructMigrator {
    pub fn build(seed: &MigrationSeed) -> Self {
        StructMigrator {
            old: seed.old.clone(),
            new: seed.new.clone(),
            plans: seed.plans.clone(),
        }
    }

    /// Migrates one instance from the old layout into `target`, which must be
    /// zero-initialized storage of the new layout.
    ///
    /// # Safety
    ///
    /// `source` must point at a live instance described by the old registry's
    /// descriptor for `type_name`; `target` must point at writable storage of
    /// the new descriptor's size.
    pub unsafe fn migrate_instance(
        &self,
        type_name: InternedString,
        source: *const u8,
        target: *mut u8,
    ) {
        match self.plans.get(&type_name) {
            None | Some(StructPlan::Removed) => {}
            Some(StructPlan::Identical) => {
                let descriptor = self
                    .old
                    .query_struct(type_name)
                    .expect("identical struct exists in the old registry");
                std::ptr::copy_nonoverlapping(source, target, descriptor.size as usize);
            }
            Some(StructPlan::Changed(field_plans)) => {
                let old_struct = self.old.query_struct(type_name).unwrap();
                let new_struct = self.new.query_struct(type_name).unwrap();

                for plan in field_plans {
                    let (source_index, target_index) = match (plan.source, plan.target) {
                        (Some(source_index), Some(target_index)) => (source_index, target_index),
                        _ => continue,
                    };

                    let old_field = &old_struct.fields[source_index];
                    let new_field = &new_struct.fields[target_index];
                    self.apply_action(
                        &plan.action,
                        old_field.size,
                        source.add(old_field.offset as usize),
                        target.add(new_field.offset as usize),
                    );
                }
            }
        }
    }

    unsafe fn apply_action(
        &self,
        action: &FieldAction,
        old_size: u32,
        source: *const u8,
        target: *mut u8,
    ) {
        match action {
            FieldAction::Copy => {
                std::ptr::copy_nonoverlapping(source, target, old_size as usize);
            }
            FieldAction::Convert(conversion) => convert_numeric(conversion, source, target),
            FieldAction::Recurse(type_name) => self.migrate_instance(*type_name, source, target),
            FieldAction::InlineArray {
                item,
                old_item_size,
                new_item_size,
                count,
            } => {
                for index in 0..*count {
                    self.apply_action(
                        item,
                        *old_item_size,
                        source.add((index * old_item_size) as usize),
                        target.add((index * new_item_size) as usize),
                    );
                }
            }
            FieldAction::DynamicArray {
                item,
                old_item_size,
                new_item_size,
                new_item_alignment,
            } => {
                let old_array = &*(source as *const DynamicArray);
                let mut new_array = DynamicArray::with_capacity(
                    *new_item_size,
                    *new_item_alignment,
                    old_array.len(),
                );

                for index in 0..old_array.len() {
                    let slot = new_array.push_zeroed();
                    self.apply_action(item, *old_item_size, old_array.item_ptr(index), slot);
                }

                (target as *mut DynamicArray).write(new_array);
            }
            FieldAction::Added | FieldAction::Removed => {}
        }
    }

    /// Rewrites every patch registered on the old registry against the new
    /// layouts and re-registers the survivors on the new registry.
    pub fn migrate_patches(&self, old: &Registry, new: &Registry) {
        for patch in old.take_patches() {
            let target_type = patch.target_type();
            match self.plans.get(&target_type) {
                None | Some(StructPlan::Identical) => new.register_patch(patch),
                Some(StructPlan::Removed) => {
                    warn!(
                        type_name = target_type.as_str(),
                        "dropping patch, its target type was removed"
                    );
                }
                Some(StructPlan::Changed(_)) => {
                    let mut migrated = Vec::new();
                    for write in patch.writes() {
                        if let Some(new_write) =
                            self.migrate_write(target_type, write.offset, &write.data)
                        {
                            migrated.push(new_write);
                        }
                    }

                    patch.replace(target_type, migrated);
                    new.register_patch(patch);
                }
            }
        }
    }

    fn migrate_write(
        &self,
        type_name: InternedString,
        offset: u32,
        data: &[u8],
    ) -> Option<PatchWrite> {
        let size = data.len() as u32;
        match self.plans.get(&type_name) {
            None | Some(StructPlan::Identical) => Some(PatchWrite {
                offset,
                size,
                data: SmallVec::from_slice(data),
            }),
            Some(StructPlan::Removed) => None,
            Some(StructPlan::Changed(field_plans)) => {
                let old_struct = self.old.query_struct(type_name)?;
                let new_struct = self.new.query_struct(type_name)?;

                for plan in field_plans {
                    let source_index = match plan.source {
                        Some(source_index) => source_index,
                        None => continue,
                    };

                    let old_field = &old_struct.fields[source_index];
                    if offset < old_field.offset
                        || offset + size > old_field.offset + old_field.size
                    {
                        continue;
                    }

                    let relative = offset - old_field.offset;
                    let target_index = plan.target?;
                    let new_field = &new_struct.fields[target_index];

                    return self
                        .migrate_action_write(&plan.action, old_field.size, relative, data)
                        .map(|mut write| {
                            write.offset += new_field.offset;
                            write
                        });
                }

                warn!(
                    type_name = type_name.as_str(),
                    offset, "dropping patch write, no old field covers it"
                );
                None
            }
        }
    }

    /// Produces a write with an offset relative to the migrated field.
    fn migrate_action_write(
        &self,
        action: &FieldAction,
        old_field_size: u32,
        relative_offset: u32,
        data: &[u8],
    ) -> Option<PatchWrite> {
        match action {
            FieldAction::Copy => Some(PatchWrite {
                offset: relative_offset,
                size: data.len() as u32,
                data: SmallVec::from_slice(data),
            }),
            FieldAction::Convert(conversion) => {
                if relative_offset != 0 || data.len() as u32 != old_field_size {
                    warn!("dropping partial patch write into a converted field");
                    return None;
                }

                let mut converted = [0u8; 8];
                unsafe {
                    convert_numeric(conversion, data.as_ptr(), converted.as_mut_ptr());
                }

                Some(PatchWrite {
                    offset: 0,
                    size: conversion.to_size,
                    data: SmallVec::from_slice(&converted[..conversion.to_size as usize]),
                })
            }
            FieldAction::Recurse(type_name) => {
                self.migrate_write(*type_name, relative_offset, data)
            }
            FieldAction::InlineArray {
                item,
                old_item_size,
                new_item_size,
                count,
            } => {
                let index = relative_offset / old_item_size;
                if index >= *count {
                    return None;
                }

                let item_relative = relative_offset % old_item_size;
                self.migrate_action_write(item, *old_item_size, item_relative, data)
                    .map(|mut write| {
                        write.offset += index * new_item_size;
                        write
                    })
            }
            FieldAction::DynamicArray { .. } => {
                warn!("dropping patch write into a dynamic array field");
                None
            }
            FieldAction::Added | FieldAction::Removed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interning::intern;
    use crate::reflection::patch::PatchBuilder;

    fn struct_type(name: &str, size: u32, fields: Vec<Field>) -> Arc<StructType> {
        Arc::new(StructType {
            name: intern(name),
            size,
            alignment: 8,
            lifecycle: None,
            fields,
        })
    }

    fn unsigned_field(name: &str, offset: u32, size: u32) -> Field {
        Field {
            name: intern(name),
            offset,
            size,
            archetype: Archetype::UnsignedInt,
        }
    }

    fn registries_for_widening() -> (Arc<Registry>, Arc<Registry>) {
        let mut old = Registry::new();
        old.add_struct(struct_type(
            "sample",
            8,
            vec![unsigned_field("a", 0, 4), unsigned_field("b", 4, 4)],
        ));

        let mut new = Registry::new();
        new.add_struct(struct_type(
            "sample",
            24,
            vec![
                unsigned_field("a", 0, 4),
                unsigned_field("b", 8, 8),
                unsigned_field("c", 16, 4),
            ],
        ));

        (Arc::new(old), Arc::new(new))
    }

    #[test]
    fn widened_field_converts_and_added_field_stays_zero() {
        let (old, new) = registries_for_widening();
        let seed = MigrationSeed::build(&old, &new);
        let migrator = StructMigrator::build(&seed);

        #[repr(C)]
        struct OldSample {
            a: u32,
            b: u32,
        }

        #[repr(C)]
        struct NewSample {
            a: u32,
            _pad: u32,
            b: u64,
            c: u32,
            _pad2: u32,
        }

        let source = OldSample { a: 11, b: 42 };
        let mut target = NewSample {
            a: 0,
            _pad: 0,
            b: 0,
            c: 0,
            _pad2: 0,
        };

        unsafe {
            migrator.migrate_instance(
                intern("sample"),
                &source as *const OldSample as *const u8,
                &mut target as *mut NewSample as *mut u8,
            );
        }

        assert_eq!(target.a, 11);
        assert_eq!(target.b, 42);
        assert_eq!(target.c, 0);
    }

    #[test]
    fn patch_migration_widens_recorded_write() {
        let (old, new) = registries_for_widening();
        let old_descriptor = old.query_struct(intern("sample")).unwrap().clone();

        let mut builder = PatchBuilder::new(&old, intern("sample"));
        builder.add_field(&old_descriptor, intern("b"), &7u32.to_ne_bytes());
        let patch = builder.build(&old);

        let seed = MigrationSeed::build(&old, &new);
        let migrator = StructMigrator::build(&seed);
        migrator.migrate_patches(&old, &new);

        assert_eq!(new.patches().len(), 1);
        let writes = patch.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].offset, 8);
        assert_eq!(writes[0].size, 8);

        let mut instance = [0u8; 24];
        patch.apply(&mut instance);
        let mut expected = [0u8; 24];
        expected[8..16].copy_from_slice(&7u64.to_ne_bytes());
        assert_eq!(instance, expected);
    }

    #[test]
    fn removed_type_is_reported_and_patch_dropped() {
        let mut old = Registry::new();
        old.add_struct(struct_type("gone", 4, vec![unsigned_field("a", 0, 4)]));
        let old = Arc::new(old);
        let new = Arc::new(Registry::new());

        let mut builder = PatchBuilder::new(&old, intern("gone"));
        builder.add_chunk(0, &1u32.to_ne_bytes());
        builder.build(&old);

        let seed = MigrationSeed::build(&old, &new);
        assert!(matches!(
            seed.struct_plan(intern("gone")),
            Some(StructPlan::Removed)
        ));

        let migrator = StructMigrator::build(&seed);
        migrator.migrate_patches(&old, &new);
        assert!(new.patches().is_empty());
    }

    #[test]
    fn nested_struct_change_propagates_to_parent() {
        let mut old = Registry::new();
        old.add_struct(struct_type("inner", 4, vec![unsigned_field("x", 0, 4)]));
        old.add_struct(struct_type(
            "outer",
            4,
            vec![Field {
                name: intern("inner"),
                offset: 0,
                size: 4,
                archetype: Archetype::Struct {
                    type_name: intern("inner"),
                },
            }],
        ));

        let mut new = Registry::new();
        new.add_struct(struct_type(
            "inner",
            8,
            vec![unsigned_field("x", 0, 4), unsigned_field("y", 4, 4)],
        ));
        new.add_struct(struct_type(
            "outer",
            8,
            vec![Field {
                name: intern("inner"),
                offset: 0,
                size: 8,
                archetype: Archetype::Struct {
                    type_name: intern("inner"),
                },
            }],
        ));

        let seed = MigrationSeed::build(&Arc::new(old), &Arc::new(new));
        assert!(matches!(
            seed.struct_plan(intern("outer")),
            Some(StructPlan::Changed(_))
        ));
    }
}
