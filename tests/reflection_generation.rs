//! End-to-end reflection reload: regenerate the registry with a changed
//! layout, migrate patches and live instances across.

use kan::prelude::*;
use std::convert::TryInto;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn unsigned_field(name: &str, offset: u32, size: u32) -> Field {
    Field {
        name: intern(name),
        offset,
        size,
        archetype: Archetype::UnsignedInt,
    }
}

fn sample_v1() -> Arc<StructType> {
    Arc::new(StructType {
        name: intern("sample"),
        size: 8,
        alignment: 8,
        lifecycle: None,
        fields: vec![unsigned_field("a", 0, 4), unsigned_field("b", 4, 4)],
    })
}

fn sample_v2() -> Arc<StructType> {
    Arc::new(StructType {
        name: intern("sample"),
        size: 24,
        alignment: 8,
        lifecycle: None,
        fields: vec![
            unsigned_field("a", 0, 4),
            unsigned_field("b", 8, 8),
            unsigned_field("c", 16, 4),
        ],
    })
}

fn system_with_versioned_sample() -> (ReflectionSystem, Arc<AtomicUsize>) {
    let mut system = ReflectionSystem::new();
    let generation = Arc::new(AtomicUsize::new(0));
    let generation_for_populate = generation.clone();

    system.on_populate(move |registry| {
        if generation_for_populate.load(Ordering::SeqCst) == 0 {
            registry.add_struct(sample_v1());
        } else {
            registry.add_struct(sample_v2());
        }
    });

    (system, generation)
}

#[test]
fn reload_migrates_patches_to_the_new_layout() {
    let (mut system, generation) = system_with_versioned_sample();
    system.generate();

    let old_registry = system.registry().unwrap().clone();
    let descriptor = old_registry.query_struct(intern("sample")).unwrap().clone();
    let mut builder = PatchBuilder::new(&old_registry, intern("sample"));
    builder.add_field(&descriptor, intern("b"), &7u32.to_ne_bytes());
    let patch = builder.build(&old_registry);

    generation.store(1, Ordering::SeqCst);
    system.invalidate();

    let new_registry = system.registry().unwrap();
    assert_eq!(new_registry.patches().len(), 1);
    assert!(old_registry.patches().is_empty());

    // Applying the migrated patch to a default value of the new layout
    // writes b as a widened integer and touches nothing else.
    let mut instance = [0u8; 24];
    patch.apply(&mut instance);
    assert_eq!(&instance[0..8], &[0u8; 8]);
    assert_eq!(
        u64::from_ne_bytes(instance[8..16].try_into().unwrap()),
        7
    );
    assert_eq!(&instance[16..24], &[0u8; 8]);
}

#[test]
fn generated_callback_migrates_live_instances() {
    let (mut system, generation) = system_with_versioned_sample();

    let migrated: Arc<Mutex<Option<(u32, u64, u32)>>> = Arc::new(Mutex::new(None));
    let migrated_for_callback = migrated.clone();

    system.on_generated(move |old_registry: Option<&Arc<Registry>>,
                              _new_registry: &Arc<Registry>,
                              seed: Option<&MigrationSeed>,
                              migrator: Option<&StructMigrator>| {
        let (old_registry, migrator) = match (old_registry, seed, migrator) {
            (Some(old_registry), Some(_), Some(migrator)) => (old_registry, migrator),
            // First generation has no previous registry to migrate from.
            _ => return,
        };
        assert!(old_registry.query_struct(intern("sample")).is_some());

        let mut old_instance = [0u8; 8];
        old_instance[0..4].copy_from_slice(&5u32.to_ne_bytes());
        old_instance[4..8].copy_from_slice(&9u32.to_ne_bytes());

        let mut new_instance = [0u8; 24];
        unsafe {
            migrator.migrate_instance(
                intern("sample"),
                old_instance.as_ptr(),
                new_instance.as_mut_ptr(),
            );
        }

        *migrated_for_callback.lock().unwrap() = Some((
            u32::from_ne_bytes(new_instance[0..4].try_into().unwrap()),
            u64::from_ne_bytes(new_instance[8..16].try_into().unwrap()),
            u32::from_ne_bytes(new_instance[16..20].try_into().unwrap()),
        ));
    });

    system.generate();
    assert!(migrated.lock().unwrap().is_none());

    generation.store(1, Ordering::SeqCst);
    system.invalidate();

    assert_eq!(*migrated.lock().unwrap(), Some((5, 9, 0)));
}
