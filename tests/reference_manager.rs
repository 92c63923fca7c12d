//! End-to-end reference manager scenarios: cold cache, warm cache and
//! umbrella requests over a typed repository.

use kan::prelude::*;
use kan::reference::info::{reference_meta_name, resource_type_meta_name};
use kan::reflection::RawInstance;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[repr(C)]
struct Material {
    albedo: u64,
}

#[repr(C)]
struct Effect {
    material: InternedString,
    strength: u64,
}

#[repr(C)]
struct Decal {
    material: InternedString,
}

fn unsigned_field(name: &str, offset: u32) -> Field {
    Field {
        name: intern(name),
        offset,
        size: 8,
        archetype: Archetype::UnsignedInt,
    }
}

fn reference_field(name: &str, offset: u32) -> Field {
    Field {
        name: intern(name),
        offset,
        size: std::mem::size_of::<InternedString>() as u32,
        archetype: Archetype::InternedString,
    }
}

fn resource_registry() -> Arc<Registry> {
    let mut registry = Registry::new();

    registry.add_struct(Arc::new(StructType {
        name: intern("material"),
        size: 8,
        alignment: 8,
        lifecycle: None,
        fields: vec![unsigned_field("albedo", 0)],
    }));
    registry.add_struct_meta(
        intern("material"),
        resource_type_meta_name(),
        Arc::new(ResourceTypeMeta { root: true }),
    );

    registry.add_struct(Arc::new(StructType {
        name: intern("effect"),
        size: 16,
        alignment: 8,
        lifecycle: None,
        fields: vec![
            reference_field("material", 0),
            unsigned_field("strength", 8),
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

    registry.add_struct(Arc::new(StructType {
        name: intern("decal"),
        size: 8,
        alignment: 8,
        lifecycle: None,
        fields: vec![reference_field("material", 0)],
    }));
    registry.add_struct_meta(
        intern("decal"),
        resource_type_meta_name(),
        Arc::new(ResourceTypeMeta { root: true }),
    );
    registry.add_struct_field_meta(
        intern("decal"),
        intern("material"),
        reference_meta_name(),
        Arc::new(ReferenceMeta {
            type_name: intern("material"),
        }),
    );

    Arc::new(registry)
}

struct Harness {
    manager: ReferenceManager,
    repository: ResourceRepository,
    _workspace: tempfile::TempDir,
    workspace_path: PathBuf,
    source_directory: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let workspace = tempfile::tempdir().unwrap();
        let workspace_path = workspace.path().to_path_buf();
        let manager = ReferenceManager::new(
            resource_registry(),
            ReferenceManagerConfig {
                workspace_directory: workspace_path.clone(),
                budget: Duration::from_millis(100),
                worker_count: Some(2),
            },
        );

        let repository = ResourceRepository::new();
        repository.set_scan_done(true);

        Harness {
            manager,
            repository,
            _workspace: workspace,
            workspace_path,
            source_directory: tempfile::tempdir().unwrap(),
        }
    }

    fn add_source_entry(&self, type_name: &str, name: &str) -> kan::AttachmentId {
        let path = self.source_directory.path().join(name);
        std::fs::write(&path, format!("{}:{}", type_name, name)).unwrap();
        self.repository.add_entry(intern(type_name), intern(name), path)
    }

    /// Runs ticks and provider fulfillment until the queues settle.
    fn run_until_idle(&mut self, provide: &dyn Fn(&ResourceRepository)) {
        for _ in 0..8 {
            self.manager.update(&self.repository);
            provide(&self.repository);
        }
    }
}

fn fulfill_everything(repository: &ResourceRepository) {
    for request in repository.pending_requests() {
        if request.provided_container_id.is_some() {
            continue;
        }

        let instance = if request.type_name == intern("effect") {
            RawInstance::from_value(
                Effect {
                    material: intern("brick"),
                    strength: 3,
                },
                None,
            )
        } else if request.type_name == intern("decal") {
            RawInstance::from_value(
                Decal {
                    material: intern("brick"),
                },
                None,
            )
        } else {
            RawInstance::from_value(Material { albedo: 1 }, None)
        };

        assert!(repository.provide_resource(request.request_id, instance));
    }
}

#[test]
fn cold_cache_scan_produces_cache_file_and_references() {
    let mut harness = Harness::new();
    let attachment_id = harness.add_source_entry("effect", "fire");
    // Keep source and cache mtimes strictly ordered.
    std::thread::sleep(Duration::from_millis(20));

    harness
        .repository
        .events
        .request_outer_references(intern("effect"), intern("fire"));
    harness.run_until_idle(&fulfill_everything);

    let responses: Vec<_> = harness.repository.events.outer_responses.drain().collect();
    assert_eq!(responses.len(), 1);
    assert!(responses[0].successful);
    assert_eq!(responses[0].entry_attachment_id, attachment_id);

    let references = harness.repository.outer_references(attachment_id);
    assert_eq!(references.len(), 1);
    assert_eq!(references[0].reference_type, intern("material"));
    assert_eq!(references[0].reference_name, intern("brick"));

    let cache_path = harness.workspace_path.join("effect").join("fire");
    assert!(cache_path.exists());

    let source_path = harness.source_directory.path().join("fire");
    let cache_time = kan::reference::cache::file_time_ns(&cache_path);
    let source_time = kan::reference::cache::file_time_ns(&source_path);
    assert!(cache_time > source_time);

    let update_state = harness.repository.update_state(attachment_id).unwrap();
    assert_eq!(update_state.last_update_file_time_ns, cache_time);
}

#[test]
fn warm_cache_completes_without_a_resource_request() {
    let mut harness = Harness::new();
    let attachment_id = harness.add_source_entry("effect", "fire");
    std::thread::sleep(Duration::from_millis(20));

    harness
        .repository
        .events
        .request_outer_references(intern("effect"), intern("fire"));
    harness.run_until_idle(&fulfill_everything);
    harness.repository.events.outer_responses.drain().count();

    // Second request must be served from the cache file alone.
    harness
        .repository
        .events
        .request_outer_references(intern("effect"), intern("fire"));

    for _ in 0..4 {
        harness.manager.update(&harness.repository);
        assert!(harness.repository.pending_requests().is_empty());
    }

    let responses: Vec<_> = harness.repository.events.outer_responses.drain().collect();
    assert_eq!(responses.len(), 1);
    assert!(responses[0].successful);

    let references = harness.repository.outer_references(attachment_id);
    assert_eq!(references.len(), 1);
    assert_eq!(references[0].reference_name, intern("brick"));
}

#[test]
fn umbrella_request_sweeps_every_referencer_type() {
    let mut harness = Harness::new();
    let effect_id = harness.add_source_entry("effect", "fire");
    let decal_id = harness.add_source_entry("decal", "leaf");
    std::thread::sleep(Duration::from_millis(20));

    harness
        .repository
        .events
        .request_all_references_to_type(intern("material"));
    harness.run_until_idle(&fulfill_everything);

    let responses: Vec<_> = harness.repository.events.all_responses.drain().collect();
    assert_eq!(responses.len(), 1);
    assert!(responses[0].successful);
    assert_eq!(responses[0].type_name, intern("material"));

    // Both per-entry scans completed and published their references.
    for attachment_id in [effect_id, decal_id].iter() {
        let references = harness.repository.outer_references(*attachment_id);
        assert_eq!(references.len(), 1);
        assert_eq!(references[0].reference_name, intern("brick"));
    }

    // Per-entry operations spawned by the umbrella respond as well.
    let outer_responses: Vec<_> =
        harness.repository.events.outer_responses.drain().collect();
    assert_eq!(outer_responses.len(), 2);
    assert!(outer_responses.iter().all(|response| response.successful));
}

#[test]
fn umbrella_fails_when_an_entry_disappears_mid_flight() {
    let mut harness = Harness::new();
    harness.add_source_entry("effect", "fire");
    let decal_id = harness.add_source_entry("decal", "leaf");
    std::thread::sleep(Duration::from_millis(20));

    harness
        .repository
        .events
        .request_all_references_to_type(intern("material"));

    // First tick creates the per-entry operations and resource requests.
    harness.manager.update(&harness.repository);
    harness.repository.remove_entry(decal_id);

    harness.run_until_idle(&fulfill_everything);

    let responses: Vec<_> = harness.repository.events.all_responses.drain().collect();
    assert_eq!(responses.len(), 1);
    assert!(!responses[0].successful);

    let outer_responses: Vec<_> =
        harness.repository.events.outer_responses.drain().collect();
    assert_eq!(outer_responses.len(), 2);
    assert_eq!(
        outer_responses
            .iter()
            .filter(|response| response.successful)
            .count(),
        1
    );
}
