//! Resource-reference manager.
//!
//! Maintains, for every native resource entry, an up-to-date list of its
//! outgoing references, caching results on disk so repeated boots need not
//! rescan unchanged resources. Requests arrive as events; per-entry
//! operations advance through a per-frame scheduler with a cooperative CPU
//! time budget shared by a pool of workers.

pub mod cache;
pub mod detect;
pub mod info;

pub use cache::ReferenceCacheError;
pub use detect::{DetectedReference, DetectedReferenceContainer};
pub use info::{ReferenceMeta, ReferenceTypeInfoStorage, ResourceTypeMeta};

use crate::event::{UpdateAllReferencesToTypeResponse, UpdateOuterReferencesResponse};
use crate::repository::{
    AllReferencesToTypeOperation, OperationBinding, OperationState, OuterReferencesOperation,
    ResourceEntry, ResourceRepository,
};
use kan_core::reflection::Registry;
use kan_core::{AttachmentId, InternedString, RequestId};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};

pub struct ReferenceManagerConfig {
    /// Root directory of the per-type cache files.
    pub workspace_directory: PathBuf,
    /// CPU time budget of one tick's worker phase.
    pub budget: Duration,
    /// Worker pool size; defaults to the rayon pool width.
    pub worker_count: Option<usize>,
}

impl ReferenceManagerConfig {
    pub fn new(workspace_directory: PathBuf) -> Self {
        ReferenceManagerConfig {
            workspace_directory,
            budget: Duration::from_millis(2),
            worker_count: None,
        }
    }
}

pub struct ReferenceManager {
    config: ReferenceManagerConfig,
    registry: Arc<Registry>,
    info: ReferenceTypeInfoStorage,
    /// Newest loaded plugin mtime, supplied by the host plugin system.
    plugin_update_time_ns: u64,
    need_to_cancel_old_operations: bool,
}

impl ReferenceManager {
    pub fn new(registry: Arc<Registry>, config: ReferenceManagerConfig) -> Self {
        let info = ReferenceTypeInfoStorage::build(&registry);
        ReferenceManager {
            config,
            registry,
            info,
            plugin_update_time_ns: 0,
            need_to_cancel_old_operations: true,
        }
    }

    pub fn set_plugin_update_time_ns(&mut self, time_ns: u64) {
        self.plugin_update_time_ns = time_ns;
    }

    pub fn info(&self) -> &ReferenceTypeInfoStorage {
        &self.info
    }

    /// One frame of the manager: event intake, umbrella bookkeeping, then
    /// budget-bound operation serving.
    pub fn update(&mut self, repository: &ResourceRepository) {
        let begin = Instant::now();

        if self.need_to_cancel_old_operations {
            self.cancel_all_operations(repository);
            self.need_to_cancel_old_operations = false;
        }

        if !repository.scan_done() {
            // A rescan may invalidate attachments, so everything in flight is
            // cancelled with a failure response.
            self.cancel_all_operations(repository);
            return;
        }

        self.intake_outer_requests(repository);
        self.intake_all_references_requests(repository);
        Self::finalize_idle_umbrella_operations(repository);
        self.serve_operations(repository, begin + self.config.budget);
    }

    fn send_outer_response(
        repository: &ResourceRepository,
        type_name: InternedString,
        name: InternedString,
        successful: bool,
        entry_attachment_id: AttachmentId,
    ) {
        repository
            .events
            .outer_responses
            .emit(UpdateOuterReferencesResponse {
                type_name,
                name,
                entry_attachment_id,
                successful,
            });
    }

    fn send_all_response(
        repository: &ResourceRepository,
        type_name: InternedString,
        successful: bool,
    ) {
        repository
            .events
            .all_responses
            .emit(UpdateAllReferencesToTypeResponse {
                type_name,
                successful,
            });
    }

    fn reset_operation(repository: &ResourceRepository, operation: &mut OuterReferencesOperation) {
        if operation.state == OperationState::WaitingResource {
            repository.delete_request(operation.resource_request_id);
        }

        operation.state = OperationState::Requested;
    }

    fn delete_bindings_for(repository: &ResourceRepository, attachment_id: AttachmentId) {
        repository
            .bindings
            .lock()
            .retain(|binding| binding.entry_attachment_id != attachment_id);
    }

    fn fail_bound_umbrellas(repository: &ResourceRepository, attachment_id: AttachmentId) {
        let bindings = repository.bindings.lock();
        let mut umbrellas = repository.umbrella_operations.lock();

        for binding in bindings
            .iter()
            .filter(|binding| binding.entry_attachment_id == attachment_id)
        {
            if let Some(operation) = umbrellas
                .iter_mut()
                .find(|operation| operation.type_name == binding.all_references_to_type)
            {
                operation.successful = false;
            }
        }
    }

    fn cancel_all_operations(&self, repository: &ResourceRepository) {
        let operations: Vec<OuterReferencesOperation> = {
            let mut table = repository.operations.lock();
            let drained = table.iter_mut().filter_map(Option::take).collect();
            table.clear();
            drained
        };

        for mut operation in operations {
            Self::reset_operation(repository, &mut operation);
            Self::send_outer_response(
                repository,
                operation.type_name,
                operation.name,
                false,
                AttachmentId::INVALID,
            );
        }

        repository.bindings.lock().clear();

        let umbrellas: Vec<AllReferencesToTypeOperation> =
            std::mem::take(&mut *repository.umbrella_operations.lock());
        for operation in umbrellas {
            Self::send_all_response(repository, operation.type_name, false);
        }
    }

    fn add_binding_if_missing(
        repository: &ResourceRepository,
        attachment_id: AttachmentId,
        umbrella_type: InternedString,
    ) {
        let mut bindings = repository.bindings.lock();
        let candidate = OperationBinding {
            entry_attachment_id: attachment_id,
            all_references_to_type: umbrella_type,
        };

        if !bindings.contains(&candidate) {
            bindings.push(candidate);
        }
    }

    fn add_operation_for_entry(
        &self,
        repository: &ResourceRepository,
        entry: &ResourceEntry,
        umbrella_type: Option<InternedString>,
    ) {
        // Existing operations are reset rather than duplicated.
        let existing = {
            let mut operations = repository.operations.lock();
            match operations
                .iter_mut()
                .flatten()
                .find(|operation| operation.entry_attachment_id == entry.attachment_id)
            {
                Some(operation) => {
                    let pending_request = match operation.state {
                        OperationState::WaitingResource => Some(operation.resource_request_id),
                        OperationState::Requested => None,
                    };
                    operation.state = OperationState::Requested;
                    Some(pending_request)
                }
                None => None,
            }
        };

        match existing {
            Some(pending_request) => {
                if let Some(request_id) = pending_request {
                    repository.delete_request(request_id);
                }
            }
            None => {
                repository.insert_operation(OuterReferencesOperation {
                    entry_attachment_id: entry.attachment_id,
                    type_name: entry.type_name,
                    name: entry.name,
                    state: OperationState::Requested,
                    resource_request_id: RequestId::INVALID,
                });
            }
        }

        if let Some(umbrella_type) = umbrella_type {
            Self::add_binding_if_missing(repository, entry.attachment_id, umbrella_type);
        }
    }

    fn intake_outer_requests(&self, repository: &ResourceRepository) {
        let requests: Vec<_> = repository.events.outer_requests.drain().collect();

        for request in requests {
            match repository.find_entry(request.type_name, request.name) {
                Some(entry) => self.add_operation_for_entry(repository, &entry, None),
                None => {
                    error!(
                        name = request.name.as_str(),
                        type_name = request.type_name.as_str(),
                        "unable to find native resource to collect its outer references"
                    );
                    Self::send_outer_response(
                        repository,
                        request.type_name,
                        request.name,
                        false,
                        AttachmentId::INVALID,
                    );
                }
            }
        }
    }

    fn intake_all_references_requests(&self, repository: &ResourceRepository) {
        let requests: Vec<_> = repository.events.all_requests.drain().collect();

        for request in requests {
            {
                let mut umbrellas = repository.umbrella_operations.lock();
                match umbrellas
                    .iter_mut()
                    .find(|operation| operation.type_name == request.type_name)
                {
                    Some(operation) => operation.successful = true,
                    None => umbrellas.push(AllReferencesToTypeOperation {
                        type_name: request.type_name,
                        successful: true,
                    }),
                }
            }

            for referencer_type in self.info.referencers_of(request.type_name) {
                for entry in repository.entries_of_type(*referencer_type) {
                    self.add_operation_for_entry(repository, &entry, Some(request.type_name));
                }
            }
        }
    }

    /// Umbrella operations with no remaining bindings are complete; their
    /// `successful` is the conjunction of all per-entry outcomes.
    fn finalize_idle_umbrella_operations(repository: &ResourceRepository) {
        let completed: Vec<AllReferencesToTypeOperation> = {
            let bindings = repository.bindings.lock();
            let mut umbrellas = repository.umbrella_operations.lock();
            let mut completed = Vec::new();

            umbrellas.retain(|operation| {
                let any_binding = bindings
                    .iter()
                    .any(|binding| binding.all_references_to_type == operation.type_name);

                if any_binding {
                    true
                } else {
                    completed.push(operation.clone());
                    false
                }
            });

            completed
        };

        for operation in completed {
            Self::send_all_response(repository, operation.type_name, operation.successful);
        }
    }

    fn serve_operations(&self, repository: &ResourceRepository, deadline: Instant) {
        let worker_count = self
            .config
            .worker_count
            .unwrap_or_else(rayon::current_num_threads)
            .max(1);
        let cursor = Mutex::new(0usize);
        let cursor = &cursor;

        rayon::scope(|scope| {
            for _ in 0..worker_count {
                scope.spawn(move |_| self.serve_worker(repository, cursor, deadline));
            }
        });
    }

    fn serve_worker(
        &self,
        repository: &ResourceRepository,
        cursor: &Mutex<usize>,
        deadline: Instant,
    ) {
        // Operation processing is synchronous inside a step; the bounded I/O
        // happens between cursor pops, never under the cursor lock.
        loop {
            if Instant::now() >= deadline {
                break;
            }

            let popped = {
                let mut cursor = cursor.lock();
                let mut operations = repository.operations.lock();
                let mut found = None;

                while *cursor < operations.len() {
                    let index = *cursor;
                    *cursor += 1;

                    if let Some(operation) = operations[index].take() {
                        found = Some((index, operation));
                        break;
                    }
                }

                found
            };

            let (index, operation) = match popped {
                Some(popped) => popped,
                None => break,
            };

            if let Some(kept) = self.serve_operation(repository, operation) {
                repository.operations.lock()[index] = Some(kept);
            }
        }
    }

    /// Advances one operation. Returning `None` deletes it, which also
    /// cascade-deletes its umbrella bindings.
    fn serve_operation(
        &self,
        repository: &ResourceRepository,
        mut operation: OuterReferencesOperation,
    ) -> Option<OuterReferencesOperation> {
        let entry = match repository.entry(operation.entry_attachment_id) {
            Some(entry) => entry,
            None => {
                error!(
                    name = operation.name.as_str(),
                    type_name = operation.type_name.as_str(),
                    "failed to process outer references request, its entry no longer exists"
                );
                Self::send_outer_response(
                    repository,
                    operation.type_name,
                    operation.name,
                    false,
                    AttachmentId::INVALID,
                );
                Self::fail_bound_umbrellas(repository, operation.entry_attachment_id);
                Self::reset_operation(repository, &mut operation);
                Self::delete_bindings_for(repository, operation.entry_attachment_id);
                return None;
            }
        };

        match operation.state {
            OperationState::Requested => self.serve_requested(repository, operation, &entry),
            OperationState::WaitingResource => self.serve_waiting(repository, operation, &entry),
        }
    }

    fn serve_requested(
        &self,
        repository: &ResourceRepository,
        mut operation: OuterReferencesOperation,
        entry: &ResourceEntry,
    ) -> Option<OuterReferencesOperation> {
        let cache_path = cache::cache_file_path(
            &self.config.workspace_directory,
            operation.type_name,
            operation.name,
        );

        let transient_update_time_ns = repository
            .update_state(operation.entry_attachment_id)
            .map(|state| state.last_update_file_time_ns)
            .unwrap_or(0);
        let plugin_update_time_ns = self.plugin_update_time_ns;
        let cache_update_time_ns = cache::file_time_ns(&cache_path);
        let source_update_time_ns = cache::file_time_ns(&entry.path);

        let cache_is_up_to_date = cache_update_time_ns > source_update_time_ns
            && cache_update_time_ns > plugin_update_time_ns;
        let update_not_needed =
            transient_update_time_ns > cache_update_time_ns && cache_is_up_to_date;

        if update_not_needed {
            Self::send_outer_response(
                repository,
                operation.type_name,
                operation.name,
                true,
                entry.attachment_id,
            );
            Self::delete_bindings_for(repository, operation.entry_attachment_id);
            return None;
        }

        if cache_is_up_to_date {
            match cache::read_cache(&cache_path) {
                Ok(container) => {
                    Self::publish_references(repository, entry, &container, cache_update_time_ns);
                    Self::send_outer_response(
                        repository,
                        operation.type_name,
                        operation.name,
                        true,
                        entry.attachment_id,
                    );
                    Self::delete_bindings_for(repository, operation.entry_attachment_id);
                    return None;
                }
                Err(cache_error) => {
                    warn!(
                        path = %cache_path.display(),
                        %cache_error,
                        "failed to load reference cache, falling back to a resource scan"
                    );
                }
            }
        }

        let request_id = repository.create_request(entry.type_name, entry.name);
        operation.state = OperationState::WaitingResource;
        operation.resource_request_id = request_id;
        Some(operation)
    }

    fn serve_waiting(
        &self,
        repository: &ResourceRepository,
        operation: OuterReferencesOperation,
        entry: &ResourceEntry,
    ) -> Option<OuterReferencesOperation> {
        let request = match repository.request(operation.resource_request_id) {
            Some(request) => request,
            None => {
                error!(
                    name = operation.name.as_str(),
                    type_name = operation.type_name.as_str(),
                    "failed to process outer references request, its resource request was lost"
                );
                Self::send_outer_response(
                    repository,
                    operation.type_name,
                    operation.name,
                    false,
                    entry.attachment_id,
                );
                Self::fail_bound_umbrellas(repository, operation.entry_attachment_id);
                Self::delete_bindings_for(repository, operation.entry_attachment_id);
                return None;
            }
        };

        let container_id = match request.provided_container_id {
            // Resource is still loading; check again next tick.
            None => return Some(operation),
            Some(container_id) => container_id,
        };

        let failed_reason = if self.registry.query_struct(operation.type_name).is_none() {
            Some("its type is not registered among accessible resource types")
        } else if repository.container_instance(container_id).is_none() {
            Some("its loaded container was lost")
        } else {
            None
        };

        if let Some(reason) = failed_reason {
            error!(
                name = operation.name.as_str(),
                type_name = operation.type_name.as_str(),
                "failed to process outer references request, {}",
                reason
            );
            repository.delete_request(operation.resource_request_id);
            Self::send_outer_response(
                repository,
                operation.type_name,
                operation.name,
                false,
                entry.attachment_id,
            );
            Self::fail_bound_umbrellas(repository, operation.entry_attachment_id);
            Self::delete_bindings_for(repository, operation.entry_attachment_id);
            return None;
        }

        let (_container_type, instance) = repository
            .container_instance(container_id)
            .expect("container checked above");

        let mut container = DetectedReferenceContainer::default();
        unsafe {
            detect::detect_references(
                &self.registry,
                operation.type_name,
                instance.ptr(),
                &mut container,
            );
        }

        let cache_file_time = cache::write_cache(
            &self.config.workspace_directory,
            operation.type_name,
            operation.name,
            &container,
        );

        Self::publish_references(repository, entry, &container, cache_file_time);
        repository.delete_request(operation.resource_request_id);
        Self::send_outer_response(
            repository,
            operation.type_name,
            operation.name,
            true,
            entry.attachment_id,
        );
        Self::delete_bindings_for(repository, operation.entry_attachment_id);
        None
    }

    /// Reconciles the entry's reference rows with the detected list by slot
    /// and upserts the update state with the cache mtime.
    fn publish_references(
        repository: &ResourceRepository,
        entry: &ResourceEntry,
        container: &DetectedReferenceContainer,
        file_time_ns: u64,
    ) {
        use crate::repository::{OuterReference, ReferenceUpdateState};

        {
            let mut references = repository.references.lock();
            let rows = references
                .entry(entry.attachment_id)
                .or_insert_with(Vec::new);
            let detected = &container.detected_references;

            let mut index = 0;
            while index < rows.len() && index < detected.len() {
                rows[index].reference_type = detected[index].type_name;
                rows[index].reference_name = detected[index].name;
                index += 1;
            }

            rows.truncate(detected.len());
            while index < detected.len() {
                rows.push(OuterReference {
                    attachment_id: entry.attachment_id,
                    reference_type: detected[index].type_name,
                    reference_name: detected[index].name,
                });
                index += 1;
            }
        }

        let mut states = repository.update_states.lock();
        match states.get_mut(&entry.attachment_id) {
            Some(state) => state.last_update_file_time_ns = file_time_ns,
            None => {
                states.insert(
                    entry.attachment_id,
                    ReferenceUpdateState {
                        attachment_id: entry.attachment_id,
                        last_update_file_time_ns: file_time_ns,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kan_core::intern;

    fn empty_manager(workspace: PathBuf) -> ReferenceManager {
        ReferenceManager::new(
            Arc::new(Registry::new()),
            ReferenceManagerConfig {
                workspace_directory: workspace,
                budget: Duration::from_millis(50),
                worker_count: Some(2),
            },
        )
    }

    #[test]
    fn request_for_missing_entry_fails_immediately() {
        let workspace = tempfile::tempdir().unwrap();
        let mut manager = empty_manager(workspace.path().to_path_buf());
        let repository = ResourceRepository::new();
        repository.set_scan_done(true);

        repository
            .events
            .request_outer_references(intern("material"), intern("ghost"));
        manager.update(&repository);

        let responses: Vec<_> = repository.events.outer_responses.drain().collect();
        assert_eq!(responses.len(), 1);
        assert!(!responses[0].successful);
        assert_eq!(responses[0].name, intern("ghost"));
        assert!(!responses[0].entry_attachment_id.is_valid());
    }

    #[test]
    fn provider_rescan_cancels_ongoing_operations() {
        let workspace = tempfile::tempdir().unwrap();
        let mut manager = empty_manager(workspace.path().to_path_buf());
        let repository = ResourceRepository::new();
        repository.set_scan_done(true);

        let entry_path = workspace.path().join("brick");
        std::fs::write(&entry_path, b"payload").unwrap();
        repository.add_entry(intern("material"), intern("brick"), entry_path);

        repository
            .events
            .request_outer_references(intern("material"), intern("brick"));
        manager.update(&repository);
        assert_eq!(repository.operation_count(), 1);

        repository.set_scan_done(false);
        manager.update(&repository);

        assert_eq!(repository.operation_count(), 0);
        let responses: Vec<_> = repository.events.outer_responses.drain().collect();
        assert_eq!(responses.len(), 1);
        assert!(!responses[0].successful);
        assert!(repository.pending_requests().is_empty());
    }

    #[test]
    fn umbrella_with_no_referencers_completes_successfully() {
        let workspace = tempfile::tempdir().unwrap();
        let mut manager = empty_manager(workspace.path().to_path_buf());
        let repository = ResourceRepository::new();
        repository.set_scan_done(true);

        repository
            .events
            .request_all_references_to_type(intern("material"));
        manager.update(&repository);
        manager.update(&repository);

        let responses: Vec<_> = repository.events.all_responses.drain().collect();
        assert_eq!(responses.len(), 1);
        assert!(responses[0].successful);
        assert_eq!(responses[0].type_name, intern("material"));
    }
}
