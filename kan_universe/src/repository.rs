//! Typed repository tables backing the reference manager.
//!
//! Rows are plain records guarded by table locks; the manager follows a
//! single-writer discipline per row (operations are popped from the table
//! while a worker holds them). Entry removal cascade-deletes the entry's
//! outer references and update state, but intentionally not its operation:
//! the operation must emit a failure response before deleting itself, so
//! nothing waits forever.

use crate::event::ReferenceEvents;
use fxhash::FxHashMap;
use kan_core::reflection::RawInstance;
use kan_core::{AttachmentId, ContainerId, InternedString, RequestId};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct ResourceEntry {
    pub attachment_id: AttachmentId,
    pub type_name: InternedString,
    pub name: InternedString,
    /// Source file backing the entry; its mtime drives cache validity.
    pub path: PathBuf,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OuterReference {
    pub attachment_id: AttachmentId,
    pub reference_type: InternedString,
    pub reference_name: InternedString,
}

#[derive(Clone, Copy, Debug)]
pub struct ReferenceUpdateState {
    pub attachment_id: AttachmentId,
    pub last_update_file_time_ns: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperationState {
    Requested,
    WaitingResource,
}

#[derive(Clone, Debug)]
pub struct OuterReferencesOperation {
    pub entry_attachment_id: AttachmentId,
    pub type_name: InternedString,
    pub name: InternedString,
    pub state: OperationState,
    pub resource_request_id: RequestId,
}

#[derive(Clone, Debug)]
pub struct AllReferencesToTypeOperation {
    pub type_name: InternedString,
    pub successful: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OperationBinding {
    pub entry_attachment_id: AttachmentId,
    pub all_references_to_type: InternedString,
}

#[derive(Clone, Debug)]
pub struct ResourceRequest {
    pub request_id: RequestId,
    pub type_name: InternedString,
    pub name: InternedString,
    pub priority: u32,
    pub provided_container_id: Option<ContainerId>,
}

pub struct ResourceContainer {
    pub container_id: ContainerId,
    pub type_name: InternedString,
    pub instance: Arc<RawInstance>,
}

#[derive(Debug, Default)]
pub struct ProviderState {
    pub scan_done: bool,
    next_request_id: u64,
    next_attachment_id: u64,
    next_container_id: u64,
}

impl ProviderState {
    pub fn next_request_id(&mut self) -> RequestId {
        let id = RequestId::new(self.next_request_id);
        self.next_request_id += 1;
        id
    }

    fn next_attachment_id(&mut self) -> AttachmentId {
        let id = AttachmentId::new(self.next_attachment_id);
        self.next_attachment_id += 1;
        id
    }

    fn next_container_id(&mut self) -> ContainerId {
        let id = ContainerId::new(self.next_container_id);
        self.next_container_id += 1;
        id
    }
}

pub struct ResourceRepository {
    pub(crate) provider: Mutex<ProviderState>,

    pub(crate) entries: RwLock<FxHashMap<AttachmentId, ResourceEntry>>,
    pub(crate) entries_by_name: RwLock<FxHashMap<InternedString, Vec<AttachmentId>>>,
    pub(crate) entries_by_type: RwLock<FxHashMap<InternedString, Vec<AttachmentId>>>,

    pub(crate) references: Mutex<FxHashMap<AttachmentId, Vec<OuterReference>>>,
    pub(crate) update_states: Mutex<FxHashMap<AttachmentId, ReferenceUpdateState>>,

    pub(crate) requests: Mutex<FxHashMap<RequestId, ResourceRequest>>,
    pub(crate) containers: Mutex<FxHashMap<ContainerId, ResourceContainer>>,

    pub(crate) operations: Mutex<Vec<Option<OuterReferencesOperation>>>,
    pub(crate) umbrella_operations: Mutex<Vec<AllReferencesToTypeOperation>>,
    pub(crate) bindings: Mutex<Vec<OperationBinding>>,

    pub events: ReferenceEvents,
}

impl ResourceRepository {
    pub fn new() -> Self {
        ResourceRepository {
            provider: Mutex::new(ProviderState::default()),
            entries: RwLock::new(FxHashMap::default()),
            entries_by_name: RwLock::new(FxHashMap::default()),
            entries_by_type: RwLock::new(FxHashMap::default()),
            references: Mutex::new(FxHashMap::default()),
            update_states: Mutex::new(FxHashMap::default()),
            requests: Mutex::new(FxHashMap::default()),
            containers: Mutex::new(FxHashMap::default()),
            operations: Mutex::new(Vec::new()),
            umbrella_operations: Mutex::new(Vec::new()),
            bindings: Mutex::new(Vec::new()),
            events: ReferenceEvents::new(),
        }
    }

    pub fn set_scan_done(&self, scan_done: bool) {
        self.provider.lock().scan_done = scan_done;
    }

    pub fn scan_done(&self) -> bool {
        self.provider.lock().scan_done
    }

    pub fn add_entry(
        &self,
        type_name: InternedString,
        name: InternedString,
        path: PathBuf,
    ) -> AttachmentId {
        let attachment_id = self.provider.lock().next_attachment_id();
        let entry = ResourceEntry {
            attachment_id,
            type_name,
            name,
            path,
        };

        self.entries.write().insert(attachment_id, entry);
        self.entries_by_name
            .write()
            .entry(name)
            .or_insert_with(Vec::new)
            .push(attachment_id);
        self.entries_by_type
            .write()
            .entry(type_name)
            .or_insert_with(Vec::new)
            .push(attachment_id);

        attachment_id
    }

    /// Cascade-deletes the entry's references and update state. Any in-flight
    /// operation for the entry stays and fails on its next processing step.
    pub fn remove_entry(&self, attachment_id: AttachmentId) {
        let removed = self.entries.write().remove(&attachment_id);
        if let Some(entry) = removed {
            if let Some(ids) = self.entries_by_name.write().get_mut(&entry.name) {
                ids.retain(|id| *id != attachment_id);
            }
            if let Some(ids) = self.entries_by_type.write().get_mut(&entry.type_name) {
                ids.retain(|id| *id != attachment_id);
            }

            self.references.lock().remove(&attachment_id);
            self.update_states.lock().remove(&attachment_id);
        }
    }

    pub fn entry(&self, attachment_id: AttachmentId) -> Option<ResourceEntry> {
        self.entries.read().get(&attachment_id).cloned()
    }

    /// Name-index lookup filtered by type, mirroring the request intake path.
    pub fn find_entry(
        &self,
        type_name: InternedString,
        name: InternedString,
    ) -> Option<ResourceEntry> {
        let by_name = self.entries_by_name.read();
        let entries = self.entries.read();

        by_name.get(&name).and_then(|ids| {
            ids.iter()
                .filter_map(|id| entries.get(id))
                .find(|entry| entry.type_name == type_name)
                .cloned()
        })
    }

    pub fn entries_of_type(&self, type_name: InternedString) -> Vec<ResourceEntry> {
        let by_type = self.entries_by_type.read();
        let entries = self.entries.read();

        by_type
            .get(&type_name)
            .map(|ids| ids.iter().filter_map(|id| entries.get(id)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn outer_references(&self, attachment_id: AttachmentId) -> Vec<OuterReference> {
        self.references
            .lock()
            .get(&attachment_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn update_state(&self, attachment_id: AttachmentId) -> Option<ReferenceUpdateState> {
        self.update_states.lock().get(&attachment_id).copied()
    }

    pub(crate) fn create_request(
        &self,
        type_name: InternedString,
        name: InternedString,
    ) -> RequestId {
        let request_id = self.provider.lock().next_request_id();
        self.requests.lock().insert(
            request_id,
            ResourceRequest {
                request_id,
                type_name,
                name,
                // Reference scans carry no special loading priority.
                priority: 0,
                provided_container_id: None,
            },
        );
        request_id
    }

    pub(crate) fn request(&self, request_id: RequestId) -> Option<ResourceRequest> {
        self.requests.lock().get(&request_id).cloned()
    }

    pub(crate) fn delete_request(&self, request_id: RequestId) {
        if let Some(request) = self.requests.lock().remove(&request_id) {
            if let Some(container_id) = request.provided_container_id {
                self.containers.lock().remove(&container_id);
            }
        }
    }

    pub(crate) fn container_instance(
        &self,
        container_id: ContainerId,
    ) -> Option<(InternedString, Arc<RawInstance>)> {
        self.containers
            .lock()
            .get(&container_id)
            .map(|container| (container.type_name, container.instance.clone()))
    }

    /// Provider-side fulfillment: publishes a loaded instance for a pending
    /// request. Returns false when the request is gone.
    pub fn provide_resource(&self, request_id: RequestId, instance: RawInstance) -> bool {
        // Lock order is provider, requests, containers on every path.
        let container_id = self.provider.lock().next_container_id();

        let type_name = {
            let mut requests = self.requests.lock();
            match requests.get_mut(&request_id) {
                Some(request) => {
                    request.provided_container_id = Some(container_id);
                    request.type_name
                }
                None => return false,
            }
        };

        self.containers.lock().insert(
            container_id,
            ResourceContainer {
                container_id,
                type_name,
                instance: Arc::new(instance),
            },
        );

        true
    }

    pub fn pending_requests(&self) -> Vec<ResourceRequest> {
        self.requests.lock().values().cloned().collect()
    }

    pub fn operation_count(&self) -> usize {
        self.operations
            .lock()
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    pub(crate) fn insert_operation(&self, operation: OuterReferencesOperation) {
        let mut operations = self.operations.lock();
        match operations.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => *slot = Some(operation),
            None => operations.push(Some(operation)),
        }
    }
}

impl Default for ResourceRepository {
    fn default() -> Self {
        ResourceRepository::new()
    }
}
