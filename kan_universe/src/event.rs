//! Request/response events of the resource-reference manager.
//!
//! Every request produces exactly one matching response; the `successful`
//! flag is the only external error channel.

use kan_core::container::{EventQueue, EventSender};
use kan_core::{AttachmentId, InternedString};

#[derive(Clone, Debug)]
pub struct UpdateOuterReferencesRequest {
    pub type_name: InternedString,
    pub name: InternedString,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateOuterReferencesResponse {
    pub type_name: InternedString,
    pub name: InternedString,
    pub entry_attachment_id: AttachmentId,
    pub successful: bool,
}

#[derive(Clone, Debug)]
pub struct UpdateAllReferencesToTypeRequest {
    pub type_name: InternedString,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateAllReferencesToTypeResponse {
    pub type_name: InternedString,
    pub successful: bool,
}

/// Event queues wired between the manager and its clients.
pub struct ReferenceEvents {
    pub outer_requests: EventQueue<UpdateOuterReferencesRequest>,
    pub all_requests: EventQueue<UpdateAllReferencesToTypeRequest>,
    pub outer_responses: EventQueue<UpdateOuterReferencesResponse>,
    pub all_responses: EventQueue<UpdateAllReferencesToTypeResponse>,
}

impl ReferenceEvents {
    pub fn new() -> Self {
        ReferenceEvents {
            outer_requests: EventQueue::new(),
            all_requests: EventQueue::new(),
            outer_responses: EventQueue::new(),
            all_responses: EventQueue::new(),
        }
    }

    pub fn request_outer_references(&self, type_name: InternedString, name: InternedString) {
        self.outer_requests
            .emit(UpdateOuterReferencesRequest { type_name, name });
    }

    pub fn request_all_references_to_type(&self, type_name: InternedString) {
        self.all_requests
            .emit(UpdateAllReferencesToTypeRequest { type_name });
    }

    pub fn outer_response_sender(&self) -> EventSender<UpdateOuterReferencesResponse> {
        self.outer_responses.sender()
    }

    pub fn all_response_sender(&self) -> EventSender<UpdateAllReferencesToTypeResponse> {
        self.all_responses.sender()
    }
}

impl Default for ReferenceEvents {
    fn default() -> Self {
        ReferenceEvents::new()
    }
}
