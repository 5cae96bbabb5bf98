//! Pending inbound invitations
//!
//! At most one per endpoint id. The decision callback runs exactly once:
//! through accept/reject, through replacement by a newer invitation (decline),
//! or through cleanup (decline).

use crate::transport::InvitationResponder;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug)]
pub struct PendingInvitation {
    endpoint_id: String,
    context: Option<Vec<u8>>,
    responder: InvitationResponder,
}

impl PendingInvitation {
    pub fn new(
        endpoint_id: impl Into<String>,
        context: Option<Vec<u8>>,
        responder: InvitationResponder,
    ) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            context,
            responder,
        }
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// Base64 of the context bytes, empty when there were none
    pub fn authentication_token(&self) -> String {
        self.context
            .as_deref()
            .map(|bytes| BASE64.encode(bytes))
            .unwrap_or_default()
    }

    pub fn resolve(self, accept: bool) {
        debug!(
            "Invitation from {} {}",
            self.endpoint_id,
            if accept { "accepted" } else { "declined" }
        );
        self.responder.respond(accept);
    }
}

#[derive(Debug, Default)]
pub struct InvitationBook {
    pending: HashMap<String, PendingInvitation>,
}

impl InvitationBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an invitation, declining any older one for the same id
    pub fn insert(&mut self, invitation: PendingInvitation) {
        if let Some(previous) = self
            .pending
            .insert(invitation.endpoint_id.clone(), invitation)
        {
            debug!("Superseding invitation from {}", previous.endpoint_id);
            previous.resolve(false);
        }
    }

    /// Remove the invitation so it can be resolved; `None` the second time
    pub fn take(&mut self, endpoint_id: &str) -> Option<PendingInvitation> {
        self.pending.remove(endpoint_id)
    }

    pub fn contains(&self, endpoint_id: &str) -> bool {
        self.pending.contains_key(endpoint_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn decline_all(&mut self) {
        for (_, invitation) in self.pending.drain() {
            invitation.resolve(false);
        }
    }
}
