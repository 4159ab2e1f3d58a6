//! Contact lookup and writes on top of the CRM client.

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::crm::{ContactRecord, CrmClient, CrmError};
use crate::reconcile::{reconcile, TagDelta, TagUpdate};

#[derive(Clone)]
pub struct Contacts {
    crm: Arc<dyn CrmClient>,
}

impl Contacts {
    pub fn new(crm: Arc<dyn CrmClient>) -> Self {
        Self { crm }
    }

    pub fn client(&self) -> &Arc<dyn CrmClient> {
        &self.crm
    }

    /// First match only. A hit whose stored value disagrees with `id` is
    /// treated as no match.
    pub async fn find_by_external_id(
        &self,
        field: &str,
        id: &str,
    ) -> Result<Option<ContactRecord>, CrmError> {
        let found = self.first(&format!("{field}:{id}")).await?;
        Ok(found.filter(|contact| match contact.field_str(field) {
            Some(stored) => stored == id,
            None => true,
        }))
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<ContactRecord>, CrmError> {
        let found = self.first(email).await?;
        Ok(found.filter(|contact| match contact.field_str("email") {
            Some(stored) => stored.eq_ignore_ascii_case(email),
            None => true,
        }))
    }

    /// Looks up by the stable external id first, then by email. The email can
    /// change between events; the external id cannot.
    pub async fn resolve(
        &self,
        email: &str,
        external: Option<(&str, &str)>,
    ) -> Result<Option<ContactRecord>, CrmError> {
        if let Some((field, id)) = external {
            if let Some(contact) = self.find_by_external_id(field, id).await? {
                return Ok(Some(contact));
            }
            debug!(field, id, "no contact by external id, falling back to email");
        }
        self.find_by_email(email).await
    }

    pub async fn create(&self, fields: &Map<String, Value>) -> Result<Option<u64>, CrmError> {
        self.crm.create(fields).await
    }

    pub async fn update(
        &self,
        id: u64,
        fields: &Map<String, Value>,
    ) -> Result<Option<u64>, CrmError> {
        self.crm.edit(id, fields).await
    }

    pub async fn add_to_segments(&self, segments: &[u64], contact_id: u64) -> Result<(), CrmError> {
        for segment_id in segments {
            self.crm.add_to_segment(*segment_id, contact_id).await?;
        }
        Ok(())
    }

    /// Re-reads the contact's tags, then writes the reconciled list. No call
    /// is made when the delta changes nothing.
    pub async fn apply_tags(
        &self,
        contact_id: u64,
        delta: &TagDelta,
    ) -> Result<TagUpdate, CrmError> {
        let current = match self.crm.get(contact_id).await? {
            Some(contact) => contact.tags,
            None => {
                warn!(contact_id, "contact vanished before tag update");
                return Err(CrmError::Unexpected(format!(
                    "contact {contact_id} not found"
                )));
            }
        };

        let update = reconcile(&current, delta);
        if update.is_noop() {
            debug!(contact_id, "tags already reconciled");
            return Ok(update);
        }

        let mut fields = Map::new();
        fields.insert(
            "tags".to_string(),
            Value::Array(update.edit_tags().into_iter().map(Value::String).collect()),
        );
        self.crm.edit(contact_id, &fields).await?;
        Ok(update)
    }

    async fn first(&self, query: &str) -> Result<Option<ContactRecord>, CrmError> {
        let mut found = self.crm.find_list(query, 0, 1).await?;
        if found.is_empty() {
            return Ok(None);
        }
        Ok(Some(found.swap_remove(0)))
    }
}
