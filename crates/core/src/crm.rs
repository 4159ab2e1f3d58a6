use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum CrmError {
    #[error("crm request failed: {0}")]
    Transport(String),
    #[error("crm returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected crm response: {0}")]
    Unexpected(String),
}

impl CrmError {
    /// Whether the same request may succeed later. Only 4xx answers that
    /// reject the request body are final; auth, missing records, conflicts
    /// and throttling can clear up on their own.
    pub fn is_transient(&self) -> bool {
        match self {
            CrmError::Transport(_) | CrmError::Unexpected(_) => true,
            CrmError::Status { status, .. } => {
                !(400..500).contains(status) || matches!(status, 401 | 403 | 404 | 408 | 409 | 429)
            }
        }
    }
}

/// A CRM contact as this service sees it. The CRM owns the record; this is a
/// snapshot taken for one reconciliation step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub id: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Field alias -> value.
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl ContactRecord {
    pub fn field_str(&self, alias: &str) -> Option<String> {
        self.fields.get(alias).and_then(crate::types::scalar_string)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub alias: String,
    #[serde(default)]
    pub label: String,
}

/// The marketing CRM's contact and segment API.
#[async_trait]
pub trait CrmClient: Send + Sync {
    /// Searches contacts; returns at most `limit` records starting at `start`.
    async fn find_list(
        &self,
        query: &str,
        start: u32,
        limit: u32,
    ) -> Result<Vec<ContactRecord>, CrmError>;

    async fn get(&self, id: u64) -> Result<Option<ContactRecord>, CrmError>;

    /// Returns the new contact's id when the CRM reports one.
    async fn create(&self, fields: &Map<String, Value>) -> Result<Option<u64>, CrmError>;

    async fn edit(&self, id: u64, fields: &Map<String, Value>) -> Result<Option<u64>, CrmError>;

    async fn add_to_segment(&self, segment_id: u64, contact_id: u64) -> Result<(), CrmError>;

    async fn field_list(&self) -> Result<Vec<FieldDescriptor>, CrmError>;
}
