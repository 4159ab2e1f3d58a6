//! Validation, routing and CRM application for one webhook event.

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::{CatalogError, FieldSource, ProductCatalog, ProductConfig};
use crate::config::Settings;
use crate::contacts::Contacts;
use crate::crm::{ContactRecord, CrmClient, CrmError};
use crate::filters::Filters;
use crate::reconcile::{route, Action, TagDelta};
use crate::types::{scalar_string, truthy, EventType, WebhookEvent, WebhookPayload};

/// Why an event was intentionally skipped. Rejections are not failures: the
/// queue item is removed and nothing is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    NoUserData,
    MissingPluginId,
    MissingEmail,
    ExcludedEmail,
    ExcludedDomain,
    UnknownProduct(String),
    MarketingOptOut,
    UnknownContact,
}

impl Rejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::NoUserData => "no user data",
            Rejection::MissingPluginId => "plugin id empty",
            Rejection::MissingEmail => "missing email",
            Rejection::ExcludedEmail => "excluded email",
            Rejection::ExcludedDomain => "development domain",
            Rejection::UnknownProduct(_) => "product id not found",
            Rejection::MarketingOptOut => "marketing not allowed",
            Rejection::UnknownContact => "contact not found",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Applied { contact_id: u64 },
    /// Valid event with nothing to do for it.
    Acknowledged,
    Rejected(Rejection),
    /// A CRM call failed; the event may succeed if retried.
    Failed(String),
    /// The CRM refused the request itself; retrying cannot help.
    Undeliverable(String),
}

impl Outcome {
    pub fn contact_id(&self) -> Option<u64> {
        match self {
            Outcome::Applied { contact_id } => Some(*contact_id),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    /// Body returned to the webhook sender: the contact id, `null`, or the
    /// rejection reason.
    pub fn response_body(&self) -> Value {
        match self {
            Outcome::Applied { contact_id } => Value::from(*contact_id),
            Outcome::Rejected(rejection) => Value::from(rejection.reason()),
            Outcome::Acknowledged | Outcome::Failed(_) | Outcome::Undeliverable(_) => Value::Null,
        }
    }
}

impl From<CrmError> for Outcome {
    fn from(err: CrmError) -> Self {
        if err.is_transient() {
            Outcome::Failed(err.to_string())
        } else {
            Outcome::Undeliverable(err.to_string())
        }
    }
}

/// Runs the validation gate. Checks are ordered; the first failure wins.
pub fn validate<'a>(
    payload: &WebhookPayload,
    filters: &Filters,
    catalog: &'a ProductCatalog,
) -> Result<(WebhookEvent, &'a ProductConfig), Rejection> {
    let user = match &payload.objects.user {
        Some(Value::Object(user)) if !user.is_empty() => user.clone(),
        _ => return Err(Rejection::NoUserData),
    };

    let plugin_id = payload.plugin_id().ok_or(Rejection::MissingPluginId)?;

    let email = user
        .get("email")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|email| !email.is_empty())
        .ok_or(Rejection::MissingEmail)?
        .to_string();
    if filters.is_excluded_email(&email) {
        return Err(Rejection::ExcludedEmail);
    }

    let install = match &payload.objects.install {
        Some(Value::Object(install)) => install.clone(),
        _ => Map::new(),
    };
    let url = install.get("url").and_then(Value::as_str).unwrap_or_default();
    if filters.is_excluded_domain(url) {
        return Err(Rejection::ExcludedDomain);
    }

    let product = catalog
        .resolve(&plugin_id)
        .ok_or_else(|| Rejection::UnknownProduct(plugin_id.clone()))?;

    let event = WebhookEvent {
        id: payload.event_id(),
        event_type: EventType::parse(payload.event_type.as_deref().unwrap_or_default()),
        external_user_id: user.get("id").and_then(scalar_string),
        is_premium: install.get("is_premium").map(truthy).unwrap_or(false),
        is_marketing_allowed: user.get("is_marketing_allowed").map(truthy).unwrap_or(false),
        plugin_id,
        email,
        user,
        install,
    };
    Ok((event, product))
}

/// CRM fields for a product, taken from the event's user object.
pub fn map_fields(event: &WebhookEvent, product: &ProductConfig) -> Map<String, Value> {
    let mut fields = Map::new();
    for (crm_field, source) in &product.fields {
        match source {
            FieldSource::Source(key) => match event.user.get(key) {
                Some(value) if !value.is_null() => {
                    fields.insert(crm_field.clone(), value.clone());
                }
                _ => debug!(crm_field, source = %key, "mapped source field absent"),
            },
            FieldSource::Constant(value) => {
                fields.insert(crm_field.clone(), value.clone());
            }
        }
    }
    fields
}

pub struct Pipeline {
    contacts: Contacts,
    catalog: Arc<ProductCatalog>,
    filters: Arc<Filters>,
}

impl Pipeline {
    pub fn new(
        crm: Arc<dyn CrmClient>,
        catalog: Arc<ProductCatalog>,
        filters: Arc<Filters>,
    ) -> Self {
        Self {
            contacts: Contacts::new(crm),
            catalog,
            filters,
        }
    }

    /// Loads the product catalog named by the settings (or the built-in one)
    /// and the configured exclusion lists.
    pub fn from_settings(settings: &Settings, crm: Arc<dyn CrmClient>) -> Result<Self, CatalogError> {
        let catalog = match &settings.products_path {
            Some(path) => ProductCatalog::load(path)?,
            None => ProductCatalog::builtin(),
        };
        info!(products = catalog.len(), "product catalog loaded");
        let filters = Filters::new(
            settings.excluded_emails.iter().cloned(),
            settings.excluded_domains.iter().cloned(),
        );
        Ok(Self::new(crm, Arc::new(catalog), Arc::new(filters)))
    }

    pub fn catalog(&self) -> &ProductCatalog {
        &self.catalog
    }

    pub fn contacts(&self) -> &Contacts {
        &self.contacts
    }

    #[instrument(skip_all, fields(event_id = ?payload.event_id(), event_type = ?payload.event_type))]
    pub async fn process(&self, payload: &WebhookPayload) -> Outcome {
        let (event, product) = match validate(payload, &self.filters, &self.catalog) {
            Ok(validated) => validated,
            Err(rejection) => {
                match &rejection {
                    Rejection::UnknownProduct(plugin_id) => {
                        error!(%plugin_id, "no product configured for plugin id")
                    }
                    other => info!(reason = other.reason(), "webhook rejected"),
                }
                return Outcome::Rejected(rejection);
            }
        };

        let outcome = match route(&event.event_type, product, event.is_premium) {
            Action::Ignore => {
                debug!("event type not handled");
                Outcome::Acknowledged
            }
            Action::Upsert { base_tags, delta } => {
                self.install(&event, product, base_tags, &delta).await
            }
            Action::Retag(delta) => self.retag(&event, product, &delta).await,
        };

        match &outcome {
            Outcome::Applied { contact_id } => info!(contact_id, product = %product.slug, "contact synced"),
            Outcome::Failed(err) | Outcome::Undeliverable(err) => {
                let payload = Value::Object(event.user.clone());
                error!(
                    error = %err,
                    retryable = outcome.is_retryable(),
                    email = %event.email,
                    plugin_id = %event.plugin_id,
                    payload = %payload,
                    "crm sync failed"
                )
            }
            Outcome::Rejected(rejection) => info!(reason = rejection.reason(), "webhook rejected"),
            Outcome::Acknowledged => {}
        }
        outcome
    }

    async fn install(
        &self,
        event: &WebhookEvent,
        product: &ProductConfig,
        base_tags: Vec<String>,
        delta: &TagDelta,
    ) -> Outcome {
        let existing = match self.find_contact(event, product).await {
            Ok(existing) => existing,
            Err(err) => return err.into(),
        };

        if !event.is_marketing_allowed {
            // Only opted-in users get a contact; known contacts still get the
            // lifecycle tags.
            return match existing {
                Some(contact) => self.tag(contact.id, delta).await,
                None => Outcome::Rejected(Rejection::MarketingOptOut),
            };
        }

        let mut fields = map_fields(event, product);
        fields.insert(
            "tags".to_string(),
            Value::Array(base_tags.into_iter().map(Value::String).collect()),
        );

        let written = match &existing {
            Some(contact) => self.contacts.update(contact.id, &fields).await,
            None => {
                fields.insert("email".to_string(), Value::String(event.email.clone()));
                self.contacts.create(&fields).await
            }
        };
        let contact_id = match written {
            Ok(Some(id)) => id,
            Ok(None) => {
                return Outcome::Failed("crm response did not contain a contact id".to_string())
            }
            Err(err) => return err.into(),
        };

        if let Err(err) = self
            .contacts
            .add_to_segments(&product.segments, contact_id)
            .await
        {
            return err.into();
        }

        self.tag(contact_id, delta).await
    }

    async fn retag(&self, event: &WebhookEvent, product: &ProductConfig, delta: &TagDelta) -> Outcome {
        match self.find_contact(event, product).await {
            Ok(Some(contact)) => self.tag(contact.id, delta).await,
            Ok(None) => Outcome::Rejected(Rejection::UnknownContact),
            Err(err) => err.into(),
        }
    }

    async fn tag(&self, contact_id: u64, delta: &TagDelta) -> Outcome {
        match self.contacts.apply_tags(contact_id, delta).await {
            Ok(update) => {
                debug!(contact_id, added = ?update.added, removed = ?update.removed, "tags reconciled");
                Outcome::Applied { contact_id }
            }
            Err(err) => err.into(),
        }
    }

    async fn find_contact(
        &self,
        event: &WebhookEvent,
        product: &ProductConfig,
    ) -> Result<Option<ContactRecord>, CrmError> {
        let external = match (product.external_id_field(), event.external_user_id.as_deref()) {
            (Some(field), Some(id)) => Some((field, id)),
            _ => None,
        };
        let found = self.contacts.resolve(&event.email, external).await;
        if let Err(err) = &found {
            warn!(error = %err, email = %event.email, "contact lookup failed");
        }
        found
    }
}
