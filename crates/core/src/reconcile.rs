//! Tag reconciliation: which tags an event adds and removes, and how that
//! delta lands on a contact's current tag list.

use std::collections::BTreeSet;

use crate::catalog::{ProductConfig, ProductTags};
use crate::types::EventType;

/// Tags to add and remove for one reconciliation step. The sets are always
/// disjoint; a tag requested in both is kept in `to_add` only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDelta {
    to_add: BTreeSet<String>,
    to_remove: BTreeSet<String>,
}

impl TagDelta {
    pub fn new<A, R>(add: A, remove: R) -> Self
    where
        A: IntoIterator<Item = String>,
        R: IntoIterator<Item = String>,
    {
        let to_add: BTreeSet<String> = add.into_iter().collect();
        let to_remove = remove
            .into_iter()
            .filter(|tag| !to_add.contains(tag))
            .collect();
        Self { to_add, to_remove }
    }

    pub fn to_add(&self) -> &BTreeSet<String> {
        &self.to_add
    }

    pub fn to_remove(&self) -> &BTreeSet<String> {
        &self.to_remove
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// What the pipeline does for an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Create or update the contact carrying `base_tags`, then apply `delta`.
    Upsert { base_tags: Vec<String>, delta: TagDelta },
    /// Apply `delta` to an existing contact.
    Retag(TagDelta),
    Ignore,
}

/// Tags set directly on a contact when an install is first reported.
pub fn base_tags(tags: &ProductTags, is_premium: bool) -> Vec<String> {
    let tier = if is_premium { &tags.premium } else { &tags.free };
    let mut seen = BTreeSet::new();
    tier.iter()
        .chain(tags.misc.iter())
        .filter(|tag| seen.insert(tag.to_string()))
        .cloned()
        .collect()
}

/// Lifecycle delta for an event. `None` for event types this service does
/// not act on.
pub fn compute_delta(
    event: &EventType,
    product: &ProductConfig,
    _is_premium: bool,
) -> Option<TagDelta> {
    let tags = &product.tags;
    let delta = match event {
        EventType::InstallInstalled => {
            TagDelta::new([product.installed_tag()], [product.uninstalled_tag()])
        }
        EventType::LicenseActivated => {
            TagDelta::new(tags.premium.iter().cloned(), tags.free.iter().cloned())
        }
        EventType::LicenseDeactivated | EventType::LicenseExpired => {
            TagDelta::new(tags.free.iter().cloned(), tags.premium.iter().cloned())
        }
        EventType::InstallActivated => {
            TagDelta::new([product.activated_tag()], [product.deactivated_tag()])
        }
        EventType::InstallDeactivated => {
            TagDelta::new([product.deactivated_tag()], [product.activated_tag()])
        }
        EventType::InstallUninstalled => TagDelta::new(
            [product.uninstalled_tag()],
            [
                product.installed_tag(),
                product.activated_tag(),
                product.deactivated_tag(),
            ],
        ),
        EventType::Other(_) => return None,
    };
    Some(delta)
}

pub fn route(event: &EventType, product: &ProductConfig, is_premium: bool) -> Action {
    match compute_delta(event, product, is_premium) {
        Some(delta) if *event == EventType::InstallInstalled => Action::Upsert {
            base_tags: base_tags(&product.tags, is_premium),
            delta,
        },
        Some(delta) => Action::Retag(delta),
        None => Action::Ignore,
    }
}

/// Result of applying a delta to a contact's current tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagUpdate {
    /// Tag list after the update, CRM-side tags preserved in their order.
    pub tags: Vec<String>,
    /// Tags from the delta that were present and are now gone.
    pub removed: Vec<String>,
    /// Tags from the delta that were absent and are now present.
    pub added: Vec<String>,
}

impl TagUpdate {
    pub fn is_noop(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }

    /// Tag list for the CRM edit call; a leading `-` asks the CRM to detach
    /// that tag.
    pub fn edit_tags(&self) -> Vec<String> {
        self.tags
            .iter()
            .cloned()
            .chain(self.removed.iter().map(|tag| format!("-{tag}")))
            .collect()
    }
}

pub fn reconcile(current: &[String], delta: &TagDelta) -> TagUpdate {
    let mut tags: Vec<String> = Vec::with_capacity(current.len() + delta.to_add.len());
    let mut removed = Vec::new();

    for tag in current {
        if tags.contains(tag) {
            continue;
        }
        if delta.to_remove.contains(tag) {
            if !removed.contains(tag) {
                removed.push(tag.clone());
            }
            continue;
        }
        tags.push(tag.clone());
    }

    let mut added = Vec::new();
    for tag in &delta.to_add {
        if !tags.contains(tag) {
            tags.push(tag.clone());
            added.push(tag.clone());
        }
    }

    TagUpdate {
        tags,
        removed,
        added,
    }
}
