//! End-to-end tests for the pipeline and drain loop against the in-memory
//! CRM and queue.

use serde_json::{json, Value};
use std::sync::Arc;

use crate::catalog::ProductCatalog;
use crate::config::Settings;
use crate::crm::ContactRecord;
use crate::drain::{DrainReport, Drainer};
use crate::filters::Filters;
use crate::memory::{MemoryCrm, MemoryQueue};
use crate::pipeline::{validate, Outcome, Pipeline, Rejection};
use crate::queue::{Enqueued, Queue};
use crate::types::{EventType, WebhookPayload};

fn pipeline(crm: &Arc<MemoryCrm>) -> Pipeline {
    Pipeline::new(
        crm.clone(),
        Arc::new(ProductCatalog::builtin()),
        Arc::new(Filters::with_defaults()),
    )
}

fn webhook(id: u64, kind: &str, email: &str, premium: bool) -> Value {
    json!({
        "id": id.to_string(),
        "plugin_id": 8507,
        "type": kind,
        "objects": {
            "user": {
                "id": 5001,
                "email": email,
                "first": "Ada",
                "is_marketing_allowed": true,
                "gross": 49.0
            },
            "install": {"url": "https://shop.example.org", "is_premium": premium}
        }
    })
}

fn payload(value: Value) -> WebhookPayload {
    serde_json::from_value(value).unwrap()
}

fn tags(crm: &MemoryCrm, id: u64) -> Vec<String> {
    crm.contact(id).unwrap().tags
}

fn has(tags: &[String], tag: &str) -> bool {
    tags.iter().any(|t| t == tag)
}

// ============================================================
// Validation gate
// ============================================================

#[test]
fn test_validate_builds_event() {
    let catalog = ProductCatalog::builtin();
    let filters = Filters::with_defaults();
    let (event, product) = validate(
        &payload(webhook(1, "install.installed", "ada@example.com", true)),
        &filters,
        &catalog,
    )
    .unwrap();

    assert_eq!(product.slug, "kikote");
    assert_eq!(event.id.as_deref(), Some("1"));
    assert_eq!(event.plugin_id, "8507");
    assert_eq!(event.event_type, EventType::InstallInstalled);
    assert_eq!(event.email, "ada@example.com");
    assert_eq!(event.external_user_id.as_deref(), Some("5001"));
    assert!(event.is_premium);
    assert!(event.is_marketing_allowed);
}

#[test]
fn test_validate_order_first_failure_wins() {
    let catalog = ProductCatalog::builtin();
    let filters = Filters::with_defaults();
    let check = |value: Value| validate(&payload(value), &filters, &catalog).map(|_| ()).unwrap_err();

    assert_eq!(check(json!({"type": "install.installed"})), Rejection::NoUserData);
    assert_eq!(
        check(json!({"objects": {"user": {}}, "plugin_id": 8507})),
        Rejection::NoUserData
    );
    assert_eq!(
        check(json!({"objects": {"user": {"email": "plugins@soaringleads.com"}}})),
        Rejection::MissingPluginId
    );
    assert_eq!(
        check(json!({"plugin_id": 8507, "objects": {"user": {"first": "Ada"}}})),
        Rejection::MissingEmail
    );
    assert_eq!(
        check(json!({
            "plugin_id": 1,
            "objects": {"user": {"email": "plugins@soaringleads.com"},
                        "install": {"url": "site.wpengine.com"}}
        })),
        Rejection::ExcludedEmail
    );
    assert_eq!(
        check(json!({
            "plugin_id": 1,
            "objects": {"user": {"email": "ada@example.com"},
                        "install": {"url": "site.wpengine.com"}}
        })),
        Rejection::ExcludedDomain
    );
    assert_eq!(
        check(json!({"plugin_id": 1, "objects": {"user": {"email": "ada@example.com"}}})),
        Rejection::UnknownProduct("1".to_string())
    );
}

// ============================================================
// Routing scenarios
// ============================================================

#[tokio::test]
async fn test_install_creates_contact_with_free_tags_and_segment() {
    let crm = Arc::new(MemoryCrm::new());
    let pipeline = pipeline(&crm);

    let outcome = pipeline
        .process(&payload(webhook(1, "install.installed", "new@example.com", false)))
        .await;

    let id = outcome.contact_id().expect("contact id");
    assert_eq!(outcome.response_body(), json!(id));

    let contact = crm.contact(id).unwrap();
    assert!(has(&contact.tags, "kikote-free-user"));
    assert!(has(&contact.tags, "kikote-user"));
    assert!(has(&contact.tags, "kikote-installed"));
    assert!(!has(&contact.tags, "kikote-pro-user"));
    assert!(!has(&contact.tags, "kikote-uninstalled"));
    assert_eq!(contact.fields["email"], "new@example.com");
    assert_eq!(contact.fields["freemius_id"], 5001);
    assert_eq!(contact.fields["kikote_gross"], 49.0);
    assert_eq!(crm.segments_of(id), vec![2]);
}

#[tokio::test]
async fn test_license_activation_swaps_free_for_pro() {
    let crm = Arc::new(MemoryCrm::new());
    let pipeline = pipeline(&crm);

    let id = pipeline
        .process(&payload(webhook(1, "install.installed", "ada@example.com", false)))
        .await
        .contact_id()
        .unwrap();

    let outcome = pipeline
        .process(&payload(webhook(2, "license.activated", "ada@example.com", true)))
        .await;

    assert_eq!(outcome, Outcome::Applied { contact_id: id });
    let tags = tags(&crm, id);
    assert!(has(&tags, "kikote-pro-user"));
    assert!(!has(&tags, "kikote-free-user"));
    assert!(has(&tags, "kikote-installed"));
    assert!(has(&tags, "kikote-user"));
}

#[tokio::test]
async fn test_license_expiry_returns_to_free() {
    let crm = Arc::new(MemoryCrm::new());
    let pipeline = pipeline(&crm);
    let id = crm.insert(ContactRecord {
        id: 0,
        tags: vec!["kikote-pro-user".to_string(), "vip".to_string()],
        fields: json!({"email": "ada@example.com"}).as_object().unwrap().clone(),
    });

    let outcome = pipeline
        .process(&payload(webhook(3, "license.expired", "ada@example.com", false)))
        .await;

    assert_eq!(outcome, Outcome::Applied { contact_id: id });
    assert_eq!(tags(&crm, id), vec!["vip", "kikote-free-user"]);
}

#[tokio::test]
async fn test_excluded_email_makes_no_crm_call() {
    let crm = Arc::new(MemoryCrm::new());
    let pipeline = pipeline(&crm);

    let outcome = pipeline
        .process(&payload(webhook(
            1,
            "install.installed",
            "plugins@soaringleads.com",
            false,
        )))
        .await;

    assert_eq!(outcome, Outcome::Rejected(Rejection::ExcludedEmail));
    assert_eq!(outcome.contact_id(), None);
    assert_eq!(outcome.response_body(), json!("excluded email"));
    assert_eq!(crm.calls(), 0);
}

#[tokio::test]
async fn test_unrecognized_event_is_acknowledged_without_calls() {
    let crm = Arc::new(MemoryCrm::new());
    let pipeline = pipeline(&crm);

    let outcome = pipeline
        .process(&payload(webhook(1, "user.updated", "ada@example.com", false)))
        .await;

    assert_eq!(outcome, Outcome::Acknowledged);
    assert_eq!(outcome.response_body(), Value::Null);
    assert_eq!(crm.calls(), 0);
}

#[tokio::test]
async fn test_opted_out_new_user_is_not_created() {
    let crm = Arc::new(MemoryCrm::new());
    let pipeline = pipeline(&crm);
    let mut body = webhook(1, "install.installed", "quiet@example.com", false);
    body["objects"]["user"]["is_marketing_allowed"] = json!(false);

    let outcome = pipeline.process(&payload(body)).await;

    assert_eq!(outcome, Outcome::Rejected(Rejection::MarketingOptOut));
    assert!(crm.contacts().is_empty());
}

#[tokio::test]
async fn test_opted_out_existing_contact_still_gets_installed_tag() {
    let crm = Arc::new(MemoryCrm::new());
    let pipeline = pipeline(&crm);
    let id = crm.insert(ContactRecord {
        id: 0,
        tags: vec!["kikote-uninstalled".to_string()],
        fields: json!({"email": "quiet@example.com", "kikote_gross": 1})
            .as_object()
            .unwrap()
            .clone(),
    });
    let mut body = webhook(1, "install.installed", "quiet@example.com", false);
    body["objects"]["user"]["is_marketing_allowed"] = json!(0);

    let outcome = pipeline.process(&payload(body)).await;

    assert_eq!(outcome, Outcome::Applied { contact_id: id });
    let contact = crm.contact(id).unwrap();
    assert_eq!(contact.tags, vec!["kikote-installed"]);
    assert_eq!(contact.fields["kikote_gross"], 1);
    assert!(crm.segments_of(id).is_empty());
}

#[tokio::test]
async fn test_install_updates_existing_contact_instead_of_duplicating() {
    let crm = Arc::new(MemoryCrm::new());
    let pipeline = pipeline(&crm);
    let id = crm.insert(ContactRecord {
        id: 0,
        tags: vec!["newsletter".to_string()],
        fields: json!({"email": "ada@example.com"}).as_object().unwrap().clone(),
    });

    let outcome = pipeline
        .process(&payload(webhook(1, "install.installed", "ada@example.com", true)))
        .await;

    assert_eq!(outcome, Outcome::Applied { contact_id: id });
    assert_eq!(crm.contacts().len(), 1);
    let tags = tags(&crm, id);
    assert!(has(&tags, "newsletter"));
    assert!(has(&tags, "kikote-pro-user"));
    assert!(has(&tags, "kikote-installed"));
    assert_eq!(crm.segments_of(id), vec![2]);
}

#[tokio::test]
async fn test_external_id_preferred_over_changed_email() {
    let crm = Arc::new(MemoryCrm::new());
    let pipeline = pipeline(&crm);
    let original = crm.insert(ContactRecord {
        id: 0,
        tags: vec!["kikote-activated".to_string()],
        fields: json!({"email": "old@example.com", "freemius_id": 5001})
            .as_object()
            .unwrap()
            .clone(),
    });
    let other = crm.insert(ContactRecord {
        id: 0,
        tags: vec![],
        fields: json!({"email": "new@example.com"}).as_object().unwrap().clone(),
    });

    let outcome = pipeline
        .process(&payload(webhook(4, "install.deactivated", "new@example.com", false)))
        .await;

    assert_eq!(outcome, Outcome::Applied { contact_id: original });
    assert_eq!(tags(&crm, original), vec!["kikote-deactivated"]);
    assert!(tags(&crm, other).is_empty());
}

#[tokio::test]
async fn test_retag_unknown_contact_is_rejected() {
    let crm = Arc::new(MemoryCrm::new());
    let pipeline = pipeline(&crm);

    let outcome = pipeline
        .process(&payload(webhook(1, "install.activated", "ghost@example.com", false)))
        .await;

    assert_eq!(outcome, Outcome::Rejected(Rejection::UnknownContact));
    assert_eq!(outcome.response_body(), json!("contact not found"));
}

#[tokio::test]
async fn test_uninstall_clears_lifecycle_tags() {
    let crm = Arc::new(MemoryCrm::new());
    let pipeline = pipeline(&crm);
    let id = crm.insert(ContactRecord {
        id: 0,
        tags: vec![
            "kikote-installed".to_string(),
            "kikote-activated".to_string(),
            "kikote-user".to_string(),
        ],
        fields: json!({"email": "ada@example.com"}).as_object().unwrap().clone(),
    });

    pipeline
        .process(&payload(webhook(9, "install.uninstalled", "ada@example.com", false)))
        .await;

    assert_eq!(tags(&crm, id), vec!["kikote-user", "kikote-uninstalled"]);
}

#[tokio::test]
async fn test_crm_outage_is_a_retryable_failure() {
    let crm = Arc::new(MemoryCrm::new());
    crm.set_failing(true);
    let pipeline = pipeline(&crm);

    let outcome = pipeline
        .process(&payload(webhook(1, "install.installed", "ada@example.com", false)))
        .await;

    assert!(matches!(outcome, Outcome::Failed(_)));
    assert!(outcome.is_retryable());
    assert_eq!(outcome.response_body(), Value::Null);
}

// ============================================================
// Drain loop
// ============================================================

fn drainer(crm: &Arc<MemoryCrm>, max_attempts: u32) -> Drainer<MemoryQueue> {
    Drainer::new(MemoryQueue::new(), Arc::new(pipeline(crm)), max_attempts)
}

fn enqueue(drainer: &Drainer<MemoryQueue>, value: Value) -> Enqueued {
    drainer
        .queue()
        .enqueue(serde_json::to_vec(&value).unwrap().as_slice())
        .unwrap()
}

#[tokio::test]
async fn test_drain_empty_queue() {
    let crm = Arc::new(MemoryCrm::new());
    let drainer = drainer(&crm, 5);
    assert_eq!(drainer.drain_once().await.unwrap(), DrainReport::Empty);
}

#[tokio::test]
async fn test_drain_processes_by_key_not_arrival() {
    let crm = Arc::new(MemoryCrm::new());
    let drainer = drainer(&crm, 5);

    // The uninstall reaches the queue first but carries the later id.
    enqueue(&drainer, webhook(11, "install.uninstalled", "ada@example.com", false));
    enqueue(&drainer, webhook(10, "install.installed", "ada@example.com", false));

    let first = drainer.drain_once().await.unwrap();
    let second = drainer.drain_once().await.unwrap();

    let DrainReport::Processed { key, outcome } = &first else {
        panic!("expected processed, got {first:?}");
    };
    assert!(key.ends_with("10"));
    let id = outcome.contact_id().unwrap();
    assert!(matches!(second, DrainReport::Processed { .. }));

    let tags = tags(&crm, id);
    assert!(has(&tags, "kikote-uninstalled"));
    assert!(!has(&tags, "kikote-installed"));
    assert_eq!(drainer.drain_once().await.unwrap(), DrainReport::Empty);
}

#[tokio::test]
async fn test_drain_removes_rejected_items() {
    let crm = Arc::new(MemoryCrm::new());
    let drainer = drainer(&crm, 5);
    enqueue(
        &drainer,
        webhook(1, "install.installed", "plugins@soaringleads.com", false),
    );

    let report = drainer.drain_once().await.unwrap();

    assert_eq!(
        report.outcome(),
        Some(&Outcome::Rejected(Rejection::ExcludedEmail))
    );
    assert_eq!(drainer.queue().pending().unwrap(), 0);
    assert_eq!(crm.calls(), 0);
}

#[tokio::test]
async fn test_drain_keeps_failed_item_for_retry() {
    let crm = Arc::new(MemoryCrm::new());
    let drainer = drainer(&crm, 5);
    enqueue(&drainer, webhook(1, "install.installed", "ada@example.com", false));
    enqueue(&drainer, webhook(2, "install.activated", "ada@example.com", false));

    crm.set_failing(true);
    let report = drainer.drain_once().await.unwrap();
    assert!(matches!(report, DrainReport::Retained { attempts: 1, .. }));
    assert_eq!(drainer.queue().pending().unwrap(), 2);

    crm.set_failing(false);
    let report = drainer.drain_once().await.unwrap();
    let DrainReport::Processed { key, .. } = &report else {
        panic!("expected processed, got {report:?}");
    };
    assert!(key.ends_with('1'));
    assert_eq!(drainer.queue().pending().unwrap(), 1);
}

#[tokio::test]
async fn test_drain_dead_letters_after_max_attempts() {
    let crm = Arc::new(MemoryCrm::new());
    crm.set_failing(true);
    let drainer = drainer(&crm, 2);
    enqueue(&drainer, webhook(1, "install.installed", "ada@example.com", false));

    assert!(matches!(
        drainer.drain_once().await.unwrap(),
        DrainReport::Retained { attempts: 1, .. }
    ));
    assert!(matches!(
        drainer.drain_once().await.unwrap(),
        DrainReport::DeadLettered { .. }
    ));
    assert_eq!(drainer.queue().pending().unwrap(), 0);
    assert_eq!(drainer.queue().dead_letters().len(), 1);
}

#[tokio::test]
async fn test_default_settings_survive_crm_outage_in_order() {
    let settings = Settings::from_lookup(|key| match key {
        "MAUTIC_API_URL" => Some("https://crm.example.com".to_string()),
        "MAUTIC_API_USER" => Some("api".to_string()),
        "MAUTIC_API_PASSWORD" => Some("secret".to_string()),
        _ => None,
    })
    .unwrap();
    let crm = Arc::new(MemoryCrm::new());
    let drainer = drainer(&crm, settings.max_attempts);
    enqueue(&drainer, webhook(1, "install.installed", "ada@example.com", false));
    enqueue(&drainer, webhook(2, "license.activated", "ada@example.com", true));

    crm.set_failing(true);
    for _ in 0..25 {
        let report = drainer.drain_once().await.unwrap();
        assert!(matches!(report, DrainReport::Retained { .. }), "{report:?}");
    }
    assert_eq!(drainer.queue().pending().unwrap(), 2);
    assert!(drainer.queue().dead_letters().is_empty());

    crm.set_failing(false);
    let installed = drainer.drain_once().await.unwrap();
    let activated = drainer.drain_once().await.unwrap();

    let id = installed.outcome().and_then(Outcome::contact_id).unwrap();
    assert_eq!(activated.outcome(), Some(&Outcome::Applied { contact_id: id }));
    let tags = tags(&crm, id);
    assert!(has(&tags, "kikote-pro-user"));
    assert!(has(&tags, "kikote-installed"));
    assert_eq!(drainer.queue().pending().unwrap(), 0);
}

#[tokio::test]
async fn test_crm_refusal_is_dead_lettered_at_once() {
    let crm = Arc::new(MemoryCrm::new());
    crm.set_rejecting(Some(422));
    let drainer = drainer(&crm, 0);
    enqueue(&drainer, webhook(1, "install.installed", "ada@example.com", false));
    enqueue(&drainer, webhook(2, "install.installed", "bob@example.com", false));

    let report = drainer.drain_once().await.unwrap();

    assert!(matches!(report, DrainReport::DeadLettered { .. }), "{report:?}");
    assert_eq!(drainer.queue().dead_letters().len(), 1);
    assert_eq!(drainer.queue().pending().unwrap(), 1);
}

#[tokio::test]
async fn test_crm_refusal_is_not_retryable() {
    let crm = Arc::new(MemoryCrm::new());
    crm.set_rejecting(Some(400));
    let pipeline = pipeline(&crm);

    let outcome = pipeline
        .process(&payload(webhook(1, "install.installed", "ada@example.com", false)))
        .await;

    assert!(matches!(outcome, Outcome::Undeliverable(_)));
    assert!(!outcome.is_retryable());
    assert_eq!(outcome.response_body(), Value::Null);
}

#[tokio::test]
async fn test_drain_unlimited_attempts_never_dead_letters() {
    let crm = Arc::new(MemoryCrm::new());
    crm.set_failing(true);
    let drainer = drainer(&crm, 0);
    enqueue(&drainer, webhook(1, "install.installed", "ada@example.com", false));

    for expected in 1..=10 {
        let report = drainer.drain_once().await.unwrap();
        assert!(matches!(report, DrainReport::Retained { attempts, .. } if attempts == expected));
    }
    assert!(drainer.queue().dead_letters().is_empty());
}

#[tokio::test]
async fn test_drain_moves_corrupt_item_aside() {
    let crm = Arc::new(MemoryCrm::new());
    let drainer = drainer(&crm, 5);
    drainer.queue().insert_raw("00000000000000000001", b"{not json");
    enqueue(&drainer, webhook(2, "install.installed", "ada@example.com", false));

    assert!(matches!(
        drainer.drain_once().await.unwrap(),
        DrainReport::DeadLettered { .. }
    ));
    assert!(matches!(
        drainer.drain_once().await.unwrap(),
        DrainReport::Processed { .. }
    ));
}

#[tokio::test]
async fn test_drain_is_single_flight() {
    let crm = Arc::new(MemoryCrm::new());
    let drainer = drainer(&crm, 5);
    enqueue(&drainer, webhook(1, "install.installed", "ada@example.com", false));

    let lease = drainer.queue().try_lease().unwrap();
    assert!(lease.is_some());
    assert_eq!(drainer.drain_once().await.unwrap(), DrainReport::Busy);

    drop(lease);
    assert!(matches!(
        drainer.drain_once().await.unwrap(),
        DrainReport::Processed { .. }
    ));
}

#[test]
fn test_duplicate_enqueue_collapses() {
    let queue = MemoryQueue::new();
    let body = serde_json::to_vec(&webhook(7, "install.installed", "a@b.co", false)).unwrap();

    let first = queue.enqueue(&body).unwrap();
    let second = queue.enqueue(&body).unwrap();

    assert!(matches!(first, Enqueued::Stored(_)));
    assert_eq!(second, Enqueued::Duplicate(first.key().to_string()));
    assert_eq!(queue.pending().unwrap(), 1);
}

#[test]
fn test_enqueue_rejects_invalid_json() {
    let queue = MemoryQueue::new();
    assert!(queue.enqueue(b"nope").is_err());
    assert_eq!(queue.pending().unwrap(), 0);
}
