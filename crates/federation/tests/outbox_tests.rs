//! Outbox integration tests.

#![allow(clippy::unwrap_used)]

mod support;

use axum::http::{StatusCode, header};
use axum::response::Response;
use outpost_federation::PUBLIC;
use serde_json::{Value, json};
use support::{Harness, LOCAL, REMOTE, body_json, remote_actor, url};

const OUTBOX: &str = "/users/alice/outbox";

fn location(response: &Response) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

fn actor_inbox(name: &str) -> String {
    format!("{REMOTE}/users/{name}/inbox")
}

fn actor_iri(name: &str) -> String {
    format!("{REMOTE}/users/{name}")
}

fn sorted(mut values: Vec<String>) -> Vec<String> {
    values.sort();
    values
}

/// Post a bare note and return the id of the note that was stored.
async fn publish(harness: &Harness, note: Value) -> String {
    let response = harness.post(OUTBOX, &note).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let create = harness.stored(&url(&location(&response))).unwrap();
    create.ids("object")[0].to_string()
}

#[tokio::test]
async fn test_bare_object_is_wrapped_in_create() {
    let harness = Harness::new();
    harness.transport.serve(remote_actor("bob", None));
    harness.transport.serve(remote_actor("carol", None));

    let note = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Note",
        "content": "hello",
        "to": actor_iri("bob"),
        "bcc": actor_iri("carol"),
    });
    let response = harness.post(OUTBOX, &note).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let create_id = location(&response);
    assert!(create_id.starts_with(LOCAL));
    let create = harness.stored(&url(&create_id)).unwrap();
    assert!(create.is_type("Create"));
    assert_eq!(create.ids("actor"), vec![harness.alice.clone()]);
    assert!(create.contains("@context"));
    assert_eq!(harness.item_ids("outbox"), vec![create_id.clone()]);

    let note_id = create.ids("object")[0].clone();
    assert!(note_id.as_str().starts_with(LOCAL));
    let stored = harness.stored(&note_id).unwrap();
    assert_eq!(stored.ids("attributedTo"), vec![harness.alice.clone()]);
    assert!(!stored.contains("@context"));

    assert_eq!(
        sorted(harness.transport.delivered_to()),
        vec![actor_inbox("bob"), actor_inbox("carol")]
    );
    for (_, payload) in harness.transport.deliveries() {
        assert_eq!(payload["id"], create_id.as_str());
        assert!(payload.get("bcc").is_none());
        assert!(payload["object"].get("bcc").is_none());
    }
}

#[tokio::test]
async fn test_recipients_are_deduplicated() {
    let harness = Harness::new();
    harness.transport.serve(remote_actor("bob", None));
    harness.transport.serve(remote_actor("carol", None));
    harness.fill("followers", &[&actor_iri("bob"), &actor_iri("carol")]);

    let followers = harness.alice_iri("followers");
    let create = json!({
        "type": "Create",
        "actor": harness.alice.as_str(),
        "to": [actor_iri("bob"), followers.as_str(), harness.alice.as_str()],
        "cc": [actor_iri("bob"), PUBLIC],
        "audience": actor_iri("bob"),
        "object": {"type": "Note", "content": "hi"},
    });
    assert_eq!(
        harness.post(OUTBOX, &create).await.status(),
        StatusCode::CREATED
    );

    assert_eq!(
        sorted(harness.transport.delivered_to()),
        vec![actor_inbox("bob"), actor_inbox("carol")]
    );
}

fn nested_collections(harness: &Harness) {
    harness.transport.serve(remote_actor("carol", None));
    for (id, member) in [
        ("outer", format!("{REMOTE}/collections/inner")),
        ("inner", actor_iri("carol")),
    ] {
        harness.transport.serve(
            outpost_federation::ApObject::from_value(json!({
                "id": format!("{REMOTE}/collections/{id}"),
                "type": "Collection",
                "items": [member],
            }))
            .unwrap(),
        );
    }
}

fn note_to_outer(harness: &Harness) -> Value {
    json!({
        "type": "Create",
        "actor": harness.alice.as_str(),
        "to": format!("{REMOTE}/collections/outer"),
        "object": {"type": "Note", "content": "deep"},
    })
}

#[tokio::test]
async fn test_delivery_depth_limits_nested_collections() {
    let harness = Harness::with(|protocol| protocol.delivery_depth = 2);
    nested_collections(&harness);

    let response = harness.post(OUTBOX, &note_to_outer(&harness)).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(harness.transport.deliveries().is_empty());
}

#[tokio::test]
async fn test_unlimited_delivery_depth_expands_everything() {
    let harness = Harness::with(|protocol| protocol.delivery_depth = 0);
    nested_collections(&harness);

    let response = harness.post(OUTBOX, &note_to_outer(&harness)).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(harness.transport.delivered_to(), vec![actor_inbox("carol")]);
}

#[tokio::test]
async fn test_block_stays_local() {
    let harness = Harness::new();
    harness.transport.serve(remote_actor("bob", None));

    let block = json!({
        "type": "Block",
        "actor": harness.alice.as_str(),
        "object": actor_iri("bob"),
        "to": actor_iri("bob"),
    });
    let response = harness.post(OUTBOX, &block).await;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(harness.item_ids("outbox"), vec![location(&response)]);
    assert!(harness.transport.deliveries().is_empty());
}

#[tokio::test]
async fn test_like_is_recorded_in_liked() {
    let harness = Harness::new();
    harness.transport.serve(remote_actor("bob", None));

    let like = json!({
        "type": "Like",
        "actor": harness.alice.as_str(),
        "object": format!("{REMOTE}/notes/1"),
        "to": actor_iri("bob"),
    });
    assert_eq!(harness.post(OUTBOX, &like).await.status(), StatusCode::CREATED);

    assert_eq!(harness.item_ids("liked"), vec![format!("{REMOTE}/notes/1")]);
    assert_eq!(harness.transport.delivered_to(), vec![actor_inbox("bob")]);
}

#[tokio::test]
async fn test_update_patches_stored_object() {
    let harness = Harness::new();
    let note_id = publish(
        &harness,
        json!({"type": "Note", "content": "draft", "summary": "cw"}),
    )
    .await;

    let update = json!({
        "type": "Update",
        "actor": harness.alice.as_str(),
        "object": {"id": note_id.as_str(), "content": "final", "summary": null},
    });
    assert_eq!(harness.post(OUTBOX, &update).await.status(), StatusCode::CREATED);

    let stored = harness.stored(&url(&note_id)).unwrap();
    assert_eq!(stored.get("content"), Some(&json!("final")));
    assert!(!stored.contains("summary"));
    assert!(stored.is_type("Note"));
}

#[tokio::test]
async fn test_delete_leaves_tombstone() {
    let harness = Harness::new();
    let note_id = publish(
        &harness,
        json!({"type": "Note", "content": "oops", "published": "2026-02-01T00:00:00Z"}),
    )
    .await;

    let delete = json!({
        "type": "Delete",
        "actor": harness.alice.as_str(),
        "object": note_id.as_str(),
    });
    assert_eq!(harness.post(OUTBOX, &delete).await.status(), StatusCode::CREATED);

    let tombstone = harness.stored(&url(&note_id)).unwrap();
    assert!(tombstone.is_type("Tombstone"));
    assert_eq!(tombstone.get("formerType"), Some(&json!("Note")));
    assert_eq!(tombstone.get("published"), Some(&json!("2026-02-01T00:00:00Z")));
    assert_eq!(tombstone.get("deleted"), Some(&json!("2026-03-01T12:00:00Z")));
    assert!(!tombstone.contains("content"));
}

#[tokio::test]
async fn test_get_outbox_lists_posted_activities() {
    let harness = Harness::new();
    let response = harness
        .post(OUTBOX, &json!({"type": "Note", "content": "one"}))
        .await;
    let create_id = location(&response);

    let response = harness.get(OUTBOX).await;
    assert_eq!(response.status(), StatusCode::OK);
    let page = body_json(response).await;
    assert_eq!(page["orderedItems"], json!([create_id]));
}
