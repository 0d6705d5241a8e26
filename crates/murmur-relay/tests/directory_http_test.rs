use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use murmur_relay::{resolve_assignment, DirectoryError, HttpVoiceDirectory, VoiceDirectory};
use murmur_types::VoiceAssignment;
use serde_json::json;

async fn voice(Path(identity): Path<String>) -> Response {
    match identity.as_str() {
        "alice" => Json(json!({ "voiceId": "v-alice", "displayName": "Nova" })).into_response(),
        "nameless" => Json(json!({ "voiceId": "v-anon" })).into_response(),
        "unset" => Json(json!({ "voiceId": null })).into_response(),
        "broken" => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        "garbled" => "not json".into_response(),
        "bob" => Json(json!({ "voiceId": "v-bob" })).into_response(),
        "bob#1" => Json(json!({ "voiceId": "v-bob-1" })).into_response(),
        "team/alice" => Json(json!({ "voiceId": "v-team-alice" })).into_response(),
        "carol?x" => Json(json!({ "voiceId": "v-carol-x" })).into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn directory() -> HttpVoiceDirectory {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/voices/{identity}", get(voice));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    HttpVoiceDirectory::new(format!("http://{}/", addr)).unwrap()
}

#[tokio::test]
async fn known_identity_resolves() {
    let directory = directory().await;
    assert_eq!(
        directory.lookup("alice").await.unwrap(),
        Some(VoiceAssignment::new("v-alice", "Nova"))
    );
}

#[tokio::test]
async fn missing_display_name_falls_back_to_voice_id() {
    let directory = directory().await;
    assert_eq!(
        directory.lookup("nameless").await.unwrap(),
        Some(VoiceAssignment::new("v-anon", "v-anon"))
    );
}

#[tokio::test]
async fn unknown_or_unset_identity_has_no_preference() {
    let directory = directory().await;
    assert_eq!(directory.lookup("zed").await.unwrap(), None);
    assert_eq!(directory.lookup("unset").await.unwrap(), None);
}

#[tokio::test]
async fn service_errors_are_classified() {
    let directory = directory().await;
    assert!(matches!(
        directory.lookup("broken").await,
        Err(DirectoryError::Unavailable(_))
    ));
    assert!(matches!(
        directory.lookup("garbled").await,
        Err(DirectoryError::Malformed(_))
    ));
}

#[tokio::test]
async fn failures_resolve_to_the_default_voice() {
    let directory = directory().await;
    let default = VoiceAssignment::default();
    assert_eq!(
        resolve_assignment(&directory, "broken", &default).await,
        default
    );
    assert_eq!(
        resolve_assignment(&directory, "alice", &default)
            .await
            .voice_id,
        "v-alice"
    );
}

#[tokio::test]
async fn reserved_characters_in_identity_reach_their_own_record() {
    let directory = directory().await;
    assert_eq!(
        directory.lookup("bob#1").await.unwrap().unwrap().voice_id,
        "v-bob-1"
    );
    assert_eq!(
        directory.lookup("team/alice").await.unwrap().unwrap().voice_id,
        "v-team-alice"
    );
    assert_eq!(
        directory.lookup("carol?x").await.unwrap().unwrap().voice_id,
        "v-carol-x"
    );
    assert_eq!(directory.lookup("bob").await.unwrap().unwrap().voice_id, "v-bob");
}
