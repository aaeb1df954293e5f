//! Tests that hub state survives a restart through the state file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chathub_server::store::Store;
use chathub_server::{ServerState, server};
use common::*;
use serde_json::json;

pub mod common;

fn temp_state_path(tag: &str) -> PathBuf {
    std::env::temp_dir()
        .join(format!("chathub_it_{tag}_{:x}", rand::random::<u64>()))
        .join("state.json")
}

fn cleanup(path: &PathBuf) {
    if let Some(dir) = path.parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
}

#[tokio::test]
async fn test_state_survives_restart() -> Result<()> {
    logging();
    let path = temp_state_path("restart");

    let client = TestClient::start(server(Arc::new(ServerState::new(path.clone()).await?))).await?;
    let (mut ada, data) = client.register("ada").await?;
    let code = data["recoveryCode"].as_str().unwrap().to_string();

    ada.command(
        "send_message",
        json!({ "id": "m1", "senderId": "ada", "receiverId": "ada", "text": "note" }),
    )
    .await;
    // The flush completes before events go out, so by now the message is on
    // disk.
    ada.expect("message_sent").await?;
    ada.expect("new_message").await?;
    ada.expect("message_delivered").await?;
    drop(ada);

    // A fresh server over the same file sees everything.
    let client = TestClient::start(server(Arc::new(ServerState::new(path.clone()).await?))).await?;
    let (_ada, data) = client.login("ada").await?;
    assert_eq!(data["messages"]["ada:ada"][0]["text"], "note");
    assert_eq!(data["chats"]["ada"]["lastMessage"]["id"], "m1");

    let mut socket = client.connect().await?;
    socket.command("login_recovery", json!({ "recoveryCode": code })).await;
    socket.expect("login_success").await?;

    cleanup(&path);
    Ok(())
}

#[tokio::test]
async fn test_flushed_document_is_well_formed() -> Result<()> {
    logging();
    let path = temp_state_path("ondisk");

    let client = TestClient::start(server(Arc::new(ServerState::new(path.clone()).await?))).await?;
    let (mut ada, _) = client.register("ada").await?;
    ada.expect_idle().await?;

    let store = Store::new(path.clone()).await?;
    let doc = store.load().await;
    assert!(doc.users.contains_key("ada"));
    assert_eq!(doc.users["ada"].recovery_code.len(), 14);

    cleanup(&path);
    Ok(())
}

#[tokio::test]
async fn test_legacy_document_is_migrated_on_load() -> Result<()> {
    logging();
    let path = temp_state_path("legacy");
    std::fs::create_dir_all(path.parent().unwrap())?;
    // A document from an older build: map-form reactions, the `oderId`
    // spelling, a group without admins or unread counters.
    std::fs::write(
        &path,
        json!({
            "users": {
                "ada": { "id": "ada", "username": "ada" },
                "bob": { "id": "bob", "username": "bob" }
            },
            "messages": {
                "ada:bob": [{
                    "id": "m1", "chatId": "ada:bob", "senderId": "bob",
                    "receiverId": "ada", "text": "hi", "timestamp": 1,
                    "status": "seen",
                    "reactions": { "ada": "👍" }
                }, {
                    "id": "m2", "chatId": "ada:bob", "senderId": "ada",
                    "receiverId": "bob", "text": "yo", "timestamp": 2,
                    "status": "seen",
                    "reactions": [{ "oderId": "bob", "emoji": "❤" }]
                }]
            },
            "chats": {
                "ada": { "bob": { "lastMessageId": "m2", "unreadCount": 0, "updatedAt": 2 } },
                "bob": { "ada": { "lastMessageId": "m2", "unreadCount": 0, "updatedAt": 2 } }
            },
            "groups": {
                "g1": {
                    "id": "g1", "name": "old crew", "creatorId": "ada",
                    "memberIds": ["bob"]
                }
            }
        })
        .to_string(),
    )?;

    let client = TestClient::start(server(Arc::new(ServerState::new(path.clone()).await?))).await?;
    let (_ada, data) = client.login("ada").await?;

    let msgs = data["messages"]["ada:bob"].as_array().unwrap();
    assert_eq!(msgs[0]["reactions"], json!([{ "userId": "ada", "emoji": "👍" }]));
    assert_eq!(msgs[1]["reactions"], json!([{ "userId": "bob", "emoji": "❤" }]));

    let group = &data["groups"][0];
    assert_eq!(group["memberIds"], json!(["ada", "bob"]));
    assert_eq!(group["admins"], json!(["ada"]));
    assert_eq!(group["unreadCounts"], json!({ "ada": 0, "bob": 0 }));

    cleanup(&path);
    Ok(())
}
