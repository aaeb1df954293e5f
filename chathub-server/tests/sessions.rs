//! Session lifecycle: registration, login, presence, recovery codes.

use std::sync::Arc;

use anyhow::Result;
use chathub_server::{ServerState, server};
use common::*;
use serde_json::json;

pub mod common;

#[tokio::test]
async fn test_register_snapshot() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let (mut socket, data) = client.register("ada").await?;
    assert_eq!(data["user"]["id"], "ada");
    assert_eq!(data["user"]["username"], "ada");
    assert_eq!(data["onlineUserIds"], json!(["ada"]));

    // The owner gets their recovery code, in the dashed format.
    let code = data["recoveryCode"].as_str().expect("recovery code");
    assert_eq!(code.len(), 14);
    assert_eq!(code.split('-').count(), 3);

    // The directory never carries recovery codes.
    for user in data["users"].as_array().unwrap() {
        assert!(user.get("recoveryCode").is_none());
    }

    socket.expect_idle().await?;

    let health = client.health().await?;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["users"], 1);
    assert_eq!(health["online"], 1);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_username_is_refused() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let (mut ada, _) = client.register("ada").await?;

    let mut socket = client.connect().await?;
    socket
        .command("register", json!({ "id": "ada2", "username": "ADA" }))
        .await;
    let data = socket.expect("register_error").await?;
    assert_eq!(data["error"], "username_taken");

    // The first session saw no membership change.
    ada.expect_idle().await?;
    Ok(())
}

#[tokio::test]
async fn test_presence_edges() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let (mut ada, _) = client.register("ada").await?;
    let (bob, _) = client.register("bob").await?;

    let data = ada.expect("user_joined").await?;
    assert_eq!(data["user"]["id"], "bob");
    let data = ada.expect("user_online").await?;
    assert_eq!(data["userId"], "bob");
    assert_eq!(data["onlineUserIds"], json!(["ada", "bob"]));

    drop(bob);
    let data = ada.expect("user_offline").await?;
    assert_eq!(data["userId"], "bob");
    assert!(data["lastSeen"].as_u64().is_some());
    assert_eq!(data["onlineUserIds"], json!(["ada"]));

    let (_bob, data) = client.login("bob").await?;
    assert_eq!(data["user"]["id"], "bob");
    assert!(data.get("recoveryCode").is_none());
    let data = ada.expect("user_online").await?;
    assert_eq!(data["userId"], "bob");
    Ok(())
}

#[tokio::test]
async fn test_login_unknown_user() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut socket = client.connect().await?;
    socket.command("login", json!({ "userId": "nobody" })).await;
    let data = socket.expect("login_error").await?;
    assert_eq!(data["error"], "user_not_found");
    Ok(())
}

#[tokio::test]
async fn test_recovery_login_survives_profile_updates() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let (socket, data) = client.register("ada").await?;
    let code = data["recoveryCode"].as_str().unwrap().to_string();
    drop(socket);

    // Dashes and case are ignored on input.
    let mut socket = client.connect().await?;
    socket
        .command(
            "login_recovery",
            json!({ "recoveryCode": code.replace('-', "").to_lowercase() }),
        )
        .await;
    let data = socket.expect("login_success").await?;
    assert_eq!(data["user"]["id"], "ada");

    socket
        .command(
            "update_profile",
            json!({ "userId": "ada", "displayName": "Countess", "bio": "analytical" }),
        )
        .await;
    let data = socket.expect("profile_updated").await?;
    assert_eq!(data["user"]["displayName"], "Countess");
    drop(socket);

    // The code is unchanged after the profile update.
    let mut socket = client.connect().await?;
    socket.command("login_recovery", json!({ "recoveryCode": code })).await;
    socket.expect("login_success").await?;

    let mut socket = client.connect().await?;
    socket
        .command("login_recovery", json!({ "recoveryCode": "AAAA-AAAA-AAAA" }))
        .await;
    let data = socket.expect("login_error").await?;
    assert_eq!(data["error"], "invalid_recovery_code");
    Ok(())
}

#[tokio::test]
async fn test_check_username_before_binding() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut socket = client.connect().await?;
    socket.command("check_username", json!({ "username": "ada" })).await;
    let data = socket.expect("username_check_result").await?;
    assert_eq!(data["available"], true);

    client.register("ada").await?;

    socket.command("check_username", json!({ "username": "Ada" })).await;
    let data = socket.expect("username_check_result").await?;
    assert_eq!(data["available"], false);
    Ok(())
}

#[tokio::test]
async fn test_identity_commands_are_dropped_before_binding() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;
    let (mut ada, _) = client.register("ada").await?;

    let mut socket = client.connect().await?;
    socket
        .command(
            "send_message",
            json!({ "id": "m1", "senderId": "ada", "receiverId": "ada", "text": "spoof" }),
        )
        .await;
    socket.expect_idle().await?;
    ada.expect_idle().await?;
    Ok(())
}
