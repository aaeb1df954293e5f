//! Group flows over real sockets: membership, messages, unread, deletion.

use std::sync::Arc;

use anyhow::Result;
use chathub_server::{ServerState, server};
use common::*;
use serde_json::json;

pub mod common;

#[tokio::test]
async fn test_group_message_lifecycle() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut sockets = client.register_all(&["carol", "dave", "erin"]).await?;
    let mut erin = sockets.pop().unwrap();
    let mut dave = sockets.pop().unwrap();
    let mut carol = sockets.pop().unwrap();

    carol
        .command(
            "create_group",
            json!({ "id": "g1", "name": "crew", "memberIds": ["dave", "erin"] }),
        )
        .await;
    let data = carol.expect("group_created").await?;
    assert_eq!(data["group"]["creatorId"], "carol");
    assert_eq!(data["group"]["memberIds"], json!(["carol", "dave", "erin"]));
    assert_eq!(data["group"]["admins"], json!(["carol"]));
    dave.expect("group_created").await?;
    erin.expect("group_created").await?;

    // Erin goes offline before Dave writes.
    drop(erin);
    carol.expect("user_offline").await?;
    dave.expect("user_offline").await?;

    dave.command(
        "send_group_message",
        json!({ "id": "gm1", "groupId": "g1", "senderId": "dave", "text": "yo" }),
    )
    .await;
    let data = dave.expect("group_message_sent").await?;
    assert_eq!(data["message"]["seenBy"], json!(["dave"]));
    let data = carol.expect("new_group_message").await?;
    assert_eq!(data["message"]["id"], "gm1");
    assert_eq!(data["group"]["unreadCounts"]["carol"], 1);
    assert_eq!(data["group"]["unreadCounts"]["dave"], 0);

    // Erin comes back and finds the backlog with her unread counter.
    let (mut erin, data) = client.login("erin").await?;
    assert_eq!(data["groupMessages"]["g1"][0]["id"], "gm1");
    assert_eq!(data["groups"][0]["unreadCounts"]["erin"], 1);
    carol.expect("user_online").await?;
    dave.expect("user_online").await?;

    // The creator deletes Dave's message for everyone.
    carol
        .command(
            "delete_group_message",
            json!({ "groupId": "g1", "messageIds": ["gm1"] }),
        )
        .await;
    for socket in [&mut carol, &mut dave, &mut erin] {
        let data = socket.expect("group_message_deleted").await?;
        assert_eq!(data["messageIds"], json!(["gm1"]));
        assert_eq!(data["pinnedMessageIds"], json!([]));
    }

    let (_s, data) = client.login("erin").await?;
    assert_eq!(data["groupMessages"]["g1"], json!([]));
    Ok(())
}

#[tokio::test]
async fn test_group_seen_counters() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut sockets = client.register_all(&["carol", "dave"]).await?;
    let mut dave = sockets.pop().unwrap();
    let mut carol = sockets.pop().unwrap();

    carol
        .command(
            "create_group",
            json!({ "id": "g1", "name": "duo", "memberIds": ["dave"] }),
        )
        .await;
    carol.expect("group_created").await?;
    dave.expect("group_created").await?;

    for id in ["gm1", "gm2"] {
        carol
            .command(
                "send_group_message",
                json!({ "id": id, "groupId": "g1", "senderId": "carol", "text": id }),
            )
            .await;
        carol.expect("group_message_sent").await?;
        dave.expect("new_group_message").await?;
    }

    // Whitespace-only text goes nowhere.
    dave.command(
        "send_group_message",
        json!({ "id": "gm3", "groupId": "g1", "senderId": "dave", "text": "   " }),
    )
    .await;
    dave.expect_idle().await?;

    dave.command("mark_group_seen", json!({ "groupId": "g1", "userId": "dave" }))
        .await;
    let data = dave.expect("group_unread_updated").await?;
    assert_eq!(data["unreadCount"], 0);
    let data = dave.expect("group_messages_seen").await?;
    assert_eq!(data["messageIds"], json!(["gm1", "gm2"]));
    assert_eq!(data["userId"], "dave");
    carol.expect("group_messages_seen").await?;

    // Nothing new, nothing fires.
    dave.command("mark_group_seen", json!({ "groupId": "g1", "userId": "dave" }))
        .await;
    dave.expect_idle().await?;
    carol.expect_idle().await?;
    Ok(())
}

#[tokio::test]
async fn test_membership_and_admin_rules() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut sockets = client.register_all(&["carol", "dave", "erin"]).await?;
    let mut erin = sockets.pop().unwrap();
    let mut dave = sockets.pop().unwrap();
    let mut carol = sockets.pop().unwrap();

    carol
        .command(
            "create_group",
            json!({ "id": "g1", "name": "crew", "memberIds": ["dave"] }),
        )
        .await;
    carol.expect("group_created").await?;
    dave.expect("group_created").await?;

    carol
        .command(
            "send_group_message",
            json!({ "id": "gm1", "groupId": "g1", "senderId": "carol", "text": "history" }),
        )
        .await;
    carol.expect("group_message_sent").await?;
    dave.expect("new_group_message").await?;

    // A plain member cannot add; the admin can, and the newcomer gets the
    // backlog inline.
    dave.command(
        "add_group_member",
        json!({ "groupId": "g1", "userId": "dave", "memberId": "erin" }),
    )
    .await;
    dave.expect_idle().await?;

    carol
        .command(
            "add_group_member",
            json!({ "groupId": "g1", "userId": "carol", "memberId": "erin" }),
        )
        .await;
    carol.expect("group_updated").await?;
    dave.expect("group_updated").await?;
    let data = erin.expect("group_updated").await?;
    assert_eq!(data["group"]["memberIds"], json!(["carol", "dave", "erin"]));
    assert_eq!(data["messages"][0]["id"], "gm1");

    // Removing the creator is refused outright.
    carol
        .command(
            "remove_group_member",
            json!({ "groupId": "g1", "userId": "carol", "memberId": "carol" }),
        )
        .await;
    carol.expect_idle().await?;

    // Only the creator manages admins; the demoted side is told.
    carol
        .command(
            "set_group_admin",
            json!({ "groupId": "g1", "userId": "carol", "memberId": "dave", "isAdmin": true }),
        )
        .await;
    for socket in [&mut carol, &mut dave, &mut erin] {
        let data = socket.expect("group_updated").await?;
        assert_eq!(data["group"]["admins"], json!(["carol", "dave"]));
    }

    // A removed member receives a null group.
    carol
        .command(
            "remove_group_member",
            json!({ "groupId": "g1", "userId": "carol", "memberId": "erin" }),
        )
        .await;
    carol.expect("group_updated").await?;
    dave.expect("group_updated").await?;
    let data = erin.expect("group_updated").await?;
    assert!(data["group"].is_null());
    Ok(())
}

#[tokio::test]
async fn test_group_pin_and_reactions() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut sockets = client.register_all(&["carol", "dave"]).await?;
    let mut dave = sockets.pop().unwrap();
    let mut carol = sockets.pop().unwrap();

    carol
        .command(
            "create_group",
            json!({ "id": "g1", "name": "duo", "memberIds": ["dave"] }),
        )
        .await;
    carol.expect("group_created").await?;
    dave.expect("group_created").await?;

    dave.command(
        "send_group_message",
        json!({ "id": "gm1", "groupId": "g1", "senderId": "dave", "text": "keep" }),
    )
    .await;
    dave.expect("group_message_sent").await?;
    carol.expect("new_group_message").await?;

    // Pinning is for admins; a member's attempt is dropped.
    dave.command(
        "pin_group_message",
        json!({ "groupId": "g1", "messageId": "gm1", "isPinned": true }),
    )
    .await;
    dave.expect_idle().await?;

    carol
        .command(
            "pin_group_message",
            json!({ "groupId": "g1", "messageId": "gm1", "isPinned": true }),
        )
        .await;
    for socket in [&mut carol, &mut dave] {
        let data = socket.expect("group_message_pinned").await?;
        assert_eq!(data["group"]["pinnedMessageIds"], json!(["gm1"]));
    }

    carol
        .command(
            "add_group_reaction",
            json!({ "groupId": "g1", "messageId": "gm1", "userId": "carol", "emoji": "👍" }),
        )
        .await;
    for socket in [&mut carol, &mut dave] {
        let data = socket.expect("group_reaction_updated").await?;
        assert_eq!(data["reactions"], json!([{ "userId": "carol", "emoji": "👍" }]));
    }

    dave.command(
        "group_typing",
        json!({ "groupId": "g1", "userId": "dave", "isTyping": true }),
    )
    .await;
    let data = carol.expect("group_user_typing").await?;
    assert_eq!(data["userId"], "dave");
    dave.expect_idle().await?;
    Ok(())
}
