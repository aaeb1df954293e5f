//! Wire protocol for the chat hub.
//!
//! Every frame in either direction is a UTF-8 JSON envelope
//! `{ "type": <string>, "data": <object> }`, realized here as
//! adjacently-tagged serde enums. Field names follow the client dialect
//! (camelCase); type tags are snake_case.

use std::collections::BTreeMap;

use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};

use crate::store::{
    ChatEndpoint, DirectMessage, Group, GroupMessage, Reaction, User,
};

/// Payload of a `register` command.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterData {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub bio: String,
}

/// An outgoing direct message as supplied by the client. `send_message` and
/// `forward_message` share this shape; the hub stamps timestamp and status
/// and derives the canonical chat ID itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub text: String,
    #[serde(default)]
    pub reply_to: Option<serde_json::Value>,
    #[serde(default)]
    pub forwarded_from: Option<serde_json::Value>,
}

/// An outgoing group message as supplied by the client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingGroupMessage {
    pub id: String,
    pub group_id: String,
    pub sender_id: String,
    pub text: String,
    #[serde(default)]
    pub reply_to: Option<serde_json::Value>,
    #[serde(default)]
    pub forwarded_from: Option<serde_json::Value>,
}

/// A command received from a client session.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMsg {
    Register(RegisterData),
    Login { user_id: String },
    LoginRecovery { recovery_code: String },
    CheckUsername { username: String },
    SearchUser { query: String },
    SendMessage(OutgoingMessage),
    ForwardMessage(OutgoingMessage),
    EditMessage { chat_id: String, message_id: String, new_text: String },
    DeleteMessage { chat_id: String, message_ids: Vec<String> },
    MarkSeen { chat_id: String, user_id: String, partner_id: String },
    MarkMessagesSeen { chat_id: String, user_id: String, partner_id: String, message_ids: Vec<String> },
    Typing { user_id: String, partner_id: String, is_typing: bool },
    UpdateProfile {
        user_id: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        avatar: Option<String>,
        #[serde(default)]
        bio: Option<String>,
    },
    DeleteAccount { user_id: String },
    BlockUser { user_id: String, target_id: String, is_blocked: bool },
    PinChat { user_id: String, partner_id: String, is_pinned: bool },
    DeleteChat { user_id: String, partner_id: String },
    PinMessage { chat_id: String, message_id: String, is_pinned: bool, user_id: String },
    AddReaction { chat_id: String, message_id: String, user_id: String, emoji: String },
    CreateGroup {
        id: String,
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        avatar: String,
        #[serde(default)]
        member_ids: Vec<String>,
    },
    SendGroupMessage(OutgoingGroupMessage),
    ForwardGroupMessage(OutgoingGroupMessage),
    MarkGroupSeen { group_id: String, user_id: String },
    MarkGroupMessagesSeen { group_id: String, user_id: String, message_ids: Vec<String> },
    EditGroupMessage { group_id: String, message_id: String, new_text: String },
    DeleteGroupMessage { group_id: String, message_ids: Vec<String> },
    PinGroupMessage { group_id: String, message_id: String, is_pinned: bool },
    AddGroupMember { group_id: String, user_id: String, member_id: String },
    RemoveGroupMember { group_id: String, user_id: String, member_id: String },
    SetGroupAdmin { group_id: String, user_id: String, member_id: String, is_admin: bool },
    AddGroupReaction { group_id: String, message_id: String, user_id: String, emoji: String },
    GroupTyping { group_id: String, user_id: String, is_typing: bool },
    Heartbeat,
}

/// A user record as sent over the wire. The recovery code never appears
/// here; it travels only in the `register_success` payload to its owner.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub avatar: String,
    pub bio: String,
    pub is_online: bool,
    pub last_seen: u64,
    pub is_deleted: bool,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            avatar: user.avatar.clone(),
            bio: user.bio.clone(),
            is_online: user.is_online,
            last_seen: user.last_seen,
            is_deleted: user.is_deleted,
        }
    }
}

/// One side of a direct chat with its last message hydrated for the client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub last_message: Option<DirectMessage>,
    pub unread_count: u32,
    pub updated_at: u64,
}

impl ChatSummary {
    pub fn build(endpoint: &ChatEndpoint, messages: &[DirectMessage]) -> Self {
        let last_message = endpoint
            .last_message_id
            .as_ref()
            .and_then(|id| messages.iter().find(|m| &m.id == id))
            .cloned();
        Self {
            last_message,
            unread_count: endpoint.unread_count,
            updated_at: endpoint.updated_at,
        }
    }
}

/// A group with its last message hydrated for the client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupView {
    pub id: String,
    pub name: String,
    pub description: String,
    pub avatar: String,
    pub creator_id: String,
    pub member_ids: Vec<String>,
    pub admins: Vec<String>,
    pub created_at: u64,
    pub is_deleted: bool,
    pub unread_counts: BTreeMap<String, u32>,
    pub pinned_message_ids: Vec<String>,
    pub last_message: Option<GroupMessage>,
}

impl GroupView {
    pub fn build(group: &Group, messages: &[GroupMessage]) -> Self {
        let last_message = group
            .last_message_id
            .as_ref()
            .and_then(|id| messages.iter().find(|m| &m.id == id))
            .cloned();
        Self {
            id: group.id.clone(),
            name: group.name.clone(),
            description: group.description.clone(),
            avatar: group.avatar.clone(),
            creator_id: group.creator_id.clone(),
            member_ids: group.member_ids.clone(),
            admins: group.admins.clone(),
            created_at: group.created_at,
            is_deleted: group.is_deleted,
            unread_counts: group.unread_counts.clone(),
            pinned_message_ids: group.pinned_message_ids.clone(),
            last_message,
        }
    }
}

/// The full per-user state sent on a successful bind.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub user: UserView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_code: Option<String>,
    pub users: Vec<UserView>,
    pub chats: BTreeMap<String, ChatSummary>,
    pub messages: BTreeMap<String, Vec<DirectMessage>>,
    pub groups: Vec<GroupView>,
    pub group_messages: BTreeMap<String, Vec<GroupMessage>>,
    pub blocked: Vec<String>,
    pub blocked_by: Vec<String>,
    pub pinned_chats: Vec<String>,
    pub pinned_messages: BTreeMap<String, Vec<String>>,
    pub online_user_ids: Vec<String>,
}

/// Reference to a message whose delivery state changed in a login batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredRef {
    pub message_id: String,
    pub chat_id: String,
}

/// An event pushed to a client session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMsg {
    /// Greeting sent as soon as the socket opens.
    Connected {},
    RegisterSuccess(Box<Snapshot>),
    RegisterError { error: String },
    LoginSuccess(Box<Snapshot>),
    LoginError { error: String },
    UsernameCheckResult { username: String, available: bool },
    SearchResult { users: Vec<UserView> },
    /// A new user registered; sent to every other session.
    UserJoined { user: UserView, online_user_ids: Vec<String> },
    UserOnline { user_id: String, online_user_ids: Vec<String> },
    UserOffline { user_id: String, last_seen: u64, online_user_ids: Vec<String> },
    UserUpdated { user: UserView },
    UserDeleted { user_id: String, online_user_ids: Vec<String> },
    /// Echo of an accepted direct message back to its author.
    MessageSent { message: DirectMessage },
    NewMessage { message: DirectMessage },
    MessageDelivered { chat_id: String, message_id: String },
    MessageEdited { chat_id: String, message: DirectMessage },
    /// Carries the receiving user's refreshed pinned list for the chat.
    MessageDeleted { chat_id: String, message_ids: Vec<String>, pinned_messages: Vec<String> },
    MessagesSeen { chat_id: String, user_id: String },
    SpecificMessagesSeen { chat_id: String, user_id: String, message_ids: Vec<String> },
    ChatUnreadUpdated { chat_id: String, unread_count: u32 },
    UnreadCleared { chat_id: String },
    /// All `sent -> delivered` promotions performed when a user bound.
    MessagesBatchDelivered { messages: Vec<DeliveredRef> },
    MessagePinned {
        chat_id: String,
        message_id: String,
        is_pinned: bool,
        pinned_messages: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        system_message: Option<DirectMessage>,
    },
    ReactionUpdated { chat_id: String, message_id: String, reactions: Vec<Reaction> },
    ChatPinned { partner_id: String, is_pinned: bool, pinned_chats: Vec<String> },
    ChatDeleted { chat_id: String, partner_id: String },
    UserBlocked { target_id: String, is_blocked: bool, blocked: Vec<String> },
    YouWereBlocked { user_id: String, is_blocked: bool, blocked_by: Vec<String> },
    ProfileUpdated { user: UserView },
    ProfileError { error: String },
    AccountDeleted { user_id: String },
    MessageBlocked { chat_id: String, receiver_id: String, reason: String },
    GroupCreated { group: GroupView },
    /// Membership or metadata change. `group` is null for a member who was
    /// removed; a freshly added member additionally receives the history.
    GroupUpdated {
        group_id: String,
        group: Option<GroupView>,
        #[serde(skip_serializing_if = "Option::is_none")]
        messages: Option<Vec<GroupMessage>>,
    },
    NewGroupMessage { message: GroupMessage, group: GroupView },
    GroupMessageSent { message: GroupMessage },
    GroupMessageEdited { group_id: String, message: GroupMessage },
    GroupMessageDeleted { group_id: String, message_ids: Vec<String>, pinned_message_ids: Vec<String> },
    GroupUnreadUpdated { group_id: String, unread_count: u32 },
    GroupMessagesSeen { group_id: String, user_id: String, message_ids: Vec<String> },
    GroupMessagePinned { group_id: String, message_id: String, is_pinned: bool, group: GroupView },
    GroupReactionUpdated { group_id: String, message_id: String, reactions: Vec<Reaction> },
    GroupUserTyping { group_id: String, user_id: String, is_typing: bool },
    UserTyping { user_id: String, is_typing: bool },
    HeartbeatAck {},
}

impl From<&ServerMsg> for Message {
    fn from(msg: &ServerMsg) -> Self {
        let serialized = serde_json::to_string(msg).expect("failed serialize");
        Message::text(serialized)
    }
}

/// Where an outbound event is addressed. `Origin` is the connection the
/// command arrived on; the rest resolve against currently bound sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Origin,
    User(String),
    Broadcast,
    Others,
}

/// One `(recipient, event)` pair produced by a state mutator.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub to: Recipient,
    pub msg: ServerMsg,
}

impl Outbound {
    pub fn origin(msg: ServerMsg) -> Self {
        Self { to: Recipient::Origin, msg }
    }
    pub fn user(id: impl Into<String>, msg: ServerMsg) -> Self {
        Self { to: Recipient::User(id.into()), msg }
    }
    pub fn broadcast(msg: ServerMsg) -> Self {
        Self { to: Recipient::Broadcast, msg }
    }
    pub fn others(msg: ServerMsg) -> Self {
        Self { to: Recipient::Others, msg }
    }
}
