//! Persistent document store backing the chat hub.
//!
//! The entire hub state is a single JSON document. It is flushed atomically
//! after every mutation (write to a temp file, then rename) and reloaded on
//! startup. Documents written by older builds are accepted on read: missing
//! top-level keys default to empty, reactions stored as a `userId -> emoji`
//! map are canonicalized to a list, and the historical `oderId` spelling is
//! treated as an alias of `userId`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{Context, Result};
use rand::random;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("SystemTime returned before UNIX_EPOCH")
        .as_millis() as u64
}

/// Canonical identifier of the direct chat between two users: the
/// lexicographic join of the participant IDs. A self-chat is `id:id`.
pub fn direct_chat_id(a: &str, b: &str) -> String {
    if a <= b { format!("{a}:{b}") } else { format!("{b}:{a}") }
}

/// A registered user. Users are never purged; `is_deleted` is a soft flag so
/// historical messages keep a resolvable sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub last_seen: u64,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub recovery_code: String,
}

/// Delivery state of a direct message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Seen,
}

/// A single emoji reaction. Each user holds at most one per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    #[serde(rename = "userId", alias = "oderId")]
    pub user_id: String,
    pub emoji: String,
}

/// Accepts both the canonical reaction list and the legacy map form.
fn de_reactions<'de, D>(de: D) -> Result<Vec<Reaction>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        List(Vec<Reaction>),
        Map(BTreeMap<String, String>),
    }
    Ok(match Repr::deserialize(de)? {
        Repr::List(list) => list,
        Repr::Map(map) => map
            .into_iter()
            .map(|(user_id, emoji)| Reaction { user_id, emoji })
            .collect(),
    })
}

/// A message in a one-to-one chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessage {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub text: String,
    #[serde(default)]
    pub reply_to: Option<serde_json::Value>,
    #[serde(default)]
    pub forwarded_from: Option<serde_json::Value>,
    pub timestamp: u64,
    pub status: MessageStatus,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default, deserialize_with = "de_reactions")]
    pub reactions: Vec<Reaction>,
}

/// One side's view of a direct chat. The last message is stored by ID into
/// `messages[chat_id]`; both endpoints of a chat reference the same message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEndpoint {
    #[serde(default)]
    pub last_message_id: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub updated_at: u64,
}

/// A multi-party conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub avatar: String,
    pub creator_id: String,
    #[serde(default)]
    pub member_ids: Vec<String>,
    #[serde(default)]
    pub admins: Vec<String>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub unread_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub pinned_message_ids: Vec<String>,
    #[serde(default)]
    pub last_message_id: Option<String>,
}

/// A message in a group chat. `seen_by` includes the sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMessage {
    pub id: String,
    pub group_id: String,
    pub sender_id: String,
    pub text: String,
    #[serde(default)]
    pub reply_to: Option<serde_json::Value>,
    #[serde(default)]
    pub forwarded_from: Option<serde_json::Value>,
    pub timestamp: u64,
    #[serde(default, deserialize_with = "de_reactions")]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub seen_by: Vec<String>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub is_system: bool,
}

/// The in-memory state graph, exactly as persisted on disk.
///
/// All maps are `BTreeMap` so that serialization is deterministic: a flushed
/// document reloaded from disk re-flushes byte-identically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Document {
    pub users: BTreeMap<String, User>,
    pub messages: BTreeMap<String, Vec<DirectMessage>>,
    pub chats: BTreeMap<String, BTreeMap<String, ChatEndpoint>>,
    pub groups: BTreeMap<String, Group>,
    pub group_messages: BTreeMap<String, Vec<GroupMessage>>,
    pub blocked: BTreeMap<String, Vec<String>>,
    pub blocked_by: BTreeMap<String, Vec<String>>,
    pub pinned_chats: BTreeMap<String, Vec<String>>,
    pub pinned_messages: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

fn dedup_in_place(list: &mut Vec<String>) {
    let mut seen = BTreeSet::new();
    list.retain(|item| seen.insert(item.clone()));
}

impl Document {
    /// A user who exists and has not been soft-deleted.
    pub fn live_user(&self, id: &str) -> Option<&User> {
        self.users.get(id).filter(|u| !u.is_deleted)
    }

    /// Repairs invariants on documents written by older builds: the creator
    /// is always a member and an admin, every member has an unread counter,
    /// and the block mirror is rebuilt from the blocking side.
    pub fn normalize(&mut self) {
        for group in self.groups.values_mut() {
            if !group.member_ids.contains(&group.creator_id) {
                group.member_ids.insert(0, group.creator_id.clone());
            }
            dedup_in_place(&mut group.member_ids);
            if !group.admins.contains(&group.creator_id) {
                group.admins.insert(0, group.creator_id.clone());
            }
            dedup_in_place(&mut group.admins);
            let members = group.member_ids.clone();
            group.admins.retain(|a| members.contains(a));
            for member in &members {
                group.unread_counts.entry(member.clone()).or_insert(0);
            }
            group.unread_counts.retain(|u, _| members.contains(u));
        }

        self.blocked_by.clear();
        for (blocker, targets) in &self.blocked {
            for target in targets {
                self.blocked_by
                    .entry(target.clone())
                    .or_default()
                    .push(blocker.clone());
            }
        }
    }
}

/// A driver for loading and flushing the state document.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    /// Construct a store backed by the given file, creating parent
    /// directories as needed.
    pub async fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        Ok(Self { path })
    }

    /// Construct a store in a temporary directory for testing.
    pub async fn temporary() -> Result<Self> {
        let dir = std::env::temp_dir().join(format!("chathub_{:x}", random::<u64>()));
        Self::new(dir.join("state.json")).await
    }

    /// Read the document from disk. A missing file is a first run; an
    /// unreadable one starts the hub from an empty document.
    pub async fn load(&self) -> Document {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(_) => return Document::default(),
        };
        match serde_json::from_str::<Document>(&raw) {
            Ok(mut doc) => {
                doc.normalize();
                doc
            }
            Err(e) => {
                warn!("state file {} is unreadable, starting empty: {e}", self.path.display());
                Document::default()
            }
        }
    }

    /// Atomically replace the on-disk document with `json`. The file visible
    /// at the store path is always a complete document.
    pub async fn flush(&self, json: String) -> Result<()> {
        let path = self.path.clone();
        let tmp = path.with_extension("tmp");
        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::write(&tmp, json).context("Failed to write temp state file")?;
            std::fs::rename(&tmp, &path).context("Failed to replace state file")?;
            Ok(())
        })
        .await??;
        Ok(())
    }
}

#[cfg(test)]
impl Drop for Store {
    fn drop(&mut self) {
        // Clean up temporary storage directories on drop.
        if let Some(dir) = self.path.parent()
            && dir.parent() == Some(std::env::temp_dir().as_path())
        {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
