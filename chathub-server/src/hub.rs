//! Session and routing core.
//!
//! All state mutation is serialized through one writer lock. Mutators return
//! `(recipient, event)` pairs; the hub resolves them against the session
//! registry, flushes the document if it changed, and fans the events out to
//! live connections.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};
use tracing::{error, info, warn};

use crate::protocol::{
    ChatSummary, ClientMsg, GroupView, Outbound, Recipient, ServerMsg, Snapshot, UserView,
};
use crate::store::{Document, Store, direct_chat_id, now_ms};

/// Outbound frames buffered per connection before a slow peer is dropped.
const OUTBOUND_BUFFER: usize = 256;

/// The chat hub: one instance owns the whole conversation state and every
/// client session.
pub struct Hub {
    state: RwLock<State>,
    /// Live connections by connection ID.
    conns: DashMap<u64, mpsc::Sender<Message>>,
    /// Incremented to obtain unique connection IDs.
    count: AtomicU64,
    store: Store,
}

/// State behind the writer lock: the document plus the session registry.
pub(crate) struct State {
    pub(crate) doc: Document,
    /// Bind-ordered `(userId, connId)` pairs; at most one entry per user.
    online: Vec<(String, u64)>,
    dirty: bool,
}

impl State {
    pub(crate) fn new(doc: Document) -> Self {
        Self { doc, online: Vec::new(), dirty: false }
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub(crate) fn online_user_ids(&self) -> Vec<String> {
        self.online.iter().map(|(user, _)| user.clone()).collect()
    }

    pub(crate) fn conn_of(&self, user_id: &str) -> Option<u64> {
        self.online
            .iter()
            .find(|(user, _)| user == user_id)
            .map(|&(_, conn)| conn)
    }

    pub(crate) fn is_online(&self, user_id: &str) -> bool {
        self.conn_of(user_id).is_some()
    }

    /// Registers a binding, last writer wins. A rebind keeps the user's
    /// position in the bind order.
    pub(crate) fn bind(&mut self, user_id: &str, conn: u64) {
        match self.online.iter_mut().find(|(user, _)| user == user_id) {
            Some(entry) => entry.1 = conn,
            None => self.online.push((user_id.to_string(), conn)),
        }
    }

    /// Clears a binding, but only if this connection still owns it.
    pub(crate) fn unbind(&mut self, user_id: &str, conn: u64) -> bool {
        let len = self.online.len();
        self.online
            .retain(|(user, c)| !(user == user_id && *c == conn));
        self.online.len() != len
    }

    /// Marks the user online, promotes their pending messages, and reports
    /// the session edge. The caller prepends its own snapshot reply.
    pub(crate) fn bind_user(&mut self, conn: u64, user_id: &str) -> Vec<Outbound> {
        self.bind(user_id, conn);
        if let Some(user) = self.doc.users.get_mut(user_id) {
            user.is_online = true;
            user.last_seen = now_ms();
        }
        self.mark_dirty();

        let delivered = self.promote_undelivered(user_id);
        let mut events = vec![Outbound::others(ServerMsg::UserOnline {
            user_id: user_id.to_string(),
            online_user_ids: self.online_user_ids(),
        })];
        if !delivered.is_empty() {
            events.push(Outbound::broadcast(ServerMsg::MessagesBatchDelivered {
                messages: delivered,
            }));
        }
        events
    }

    pub(crate) fn unbind_user(&mut self, conn: u64, user_id: &str) -> Vec<Outbound> {
        if !self.unbind(user_id, conn) {
            // An orphaned session whose binding was taken over.
            return Vec::new();
        }
        let last_seen = now_ms();
        if let Some(user) = self.doc.users.get_mut(user_id) {
            user.is_online = false;
            user.last_seen = last_seen;
        }
        self.mark_dirty();
        vec![Outbound::broadcast(ServerMsg::UserOffline {
            user_id: user_id.to_string(),
            last_seen,
            online_user_ids: self.online_user_ids(),
        })]
    }

    /// Assembles the full state scoped to one user for a bind reply.
    pub(crate) fn snapshot_for(&self, user_id: &str, include_recovery: bool) -> Snapshot {
        let doc = &self.doc;
        let me = doc.users.get(user_id).expect("snapshot for unknown user");

        let mut chats = BTreeMap::new();
        let mut messages = BTreeMap::new();
        if let Some(endpoints) = doc.chats.get(user_id) {
            for (partner, endpoint) in endpoints {
                let chat_id = direct_chat_id(user_id, partner);
                let msgs = doc.messages.get(&chat_id).map(Vec::as_slice).unwrap_or(&[]);
                chats.insert(partner.clone(), ChatSummary::build(endpoint, msgs));
                messages.entry(chat_id).or_insert_with(|| msgs.to_vec());
            }
        }

        let mut groups = Vec::new();
        let mut group_messages = BTreeMap::new();
        for (group_id, group) in &doc.groups {
            if group.is_deleted || !group.member_ids.iter().any(|m| m == user_id) {
                continue;
            }
            let msgs = doc
                .group_messages
                .get(group_id)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            groups.push(GroupView::build(group, msgs));
            group_messages.insert(group_id.clone(), msgs.to_vec());
        }

        Snapshot {
            user: UserView::from(me),
            recovery_code: include_recovery.then(|| me.recovery_code.clone()),
            users: doc.users.values().map(UserView::from).collect(),
            chats,
            messages,
            groups,
            group_messages,
            blocked: doc.blocked.get(user_id).cloned().unwrap_or_default(),
            blocked_by: doc.blocked_by.get(user_id).cloned().unwrap_or_default(),
            pinned_chats: doc.pinned_chats.get(user_id).cloned().unwrap_or_default(),
            pinned_messages: doc.pinned_messages.get(user_id).cloned().unwrap_or_default(),
            online_user_ids: self.online_user_ids(),
        }
    }

    /// Maps events to the connections that should receive them. Events for
    /// users without a live binding are discarded here.
    fn resolve(&self, origin: u64, events: Vec<Outbound>) -> Vec<(u64, ServerMsg)> {
        let mut resolved = Vec::with_capacity(events.len());
        for Outbound { to, msg } in events {
            match to {
                Recipient::Origin => resolved.push((origin, msg)),
                Recipient::User(user_id) => {
                    if let Some(conn) = self.conn_of(&user_id) {
                        resolved.push((conn, msg));
                    }
                }
                Recipient::Broadcast => {
                    for &(_, conn) in &self.online {
                        resolved.push((conn, msg.clone()));
                    }
                }
                Recipient::Others => {
                    for &(_, conn) in &self.online {
                        if conn != origin {
                            resolved.push((conn, msg.clone()));
                        }
                    }
                }
            }
        }
        resolved
    }
}

impl Hub {
    pub fn new(store: Store, doc: Document) -> Self {
        Self {
            state: RwLock::new(State::new(doc)),
            conns: DashMap::new(),
            count: AtomicU64::new(0),
            store,
        }
    }

    /// Number of registered users and currently bound sessions.
    pub async fn stats(&self) -> (usize, usize) {
        let state = self.state.read().await;
        (state.doc.users.len(), state.online.len())
    }

    /// Serialize and flush the current document unconditionally.
    pub async fn persist(&self) {
        let json = {
            let state = self.state.read().await;
            serde_json::to_string(&state.doc)
        };
        match json {
            Ok(json) => {
                if let Err(e) = self.store.flush(json).await {
                    error!("final flush failed: {e:#}");
                }
            }
            Err(e) => error!("serializing state failed: {e}"),
        }
    }

    /// Drives one client session for the lifetime of its socket.
    pub async fn on_connection(&self, socket: WebSocket) {
        let conn = self.count.fetch_add(1, Ordering::Relaxed);
        info!("connection opened, conn = {conn}");

        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        self.conns.insert(conn, tx);

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        self.send(conn, &ServerMsg::Connected {});

        let mut current_user: Option<String> = None;
        while let Some(Ok(frame)) = stream.next().await {
            let Message::Text(text) = frame else { continue };
            match serde_json::from_str::<ClientMsg>(text.as_str()) {
                Ok(msg) => self.dispatch(conn, &mut current_user, msg).await,
                Err(e) => warn!("dropping malformed frame on conn {conn}: {e}"),
            }
        }

        info!("disconnection, conn = {conn}");
        self.conns.remove(&conn);
        if let Some(user_id) = current_user {
            self.apply(conn, |state| state.unbind_user(conn, &user_id)).await;
        }
        writer.abort();
    }

    /// Runs one command through the serialization point: mutate, resolve
    /// recipients, flush if the document changed, then send.
    async fn apply<F>(&self, conn: u64, op: F)
    where
        F: FnOnce(&mut State) -> Vec<Outbound>,
    {
        let (resolved, flush) = {
            let mut state = self.state.write().await;
            let events = op(&mut state);
            let resolved = state.resolve(conn, events);
            let flush = state
                .take_dirty()
                .then(|| serde_json::to_string(&state.doc));
            (resolved, flush)
        };
        match flush {
            // A failed flush keeps the in-memory mutation; the next
            // successful flush snapshots the latest state.
            Some(Ok(json)) => {
                if let Err(e) = self.store.flush(json).await {
                    error!("flush failed: {e:#}");
                }
            }
            Some(Err(e)) => error!("serializing state failed: {e}"),
            None => {}
        }
        for (target, msg) in resolved {
            self.send(target, &msg);
        }
    }

    fn send(&self, conn: u64, msg: &ServerMsg) {
        let failed = match self.conns.get(&conn) {
            Some(tx) => tx.try_send(Message::from(msg)).is_err(),
            None => false,
        };
        if failed {
            // Slow peers must not stall the hub.
            warn!("outbound buffer full, dropping conn = {conn}");
            self.conns.remove(&conn);
        }
    }

    async fn dispatch(&self, conn: u64, current_user: &mut Option<String>, msg: ClientMsg) {
        use ClientMsg::*;
        match msg {
            Register(data) => {
                self.apply(conn, |s| s.register(conn, current_user, data)).await
            }
            Login { user_id } => {
                self.apply(conn, |s| s.login(conn, current_user, user_id)).await
            }
            LoginRecovery { recovery_code } => {
                self.apply(conn, |s| s.login_recovery(conn, current_user, recovery_code))
                    .await
            }
            CheckUsername { username } => {
                self.apply(conn, |s| s.check_username(&username)).await
            }
            Heartbeat => self.send(conn, &ServerMsg::HeartbeatAck {}),
            other => {
                let Some(me) = current_user.clone() else {
                    warn!("dropping command that requires identity on conn {conn}");
                    return;
                };
                match other {
                    SearchUser { query } => {
                        self.apply(conn, |s| s.search_user(&me, &query)).await
                    }
                    SendMessage(out) => {
                        self.apply(conn, |s| s.send_message(&me, out, false)).await
                    }
                    ForwardMessage(out) => {
                        self.apply(conn, |s| s.send_message(&me, out, true)).await
                    }
                    EditMessage { chat_id, message_id, new_text } => {
                        self.apply(conn, |s| s.edit_message(&me, &chat_id, &message_id, new_text))
                            .await
                    }
                    DeleteMessage { chat_id, message_ids } => {
                        self.apply(conn, |s| s.delete_message(&chat_id, &message_ids)).await
                    }
                    MarkSeen { chat_id, user_id, partner_id } => {
                        self.apply(conn, |s| s.mark_seen(&me, &chat_id, &user_id, &partner_id))
                            .await
                    }
                    MarkMessagesSeen { chat_id, user_id, partner_id, message_ids } => {
                        self.apply(conn, |s| {
                            s.mark_messages_seen(&me, &chat_id, &user_id, &partner_id, &message_ids)
                        })
                        .await
                    }
                    Typing { user_id, partner_id, is_typing } => {
                        self.apply(conn, |s| s.typing(&me, &user_id, &partner_id, is_typing))
                            .await
                    }
                    UpdateProfile { user_id, username, display_name, avatar, bio } => {
                        self.apply(conn, |s| {
                            s.update_profile(&me, &user_id, username, display_name, avatar, bio)
                        })
                        .await
                    }
                    DeleteAccount { user_id } => {
                        self.apply(conn, |s| s.delete_account(conn, current_user, &user_id))
                            .await
                    }
                    BlockUser { user_id, target_id, is_blocked } => {
                        self.apply(conn, |s| s.block_user(&me, &user_id, &target_id, is_blocked))
                            .await
                    }
                    PinChat { user_id, partner_id, is_pinned } => {
                        self.apply(conn, |s| s.pin_chat(&me, &user_id, &partner_id, is_pinned))
                            .await
                    }
                    DeleteChat { user_id, partner_id } => {
                        self.apply(conn, |s| s.delete_chat(&me, &user_id, &partner_id)).await
                    }
                    PinMessage { chat_id, message_id, is_pinned, user_id } => {
                        self.apply(conn, |s| {
                            s.pin_message(&me, &chat_id, &message_id, is_pinned, &user_id)
                        })
                        .await
                    }
                    AddReaction { chat_id, message_id, user_id, emoji } => {
                        self.apply(conn, |s| {
                            s.add_reaction(&me, &chat_id, &message_id, &user_id, emoji)
                        })
                        .await
                    }
                    CreateGroup { id, name, description, avatar, member_ids } => {
                        self.apply(conn, |s| {
                            s.create_group(&me, id, name, description, avatar, member_ids)
                        })
                        .await
                    }
                    SendGroupMessage(out) => {
                        self.apply(conn, |s| s.send_group_message(&me, out, false)).await
                    }
                    ForwardGroupMessage(out) => {
                        self.apply(conn, |s| s.send_group_message(&me, out, true)).await
                    }
                    MarkGroupSeen { group_id, user_id } => {
                        self.apply(conn, |s| s.mark_group_seen(&group_id, &user_id)).await
                    }
                    MarkGroupMessagesSeen { group_id, user_id, message_ids } => {
                        self.apply(conn, |s| {
                            s.mark_group_messages_seen(&me, &group_id, &user_id, &message_ids)
                        })
                        .await
                    }
                    EditGroupMessage { group_id, message_id, new_text } => {
                        self.apply(conn, |s| {
                            s.edit_group_message(&me, &group_id, &message_id, new_text)
                        })
                        .await
                    }
                    DeleteGroupMessage { group_id, message_ids } => {
                        self.apply(conn, |s| s.delete_group_message(&me, &group_id, &message_ids))
                            .await
                    }
                    PinGroupMessage { group_id, message_id, is_pinned } => {
                        self.apply(conn, |s| {
                            s.pin_group_message(&me, &group_id, &message_id, is_pinned)
                        })
                        .await
                    }
                    AddGroupMember { group_id, user_id, member_id } => {
                        self.apply(conn, |s| {
                            s.add_group_member(&me, &group_id, &user_id, &member_id)
                        })
                        .await
                    }
                    RemoveGroupMember { group_id, user_id, member_id } => {
                        self.apply(conn, |s| {
                            s.remove_group_member(&me, &group_id, &user_id, &member_id)
                        })
                        .await
                    }
                    SetGroupAdmin { group_id, user_id, member_id, is_admin } => {
                        self.apply(conn, |s| {
                            s.set_group_admin(&me, &group_id, &user_id, &member_id, is_admin)
                        })
                        .await
                    }
                    AddGroupReaction { group_id, message_id, user_id, emoji } => {
                        self.apply(conn, |s| {
                            s.add_group_reaction(&group_id, &message_id, &user_id, emoji)
                        })
                        .await
                    }
                    GroupTyping { group_id, user_id, is_typing } => {
                        self.apply(conn, |s| s.group_typing(&group_id, &user_id, is_typing)).await
                    }
                    // Remaining variants are handled before the identity gate.
                    _ => {}
                }
            }
        }
    }
}
