//! Direct (one-to-one) chat engine.

use tracing::warn;

use crate::account::toggle_membership;
use crate::hub::State;
use crate::protocol::{DeliveredRef, Outbound, OutgoingMessage, ServerMsg};
use crate::store::{DirectMessage, MessageStatus, Reaction, direct_chat_id, now_ms};

impl State {
    /// Appends a message to its chat, maintaining both endpoints: shared
    /// last-message reference, `updated_at`, and the receiver's unread
    /// counter. Rewrites the status to `delivered` when the receiver has a
    /// live session.
    fn append_direct(&mut self, mut msg: DirectMessage) -> DirectMessage {
        if self.is_online(&msg.receiver_id) {
            msg.status = MessageStatus::Delivered;
        }
        let now = msg.timestamp;
        let sender = msg.sender_id.clone();
        let receiver = msg.receiver_id.clone();
        {
            let endpoint = self
                .doc
                .chats
                .entry(sender.clone())
                .or_default()
                .entry(receiver.clone())
                .or_default();
            endpoint.last_message_id = Some(msg.id.clone());
            endpoint.updated_at = now;
        }
        {
            let endpoint = self
                .doc
                .chats
                .entry(receiver)
                .or_default()
                .entry(sender)
                .or_default();
            endpoint.last_message_id = Some(msg.id.clone());
            endpoint.updated_at = now;
            endpoint.unread_count += 1;
        }
        self.doc
            .messages
            .entry(msg.chat_id.clone())
            .or_default()
            .push(msg.clone());
        self.mark_dirty();
        msg
    }

    pub(crate) fn send_message(
        &mut self,
        me: &str,
        out: OutgoingMessage,
        forward: bool,
    ) -> Vec<Outbound> {
        if out.sender_id != me {
            warn!("dropping message from mismatched sender");
            return Vec::new();
        }
        if out.text.trim().is_empty() {
            return Vec::new();
        }
        let chat_id = direct_chat_id(&out.sender_id, &out.receiver_id);
        let Some(receiver) = self.doc.users.get(&out.receiver_id) else {
            warn!("dropping message to unknown user {}", out.receiver_id);
            return Vec::new();
        };
        if receiver.is_deleted {
            return vec![Outbound::origin(ServerMsg::MessageBlocked {
                chat_id,
                receiver_id: out.receiver_id,
                reason: "receiver_deleted".into(),
            })];
        }
        let blocked = self
            .doc
            .blocked
            .get(&out.receiver_id)
            .is_some_and(|list| list.iter().any(|id| id == &out.sender_id));
        if blocked {
            return vec![Outbound::origin(ServerMsg::MessageBlocked {
                chat_id,
                receiver_id: out.receiver_id,
                reason: "blocked".into(),
            })];
        }

        let msg = self.append_direct(DirectMessage {
            id: out.id,
            chat_id,
            sender_id: out.sender_id,
            receiver_id: out.receiver_id,
            text: out.text,
            reply_to: if forward { None } else { out.reply_to },
            forwarded_from: if forward { out.forwarded_from } else { None },
            timestamp: now_ms(),
            status: MessageStatus::Sent,
            is_edited: false,
            is_deleted: false,
            is_system: false,
            reactions: Vec::new(),
        });

        let mut events = vec![Outbound::origin(ServerMsg::MessageSent {
            message: msg.clone(),
        })];
        if msg.status == MessageStatus::Delivered {
            events.push(Outbound::user(
                msg.receiver_id.clone(),
                ServerMsg::NewMessage { message: msg.clone() },
            ));
            events.push(Outbound::origin(ServerMsg::MessageDelivered {
                chat_id: msg.chat_id.clone(),
                message_id: msg.id,
            }));
        }
        events
    }

    /// Promotes every `sent` message addressed to `user_id` to `delivered`,
    /// across all chats. Runs when the user binds; returns the promoted
    /// references in document order.
    pub(crate) fn promote_undelivered(&mut self, user_id: &str) -> Vec<DeliveredRef> {
        let mut delivered = Vec::new();
        for (chat_id, msgs) in self.doc.messages.iter_mut() {
            for msg in msgs.iter_mut() {
                if msg.receiver_id == user_id && msg.status == MessageStatus::Sent {
                    msg.status = MessageStatus::Delivered;
                    delivered.push(DeliveredRef {
                        message_id: msg.id.clone(),
                        chat_id: chat_id.clone(),
                    });
                }
            }
        }
        if !delivered.is_empty() {
            self.mark_dirty();
        }
        delivered
    }

    pub(crate) fn edit_message(
        &mut self,
        me: &str,
        chat_id: &str,
        message_id: &str,
        new_text: String,
    ) -> Vec<Outbound> {
        if new_text.trim().is_empty() {
            return Vec::new();
        }
        let Some(msgs) = self.doc.messages.get_mut(chat_id) else {
            return Vec::new();
        };
        let Some(msg) = msgs.iter_mut().find(|m| m.id == message_id) else {
            return Vec::new();
        };
        if msg.sender_id != me {
            warn!("dropping edit by non-author");
            return Vec::new();
        }
        msg.text = new_text;
        msg.is_edited = true;
        let msg = msg.clone();
        self.mark_dirty();

        [msg.sender_id.clone(), msg.receiver_id.clone()]
            .into_iter()
            .map(|participant| {
                Outbound::user(participant, ServerMsg::MessageEdited {
                    chat_id: chat_id.to_string(),
                    message: msg.clone(),
                })
            })
            .collect()
    }

    // No per-message authorization: any bound session that knows the IDs
    // may delete.
    pub(crate) fn delete_message(&mut self, chat_id: &str, message_ids: &[String]) -> Vec<Outbound> {
        let Some(msgs) = self.doc.messages.get_mut(chat_id) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        let mut pair: Option<(String, String)> = None;
        msgs.retain(|m| {
            if message_ids.iter().any(|id| id == &m.id) {
                pair.get_or_insert_with(|| (m.sender_id.clone(), m.receiver_id.clone()));
                removed.push(m.id.clone());
                false
            } else {
                true
            }
        });
        let Some((a, b)) = pair else {
            return Vec::new();
        };

        let last = msgs.last().map(|m| m.id.clone());
        let unread_a = msgs
            .iter()
            .filter(|m| m.receiver_id == a && m.status != MessageStatus::Seen)
            .count() as u32;
        let unread_b = msgs
            .iter()
            .filter(|m| m.receiver_id == b && m.status != MessageStatus::Seen)
            .count() as u32;
        for (owner, partner, unread) in [(&a, &b, unread_a), (&b, &a, unread_b)] {
            if let Some(endpoint) = self
                .doc
                .chats
                .get_mut(owner)
                .and_then(|chats| chats.get_mut(partner))
            {
                endpoint.last_message_id = last.clone();
                endpoint.unread_count = unread;
            }
        }

        let mut events = Vec::new();
        for owner in [a, b] {
            let pinned = match self
                .doc
                .pinned_messages
                .get_mut(&owner)
                .and_then(|per_chat| per_chat.get_mut(chat_id))
            {
                Some(list) => {
                    list.retain(|id| !removed.contains(id));
                    list.clone()
                }
                None => Vec::new(),
            };
            events.push(Outbound::user(owner, ServerMsg::MessageDeleted {
                chat_id: chat_id.to_string(),
                message_ids: removed.clone(),
                pinned_messages: pinned,
            }));
        }
        self.mark_dirty();
        events
    }

    pub(crate) fn mark_seen(
        &mut self,
        me: &str,
        chat_id: &str,
        user_id: &str,
        partner_id: &str,
    ) -> Vec<Outbound> {
        if user_id != me {
            warn!("dropping mark_seen for mismatched user");
            return Vec::new();
        }
        let mut transitioned = 0;
        if let Some(msgs) = self.doc.messages.get_mut(chat_id) {
            for msg in msgs.iter_mut() {
                if msg.receiver_id == user_id && msg.status != MessageStatus::Seen {
                    msg.status = MessageStatus::Seen;
                    transitioned += 1;
                }
            }
        }
        let prev_unread = self
            .doc
            .chats
            .get_mut(user_id)
            .and_then(|chats| chats.get_mut(partner_id))
            .map(|endpoint| std::mem::take(&mut endpoint.unread_count))
            .unwrap_or(0);
        if transitioned == 0 && prev_unread == 0 {
            return Vec::new();
        }
        self.mark_dirty();
        vec![
            Outbound::user(partner_id, ServerMsg::MessagesSeen {
                chat_id: chat_id.to_string(),
                user_id: user_id.to_string(),
            }),
            Outbound::user(user_id, ServerMsg::UnreadCleared { chat_id: chat_id.to_string() }),
        ]
    }

    pub(crate) fn mark_messages_seen(
        &mut self,
        me: &str,
        chat_id: &str,
        user_id: &str,
        partner_id: &str,
        message_ids: &[String],
    ) -> Vec<Outbound> {
        if user_id != me || message_ids.is_empty() {
            return Vec::new();
        }
        let mut transitioned = Vec::new();
        if let Some(msgs) = self.doc.messages.get_mut(chat_id) {
            for msg in msgs.iter_mut() {
                if message_ids.iter().any(|id| id == &msg.id)
                    && msg.receiver_id == user_id
                    && msg.status != MessageStatus::Seen
                {
                    msg.status = MessageStatus::Seen;
                    transitioned.push(msg.id.clone());
                }
            }
        }
        if transitioned.is_empty() {
            return Vec::new();
        }
        let unread = match self
            .doc
            .chats
            .get_mut(user_id)
            .and_then(|chats| chats.get_mut(partner_id))
        {
            Some(endpoint) => {
                endpoint.unread_count =
                    endpoint.unread_count.saturating_sub(transitioned.len() as u32);
                endpoint.unread_count
            }
            None => 0,
        };
        self.mark_dirty();
        vec![
            Outbound::user(partner_id, ServerMsg::SpecificMessagesSeen {
                chat_id: chat_id.to_string(),
                user_id: user_id.to_string(),
                message_ids: transitioned,
            }),
            Outbound::user(user_id, ServerMsg::ChatUnreadUpdated {
                chat_id: chat_id.to_string(),
                unread_count: unread,
            }),
        ]
    }

    pub(crate) fn pin_message(
        &mut self,
        me: &str,
        chat_id: &str,
        message_id: &str,
        is_pinned: bool,
        user_id: &str,
    ) -> Vec<Outbound> {
        if user_id != me {
            warn!("dropping pin_message for mismatched actor");
            return Vec::new();
        }
        let Some(msg) = self
            .doc
            .messages
            .get(chat_id)
            .and_then(|msgs| msgs.iter().find(|m| m.id == message_id))
        else {
            return Vec::new();
        };
        let (a, b) = (msg.sender_id.clone(), msg.receiver_id.clone());
        let other = if a == me { b.clone() } else { a.clone() };
        let self_chat = a == b;

        // The pin list is mirrored onto both participants.
        for owner in [&a, &b] {
            let list = self
                .doc
                .pinned_messages
                .entry(owner.to_string())
                .or_default()
                .entry(chat_id.to_string())
                .or_default();
            toggle_membership(list, message_id, is_pinned);
        }
        self.mark_dirty();

        let system = if is_pinned && !self_chat {
            let display = self
                .doc
                .users
                .get(me)
                .map(|u| {
                    if u.display_name.is_empty() { u.username.clone() } else { u.display_name.clone() }
                })
                .unwrap_or_else(|| me.to_string());
            Some(self.append_direct(DirectMessage {
                id: format!("system-{}-{:04x}", now_ms(), rand::random::<u16>()),
                chat_id: chat_id.to_string(),
                sender_id: me.to_string(),
                receiver_id: other.clone(),
                text: format!("{display} pinned a message"),
                reply_to: None,
                forwarded_from: None,
                timestamp: now_ms(),
                status: MessageStatus::Sent,
                is_edited: false,
                is_deleted: false,
                is_system: true,
                reactions: Vec::new(),
            }))
        } else {
            None
        };

        let mut events = Vec::new();
        for owner in [a, b] {
            let pinned = self
                .doc
                .pinned_messages
                .get(&owner)
                .and_then(|per_chat| per_chat.get(chat_id))
                .cloned()
                .unwrap_or_default();
            let inline = if owner == me { system.clone() } else { None };
            events.push(Outbound::user(owner, ServerMsg::MessagePinned {
                chat_id: chat_id.to_string(),
                message_id: message_id.to_string(),
                is_pinned,
                pinned_messages: pinned,
                system_message: inline,
            }));
        }
        if let Some(system) = system {
            events.push(Outbound::user(other, ServerMsg::NewMessage { message: system }));
        }
        events
    }

    pub(crate) fn add_reaction(
        &mut self,
        me: &str,
        chat_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: String,
    ) -> Vec<Outbound> {
        if user_id != me {
            warn!("dropping add_reaction for mismatched user");
            return Vec::new();
        }
        let Some(msgs) = self.doc.messages.get_mut(chat_id) else {
            return Vec::new();
        };
        let Some(msg) = msgs.iter_mut().find(|m| m.id == message_id) else {
            return Vec::new();
        };
        apply_reaction(&mut msg.reactions, user_id, emoji);
        let reactions = msg.reactions.clone();
        let participants = [msg.sender_id.clone(), msg.receiver_id.clone()];
        self.mark_dirty();

        participants
            .into_iter()
            .map(|participant| {
                Outbound::user(participant, ServerMsg::ReactionUpdated {
                    chat_id: chat_id.to_string(),
                    message_id: message_id.to_string(),
                    reactions: reactions.clone(),
                })
            })
            .collect()
    }

    pub(crate) fn typing(
        &self,
        me: &str,
        user_id: &str,
        partner_id: &str,
        is_typing: bool,
    ) -> Vec<Outbound> {
        if user_id != me {
            return Vec::new();
        }
        vec![Outbound::user(partner_id, ServerMsg::UserTyping {
            user_id: user_id.to_string(),
            is_typing,
        })]
    }

    pub(crate) fn pin_chat(
        &mut self,
        me: &str,
        user_id: &str,
        partner_id: &str,
        is_pinned: bool,
    ) -> Vec<Outbound> {
        if user_id != me {
            return Vec::new();
        }
        let list = self.doc.pinned_chats.entry(me.to_string()).or_default();
        toggle_membership(list, partner_id, is_pinned);
        let pinned_chats = list.clone();
        self.mark_dirty();
        vec![Outbound::origin(ServerMsg::ChatPinned {
            partner_id: partner_id.to_string(),
            is_pinned,
            pinned_chats,
        })]
    }

    /// Removes the conversation for both sides: history, endpoints, and
    /// pinned messages.
    pub(crate) fn delete_chat(&mut self, me: &str, user_id: &str, partner_id: &str) -> Vec<Outbound> {
        if user_id != me {
            return Vec::new();
        }
        let chat_id = direct_chat_id(me, partner_id);
        let mut changed = self.doc.messages.remove(&chat_id).is_some();
        if let Some(chats) = self.doc.chats.get_mut(me) {
            changed |= chats.remove(partner_id).is_some();
        }
        if let Some(chats) = self.doc.chats.get_mut(partner_id) {
            changed |= chats.remove(me).is_some();
        }
        for owner in [me, partner_id] {
            if let Some(per_chat) = self.doc.pinned_messages.get_mut(owner) {
                changed |= per_chat.remove(&chat_id).is_some();
            }
        }
        if changed {
            self.mark_dirty();
        }
        vec![
            Outbound::user(me, ServerMsg::ChatDeleted {
                chat_id: chat_id.clone(),
                partner_id: partner_id.to_string(),
            }),
            Outbound::user(partner_id, ServerMsg::ChatDeleted {
                chat_id,
                partner_id: me.to_string(),
            }),
        ]
    }
}

/// Toggle-or-replace: repeating the exact same reaction removes it, a new
/// emoji replaces the user's previous one.
pub(crate) fn apply_reaction(reactions: &mut Vec<Reaction>, user_id: &str, emoji: String) {
    if let Some(pos) = reactions
        .iter()
        .position(|r| r.user_id == user_id && r.emoji == emoji)
    {
        reactions.remove(pos);
    } else {
        reactions.retain(|r| r.user_id != user_id);
        reactions.push(Reaction { user_id: user_id.to_string(), emoji });
    }
}
