//! Group chat engine: membership, authorization, per-member unread and
//! seen-by bookkeeping.

use std::collections::BTreeMap;

use tracing::warn;

use crate::account::toggle_membership;
use crate::direct::apply_reaction;
use crate::hub::State;
use crate::protocol::{GroupView, Outbound, OutgoingGroupMessage, ServerMsg};
use crate::store::{Group, GroupMessage, now_ms};

impl State {
    pub(crate) fn group_view(&self, group_id: &str) -> Option<GroupView> {
        let group = self.doc.groups.get(group_id)?;
        let msgs = self
            .doc
            .group_messages
            .get(group_id)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        Some(GroupView::build(group, msgs))
    }

    fn group_members(&self, group_id: &str) -> Vec<String> {
        self.doc
            .groups
            .get(group_id)
            .map(|g| g.member_ids.clone())
            .unwrap_or_default()
    }

    fn is_group_member(&self, group_id: &str, user_id: &str) -> bool {
        self.doc
            .groups
            .get(group_id)
            .is_some_and(|g| !g.is_deleted && g.member_ids.iter().any(|m| m == user_id))
    }

    fn is_group_admin(&self, group_id: &str, user_id: &str) -> bool {
        self.doc
            .groups
            .get(group_id)
            .is_some_and(|g| g.admins.iter().any(|a| a == user_id))
    }

    /// The actor becomes creator and sole admin; the member list is
    /// deduplicated and filtered to live users.
    pub(crate) fn create_group(
        &mut self,
        me: &str,
        id: String,
        name: String,
        description: String,
        avatar: String,
        member_ids: Vec<String>,
    ) -> Vec<Outbound> {
        if id.is_empty() || name.trim().is_empty() {
            warn!("dropping create_group with empty id or name");
            return Vec::new();
        }
        if self.doc.groups.contains_key(&id) {
            warn!("dropping create_group for existing id {id}");
            return Vec::new();
        }

        let mut members = vec![me.to_string()];
        for member in member_ids {
            if !members.contains(&member) && self.doc.live_user(&member).is_some() {
                members.push(member);
            }
        }
        let unread_counts: BTreeMap<String, u32> =
            members.iter().map(|m| (m.clone(), 0)).collect();
        let group = Group {
            id: id.clone(),
            name: name.trim().to_string(),
            description,
            avatar,
            creator_id: me.to_string(),
            member_ids: members.clone(),
            admins: vec![me.to_string()],
            created_at: now_ms(),
            is_deleted: false,
            unread_counts,
            pinned_message_ids: Vec::new(),
            last_message_id: None,
        };
        let view = GroupView::build(&group, &[]);
        self.doc.groups.insert(id, group);
        self.mark_dirty();

        members
            .into_iter()
            .map(|member| Outbound::user(member, ServerMsg::GroupCreated { group: view.clone() }))
            .collect()
    }

    pub(crate) fn send_group_message(
        &mut self,
        me: &str,
        out: OutgoingGroupMessage,
        forward: bool,
    ) -> Vec<Outbound> {
        if out.sender_id != me {
            warn!("dropping group message from mismatched sender");
            return Vec::new();
        }
        if out.text.trim().is_empty() {
            return Vec::new();
        }
        if !self.is_group_member(&out.group_id, me) {
            warn!("dropping group message from non-member");
            return Vec::new();
        }

        let group_id = out.group_id.clone();
        let msg = GroupMessage {
            id: out.id,
            group_id: group_id.clone(),
            sender_id: out.sender_id,
            text: out.text,
            reply_to: if forward { None } else { out.reply_to },
            forwarded_from: if forward { out.forwarded_from } else { None },
            timestamp: now_ms(),
            reactions: Vec::new(),
            seen_by: vec![me.to_string()],
            is_edited: false,
            is_deleted: false,
            is_system: false,
        };

        let Some(group) = self.doc.groups.get_mut(&group_id) else {
            return Vec::new();
        };
        let members = {
            let members = group.member_ids.clone();
            for member in &members {
                if member != me {
                    *group.unread_counts.entry(member.clone()).or_insert(0) += 1;
                }
            }
            group.unread_counts.insert(me.to_string(), 0);
            group.last_message_id = Some(msg.id.clone());
            members
        };
        self.doc
            .group_messages
            .entry(group_id.clone())
            .or_default()
            .push(msg.clone());
        self.mark_dirty();

        let Some(view) = self.group_view(&group_id) else {
            return Vec::new();
        };
        let mut events = vec![Outbound::origin(ServerMsg::GroupMessageSent {
            message: msg.clone(),
        })];
        for member in members {
            if member != me {
                events.push(Outbound::user(member, ServerMsg::NewGroupMessage {
                    message: msg.clone(),
                    group: view.clone(),
                }));
            }
        }
        events
    }

    pub(crate) fn mark_group_seen(&mut self, group_id: &str, user_id: &str) -> Vec<Outbound> {
        if !self.is_group_member(group_id, user_id) {
            return Vec::new();
        }
        let mut seen_ids = Vec::new();
        if let Some(msgs) = self.doc.group_messages.get_mut(group_id) {
            for msg in msgs.iter_mut() {
                if !msg.is_system
                    && msg.sender_id != user_id
                    && !msg.seen_by.iter().any(|u| u == user_id)
                {
                    msg.seen_by.push(user_id.to_string());
                    seen_ids.push(msg.id.clone());
                }
            }
        }
        let prev_unread = self
            .doc
            .groups
            .get_mut(group_id)
            .and_then(|g| g.unread_counts.insert(user_id.to_string(), 0))
            .unwrap_or(0);
        if seen_ids.is_empty() && prev_unread == 0 {
            return Vec::new();
        }
        self.mark_dirty();

        let mut events = vec![Outbound::user(user_id, ServerMsg::GroupUnreadUpdated {
            group_id: group_id.to_string(),
            unread_count: 0,
        })];
        for member in self.group_members(group_id) {
            events.push(Outbound::user(member, ServerMsg::GroupMessagesSeen {
                group_id: group_id.to_string(),
                user_id: user_id.to_string(),
                message_ids: seen_ids.clone(),
            }));
        }
        events
    }

    pub(crate) fn mark_group_messages_seen(
        &mut self,
        me: &str,
        group_id: &str,
        user_id: &str,
        message_ids: &[String],
    ) -> Vec<Outbound> {
        if user_id != me {
            warn!("dropping mark_group_messages_seen for mismatched user");
            return Vec::new();
        }
        if message_ids.is_empty() || !self.is_group_member(group_id, user_id) {
            return Vec::new();
        }
        let mut seen_ids = Vec::new();
        if let Some(msgs) = self.doc.group_messages.get_mut(group_id) {
            for msg in msgs.iter_mut() {
                if message_ids.iter().any(|id| id == &msg.id)
                    && !msg.is_system
                    && msg.sender_id != user_id
                    && !msg.seen_by.iter().any(|u| u == user_id)
                {
                    msg.seen_by.push(user_id.to_string());
                    seen_ids.push(msg.id.clone());
                }
            }
        }
        if seen_ids.is_empty() {
            return Vec::new();
        }
        let unread = match self.doc.groups.get_mut(group_id) {
            Some(group) => {
                let count = group.unread_counts.entry(user_id.to_string()).or_insert(0);
                *count = count.saturating_sub(seen_ids.len() as u32);
                *count
            }
            None => 0,
        };
        self.mark_dirty();

        let mut events = vec![Outbound::user(user_id, ServerMsg::GroupUnreadUpdated {
            group_id: group_id.to_string(),
            unread_count: unread,
        })];
        for member in self.group_members(group_id) {
            events.push(Outbound::user(member, ServerMsg::GroupMessagesSeen {
                group_id: group_id.to_string(),
                user_id: user_id.to_string(),
                message_ids: seen_ids.clone(),
            }));
        }
        events
    }

    pub(crate) fn edit_group_message(
        &mut self,
        me: &str,
        group_id: &str,
        message_id: &str,
        new_text: String,
    ) -> Vec<Outbound> {
        if new_text.trim().is_empty() || !self.is_group_member(group_id, me) {
            return Vec::new();
        }
        let Some(msg) = self
            .doc
            .group_messages
            .get_mut(group_id)
            .and_then(|msgs| msgs.iter_mut().find(|m| m.id == message_id))
        else {
            return Vec::new();
        };
        if msg.sender_id != me {
            warn!("dropping group edit by non-author");
            return Vec::new();
        }
        msg.text = new_text;
        msg.is_edited = true;
        let msg = msg.clone();
        self.mark_dirty();

        self.group_members(group_id)
            .into_iter()
            .map(|member| {
                Outbound::user(member, ServerMsg::GroupMessageEdited {
                    group_id: group_id.to_string(),
                    message: msg.clone(),
                })
            })
            .collect()
    }

    /// Authors may delete their own messages; admins may delete any.
    pub(crate) fn delete_group_message(
        &mut self,
        me: &str,
        group_id: &str,
        message_ids: &[String],
    ) -> Vec<Outbound> {
        if !self.is_group_member(group_id, me) {
            return Vec::new();
        }
        let admin = self.is_group_admin(group_id, me);
        let members = self.group_members(group_id);

        let Some(msgs) = self.doc.group_messages.get_mut(group_id) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        msgs.retain(|m| {
            if message_ids.iter().any(|id| id == &m.id) && (admin || m.sender_id == me) {
                removed.push(m.id.clone());
                false
            } else {
                true
            }
        });
        if removed.is_empty() {
            return Vec::new();
        }

        let last = msgs.last().map(|m| m.id.clone());
        let unread_counts: BTreeMap<String, u32> = members
            .iter()
            .map(|member| {
                let count = msgs
                    .iter()
                    .filter(|m| {
                        !m.is_system
                            && m.sender_id != *member
                            && !m.seen_by.iter().any(|u| u == member)
                    })
                    .count() as u32;
                (member.clone(), count)
            })
            .collect();

        let pinned = match self.doc.groups.get_mut(group_id) {
            Some(group) => {
                group.pinned_message_ids.retain(|id| !removed.contains(id));
                group.last_message_id = last;
                group.unread_counts = unread_counts;
                group.pinned_message_ids.clone()
            }
            None => Vec::new(),
        };
        self.mark_dirty();

        members
            .into_iter()
            .map(|member| {
                Outbound::user(member, ServerMsg::GroupMessageDeleted {
                    group_id: group_id.to_string(),
                    message_ids: removed.clone(),
                    pinned_message_ids: pinned.clone(),
                })
            })
            .collect()
    }

    pub(crate) fn pin_group_message(
        &mut self,
        me: &str,
        group_id: &str,
        message_id: &str,
        is_pinned: bool,
    ) -> Vec<Outbound> {
        if !self.is_group_admin(group_id, me) {
            warn!("dropping pin_group_message by non-admin");
            return Vec::new();
        }
        let exists = self
            .doc
            .group_messages
            .get(group_id)
            .is_some_and(|msgs| msgs.iter().any(|m| m.id == message_id));
        if !exists {
            return Vec::new();
        }
        if let Some(group) = self.doc.groups.get_mut(group_id) {
            toggle_membership(&mut group.pinned_message_ids, message_id, is_pinned);
        }
        self.mark_dirty();

        let Some(view) = self.group_view(group_id) else {
            return Vec::new();
        };
        self.group_members(group_id)
            .into_iter()
            .map(|member| {
                Outbound::user(member, ServerMsg::GroupMessagePinned {
                    group_id: group_id.to_string(),
                    message_id: message_id.to_string(),
                    is_pinned,
                    group: view.clone(),
                })
            })
            .collect()
    }

    pub(crate) fn add_group_member(
        &mut self,
        me: &str,
        group_id: &str,
        user_id: &str,
        member_id: &str,
    ) -> Vec<Outbound> {
        if user_id != me || !self.is_group_admin(group_id, me) {
            warn!("dropping add_group_member without admin rights");
            return Vec::new();
        }
        if self.doc.live_user(member_id).is_none() || self.is_group_member(group_id, member_id) {
            return Vec::new();
        }
        let Some(group) = self.doc.groups.get_mut(group_id) else {
            return Vec::new();
        };
        group.member_ids.push(member_id.to_string());
        group.unread_counts.insert(member_id.to_string(), 0);
        self.mark_dirty();

        let Some(view) = self.group_view(group_id) else {
            return Vec::new();
        };
        let history = self.doc.group_messages.get(group_id).cloned().unwrap_or_default();
        self.group_members(group_id)
            .into_iter()
            .map(|member| {
                // The newcomer also needs the backlog.
                let messages = (member == member_id).then(|| history.clone());
                Outbound::user(member, ServerMsg::GroupUpdated {
                    group_id: group_id.to_string(),
                    group: Some(view.clone()),
                    messages,
                })
            })
            .collect()
    }

    pub(crate) fn remove_group_member(
        &mut self,
        me: &str,
        group_id: &str,
        user_id: &str,
        member_id: &str,
    ) -> Vec<Outbound> {
        if user_id != me || !self.is_group_admin(group_id, me) {
            warn!("dropping remove_group_member without admin rights");
            return Vec::new();
        }
        if !self.is_group_member(group_id, member_id) {
            return Vec::new();
        }
        let Some(group) = self.doc.groups.get_mut(group_id) else {
            return Vec::new();
        };
        if member_id == group.creator_id {
            warn!("refusing to remove group creator");
            return Vec::new();
        }
        group.member_ids.retain(|m| m != member_id);
        group.admins.retain(|a| a != member_id);
        group.unread_counts.remove(member_id);
        self.mark_dirty();

        let Some(view) = self.group_view(group_id) else {
            return Vec::new();
        };
        let mut events: Vec<Outbound> = self
            .group_members(group_id)
            .into_iter()
            .map(|member| {
                Outbound::user(member, ServerMsg::GroupUpdated {
                    group_id: group_id.to_string(),
                    group: Some(view.clone()),
                    messages: None,
                })
            })
            .collect();
        // A null group tells the removed member to drop the conversation.
        events.push(Outbound::user(member_id, ServerMsg::GroupUpdated {
            group_id: group_id.to_string(),
            group: None,
            messages: None,
        }));
        events
    }

    /// Only the creator grants or revokes admin; the creator can never be
    /// demoted.
    pub(crate) fn set_group_admin(
        &mut self,
        me: &str,
        group_id: &str,
        user_id: &str,
        member_id: &str,
        is_admin: bool,
    ) -> Vec<Outbound> {
        if user_id != me {
            return Vec::new();
        }
        let Some(group) = self.doc.groups.get_mut(group_id) else {
            return Vec::new();
        };
        if group.creator_id != me {
            warn!("dropping set_group_admin by non-creator");
            return Vec::new();
        }
        if member_id == group.creator_id || !group.member_ids.iter().any(|m| m == member_id) {
            return Vec::new();
        }
        toggle_membership(&mut group.admins, member_id, is_admin);
        self.mark_dirty();

        let Some(view) = self.group_view(group_id) else {
            return Vec::new();
        };
        self.group_members(group_id)
            .into_iter()
            .map(|member| {
                Outbound::user(member, ServerMsg::GroupUpdated {
                    group_id: group_id.to_string(),
                    group: Some(view.clone()),
                    messages: None,
                })
            })
            .collect()
    }

    pub(crate) fn add_group_reaction(
        &mut self,
        group_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: String,
    ) -> Vec<Outbound> {
        if !self.is_group_member(group_id, user_id) {
            return Vec::new();
        }
        let Some(msg) = self
            .doc
            .group_messages
            .get_mut(group_id)
            .and_then(|msgs| msgs.iter_mut().find(|m| m.id == message_id))
        else {
            return Vec::new();
        };
        apply_reaction(&mut msg.reactions, user_id, emoji);
        let reactions = msg.reactions.clone();
        self.mark_dirty();

        self.group_members(group_id)
            .into_iter()
            .map(|member| {
                Outbound::user(member, ServerMsg::GroupReactionUpdated {
                    group_id: group_id.to_string(),
                    message_id: message_id.to_string(),
                    reactions: reactions.clone(),
                })
            })
            .collect()
    }

    pub(crate) fn group_typing(
        &self,
        group_id: &str,
        user_id: &str,
        is_typing: bool,
    ) -> Vec<Outbound> {
        if !self.is_group_member(group_id, user_id) {
            return Vec::new();
        }
        self.group_members(group_id)
            .into_iter()
            .filter(|member| member != user_id)
            .map(|member| {
                Outbound::user(member, ServerMsg::GroupUserTyping {
                    group_id: group_id.to_string(),
                    user_id: user_id.to_string(),
                    is_typing,
                })
            })
            .collect()
    }
}
