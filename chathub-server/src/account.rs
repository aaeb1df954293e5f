//! User accounts: registration, login, recovery codes, profiles, blocking.

use tracing::warn;

use crate::hub::State;
use crate::protocol::{Outbound, RegisterData, ServerMsg, UserView};
use crate::store::{User, now_ms};

/// Ambiguous glyphs (0/O, 1/I) are excluded.
const RECOVERY_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Generates a fresh recovery code: three dash-separated groups of four
/// characters drawn uniformly from [`RECOVERY_ALPHABET`].
fn generate_recovery_code() -> String {
    let mut code = String::with_capacity(14);
    for i in 0..12 {
        if i > 0 && i % 4 == 0 {
            code.push('-');
        }
        let idx = rand::random_range(0..RECOVERY_ALPHABET.len());
        code.push(RECOVERY_ALPHABET[idx] as char);
    }
    code
}

/// Codes are compared with dashes stripped and case folded.
fn normalize_recovery_code(code: &str) -> String {
    code.chars()
        .filter(|c| *c != '-')
        .collect::<String>()
        .to_uppercase()
}

/// Insert-if-absent or remove, preserving insertion order.
pub(crate) fn toggle_membership(list: &mut Vec<String>, item: &str, present: bool) {
    if present {
        if !list.iter().any(|x| x == item) {
            list.push(item.to_string());
        }
    } else {
        list.retain(|x| x != item);
    }
}

impl State {
    fn username_taken(&self, username: &str, exclude: Option<&str>) -> bool {
        let lowered = username.to_lowercase();
        self.doc.users.values().any(|u| {
            !u.is_deleted
                && Some(u.id.as_str()) != exclude
                && u.username.to_lowercase() == lowered
        })
    }

    pub(crate) fn register(
        &mut self,
        conn: u64,
        current_user: &mut Option<String>,
        data: RegisterData,
    ) -> Vec<Outbound> {
        let username = data.username.trim().to_string();
        if data.id.is_empty() || username.is_empty() {
            warn!("dropping register with empty id or username");
            return Vec::new();
        }
        if self.doc.users.contains_key(&data.id) {
            return vec![Outbound::origin(ServerMsg::RegisterError {
                error: "user_exists".into(),
            })];
        }
        if self.username_taken(&username, None) {
            return vec![Outbound::origin(ServerMsg::RegisterError {
                error: "username_taken".into(),
            })];
        }

        let user = User {
            id: data.id.clone(),
            username,
            display_name: data.display_name,
            avatar: data.avatar,
            bio: data.bio,
            is_online: true,
            last_seen: now_ms(),
            is_deleted: false,
            recovery_code: generate_recovery_code(),
        };
        self.doc.users.insert(data.id.clone(), user.clone());
        self.mark_dirty();

        let bind_events = self.bind_user(conn, &data.id);
        *current_user = Some(data.id.clone());

        let mut events = vec![
            Outbound::origin(ServerMsg::RegisterSuccess(Box::new(
                self.snapshot_for(&data.id, true),
            ))),
            Outbound::others(ServerMsg::UserJoined {
                user: UserView::from(&user),
                online_user_ids: self.online_user_ids(),
            }),
        ];
        events.extend(bind_events);
        events
    }

    pub(crate) fn login(
        &mut self,
        conn: u64,
        current_user: &mut Option<String>,
        user_id: String,
    ) -> Vec<Outbound> {
        if self.doc.live_user(&user_id).is_none() {
            return vec![Outbound::origin(ServerMsg::LoginError {
                error: "user_not_found".into(),
            })];
        }

        let bind_events = self.bind_user(conn, &user_id);
        *current_user = Some(user_id.clone());

        let mut events = vec![Outbound::origin(ServerMsg::LoginSuccess(Box::new(
            self.snapshot_for(&user_id, false),
        )))];
        events.extend(bind_events);
        events
    }

    /// First non-deleted user whose code matches (dashes and case ignored)
    /// wins; the rest of the flow is identical to a normal login.
    pub(crate) fn login_recovery(
        &mut self,
        conn: u64,
        current_user: &mut Option<String>,
        code: String,
    ) -> Vec<Outbound> {
        let wanted = normalize_recovery_code(&code);
        if wanted.is_empty() {
            return vec![Outbound::origin(ServerMsg::LoginError {
                error: "invalid_recovery_code".into(),
            })];
        }
        let found = self
            .doc
            .users
            .values()
            .find(|u| !u.is_deleted && normalize_recovery_code(&u.recovery_code) == wanted)
            .map(|u| u.id.clone());
        match found {
            Some(user_id) => self.login(conn, current_user, user_id),
            None => vec![Outbound::origin(ServerMsg::LoginError {
                error: "invalid_recovery_code".into(),
            })],
        }
    }

    pub(crate) fn check_username(&self, username: &str) -> Vec<Outbound> {
        let trimmed = username.trim();
        let available = !trimmed.is_empty() && !self.username_taken(trimmed, None);
        vec![Outbound::origin(ServerMsg::UsernameCheckResult {
            username: username.to_string(),
            available,
        })]
    }

    pub(crate) fn search_user(&self, me: &str, query: &str) -> Vec<Outbound> {
        let needle = query.trim().to_lowercase();
        let users = if needle.is_empty() {
            Vec::new()
        } else {
            self.doc
                .users
                .values()
                .filter(|u| {
                    !u.is_deleted
                        && u.id != me
                        && (u.username.to_lowercase().contains(&needle)
                            || u.display_name.to_lowercase().contains(&needle))
                })
                .map(UserView::from)
                .collect()
        };
        vec![Outbound::origin(ServerMsg::SearchResult { users })]
    }

    pub(crate) fn update_profile(
        &mut self,
        me: &str,
        user_id: &str,
        username: Option<String>,
        display_name: Option<String>,
        avatar: Option<String>,
        bio: Option<String>,
    ) -> Vec<Outbound> {
        if user_id != me {
            warn!("dropping update_profile for mismatched user");
            return Vec::new();
        }
        if let Some(name) = &username {
            let trimmed = name.trim();
            if trimmed.is_empty() {
                warn!("dropping update_profile with empty username");
                return Vec::new();
            }
            if self.username_taken(trimmed, Some(me)) {
                return vec![Outbound::origin(ServerMsg::ProfileError {
                    error: "username_taken".into(),
                })];
            }
        }

        let Some(user) = self.doc.users.get_mut(me) else {
            return Vec::new();
        };
        if user.is_deleted {
            return Vec::new();
        }
        if let Some(name) = username {
            user.username = name.trim().to_string();
        }
        if let Some(display_name) = display_name {
            user.display_name = display_name;
        }
        if let Some(avatar) = avatar {
            user.avatar = avatar;
        }
        if let Some(bio) = bio {
            user.bio = bio;
        }
        // The recovery code is never touched here.
        let view = UserView::from(&*user);
        self.mark_dirty();

        vec![
            Outbound::origin(ServerMsg::ProfileUpdated { user: view.clone() }),
            Outbound::others(ServerMsg::UserUpdated { user: view }),
        ]
    }

    pub(crate) fn delete_account(
        &mut self,
        conn: u64,
        current_user: &mut Option<String>,
        user_id: &str,
    ) -> Vec<Outbound> {
        if current_user.as_deref() != Some(user_id) {
            warn!("dropping delete_account for mismatched user");
            return Vec::new();
        }
        let Some(user) = self.doc.users.get_mut(user_id) else {
            return Vec::new();
        };
        user.is_deleted = true;
        user.is_online = false;
        user.last_seen = now_ms();
        self.unbind(user_id, conn);
        *current_user = None;
        self.mark_dirty();

        vec![
            Outbound::origin(ServerMsg::AccountDeleted { user_id: user_id.to_string() }),
            Outbound::others(ServerMsg::UserDeleted {
                user_id: user_id.to_string(),
                online_user_ids: self.online_user_ids(),
            }),
        ]
    }

    pub(crate) fn block_user(
        &mut self,
        me: &str,
        user_id: &str,
        target_id: &str,
        is_blocked: bool,
    ) -> Vec<Outbound> {
        if user_id != me || target_id == me {
            warn!("dropping block_user for mismatched or self target");
            return Vec::new();
        }
        if !self.doc.users.contains_key(target_id) {
            return Vec::new();
        }

        let blocked = self.doc.blocked.entry(me.to_string()).or_default();
        toggle_membership(blocked, target_id, is_blocked);
        let blocked = blocked.clone();
        let blocked_by = self.doc.blocked_by.entry(target_id.to_string()).or_default();
        toggle_membership(blocked_by, me, is_blocked);
        let blocked_by = blocked_by.clone();
        self.mark_dirty();

        vec![
            Outbound::origin(ServerMsg::UserBlocked {
                target_id: target_id.to_string(),
                is_blocked,
                blocked,
            }),
            Outbound::user(target_id, ServerMsg::YouWereBlocked {
                user_id: me.to_string(),
                is_blocked,
                blocked_by,
            }),
        ]
    }
}
