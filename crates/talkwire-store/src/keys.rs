//! Central naming of every shared-store key and pub/sub channel.
//!
//! All other crates go through these functions; nothing else formats a key.

pub fn presence(user_id: &str) -> String {
    format!("presence:user:{user_id}")
}

pub fn presence_meta(user_id: &str) -> String {
    format!("presence:meta:{user_id}")
}

pub fn group_members(group_id: &str) -> String {
    format!("group:members:{group_id}")
}

pub fn group_current(group_id: &str) -> String {
    format!("group:current:{group_id}")
}

pub fn user_groups(user_id: &str) -> String {
    format!("user:groups:{user_id}")
}

/// Inverse of [`presence`]: extract the user id from an expired-key event.
pub fn user_from_presence_key(key: &str) -> Option<&str> {
    key.strip_prefix("presence:user:").filter(|id| !id.is_empty())
}

/// Inverse of [`group_current`], used by the janitor sweep.
pub fn group_from_current_key(key: &str) -> Option<&str> {
    key.strip_prefix("group:current:").filter(|id| !id.is_empty())
}

pub const PRESENCE_PATTERN: &str = "presence:user:*";
pub const GROUP_MEMBERS_PATTERN: &str = "group:members:*";
pub const GROUP_CURRENT_PATTERN: &str = "group:current:*";

pub const CHANNEL_PRESENCE_ONLINE: &str = "presence:online";
pub const CHANNEL_PRESENCE_OFFLINE: &str = "presence:offline";
pub const CHANNEL_PRESENCE_UPDATES: &str = "presence:updates";

/// Keyspace-event channel the Store publishes expired keys on (DB 0).
pub const CHANNEL_KEY_EXPIRED: &str = "__keyevent@0__:expired";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_names_follow_the_store_layout() {
        assert_eq!(presence("A"), "presence:user:A");
        assert_eq!(presence_meta("A"), "presence:meta:A");
        assert_eq!(group_members("g1"), "group:members:g1");
        assert_eq!(group_current("g1"), "group:current:g1");
        assert_eq!(user_groups("A"), "user:groups:A");
    }

    #[test]
    fn presence_key_parse_is_inverse_of_format() {
        let id = "TELENET_81*14946*0011";
        assert_eq!(user_from_presence_key(&presence(id)), Some(id));
    }

    #[test]
    fn presence_key_parse_rejects_foreign_keys() {
        assert_eq!(user_from_presence_key("presence:meta:A"), None);
        assert_eq!(user_from_presence_key("session:A"), None);
        assert_eq!(user_from_presence_key("presence:user:"), None);
    }

    #[test]
    fn current_key_parse_extracts_group() {
        assert_eq!(group_from_current_key(&group_current("ops")), Some("ops"));
        assert_eq!(group_from_current_key("group:members:ops"), None);
    }
}
