//! Record -> response derivations. Handlers call these instead of computing
//! `is_gold`, effective roles or avatar URLs themselves.
use crate::ranking::PodiumEntry;
use crate::repo::{ContestRecord, EntryRecord, UserRecord};
use crate::roles::{parse_stored_roles, Role};
use crate::types::{ContestPhase, ContestResponse, EntryResponse, RoleBadge, UserView};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

const SUBSCRIBER_MIN_AMOUNT: i64 = 100;
const GOLD_MIN_AMOUNT: i64 = 300;
const FRAME_MIN_AMOUNT: i64 = 500;

pub fn is_subscription_valid(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.is_some_and(|at| at > now)
}

fn has_active_tier(user: &UserRecord, min_amount: i64, now: DateTime<Utc>) -> bool {
    user.subscription_amount >= min_amount
        && is_subscription_valid(user.subscription_expires_at, now)
}

pub fn is_gold(user: &UserRecord, now: DateTime<Utc>) -> bool {
    has_active_tier(user, GOLD_MIN_AMOUNT, now)
}

pub fn can_use_frame(user: &UserRecord, now: DateTime<Utc>) -> bool {
    has_active_tier(user, FRAME_MIN_AMOUNT, now)
}

/// Stored roles plus `Subscriber` exactly while the subscription qualifies.
pub fn effective_roles(user: &UserRecord, now: DateTime<Utc>) -> BTreeSet<Role> {
    let mut roles = parse_stored_roles(&user.roles);
    if has_active_tier(user, SUBSCRIBER_MIN_AMOUNT, now) {
        roles.insert(Role::Subscriber);
    } else {
        roles.remove(&Role::Subscriber);
    }
    roles
}

pub fn avatar_url(username: &str, stored: Option<&str>) -> String {
    match stored.filter(|url| !url.trim().is_empty()) {
        Some(url) => url.to_string(),
        None => format!("/api/avatar/{username}"),
    }
}

pub fn user_view(user: &UserRecord, now: DateTime<Utc>) -> UserView {
    UserView {
        id: user.id,
        username: user.username.clone(),
        avatar_url: avatar_url(&user.username, user.avatar_url.as_deref()),
        is_gold: is_gold(user, now),
        can_use_frame: can_use_frame(user, now),
        roles: effective_roles(user, now)
            .into_iter()
            .map(|role| RoleBadge {
                id: role,
                name: role.display_name().to_string(),
            })
            .collect(),
        created_at: user.created_at,
    }
}

pub fn contest_view(record: ContestRecord, now: DateTime<Utc>) -> ContestResponse {
    ContestResponse {
        phase: ContestPhase::from_times(now, record.end_date),
        id: record.id,
        title: record.title,
        description: record.description,
        start_date: record.start_date,
        end_date: record.end_date,
        creator_username: record.creator_username,
        entry_count: record.entry_count,
    }
}

pub fn entry_view(record: EntryRecord) -> EntryResponse {
    EntryResponse {
        avatar_url: avatar_url(&record.username, record.user_avatar_url.as_deref()),
        id: record.id,
        contest_id: record.contest_id,
        user_id: record.user_id,
        username: record.username,
        image_url: record.image_url,
        extra_image_urls: record.extra_image_urls,
        comment: record.comment,
        submitted_at: record.submitted_at,
        like_count: record.like_count,
        has_liked: record.has_liked,
        rank: None,
        medal: None,
    }
}

/// Podium row; the like count comes from the ranking snapshot so the shown
/// number always matches the rank.
pub fn podium_view(record: EntryRecord, podium: &PodiumEntry) -> EntryResponse {
    EntryResponse {
        like_count: podium.entry.like_count,
        rank: Some(podium.rank),
        medal: Some(podium.medal),
        ..entry_view(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn user(amount: i64, expires_in: Option<Duration>) -> UserRecord {
        let now = Utc::now();
        UserRecord {
            id: 1,
            username: "hana".into(),
            password_hash: String::new(),
            avatar_url: None,
            subscription_amount: amount,
            subscription_expires_at: expires_in.map(|d| now + d),
            roles: vec!["designer".into(), "subscriber".into()],
            created_at: now,
        }
    }

    #[test]
    fn gold_needs_amount_and_unexpired_subscription() {
        let now = Utc::now();
        assert!(is_gold(&user(300, Some(Duration::days(1))), now));
        assert!(!is_gold(&user(299, Some(Duration::days(1))), now));
        assert!(!is_gold(&user(1000, Some(Duration::days(-1))), now));
        assert!(!is_gold(&user(1000, None), now));
    }

    #[test]
    fn frame_needs_higher_tier_than_gold() {
        let now = Utc::now();
        let gold_only = user(300, Some(Duration::days(1)));
        assert!(!can_use_frame(&gold_only, now));
        assert!(can_use_frame(&user(500, Some(Duration::days(1))), now));
    }

    #[test]
    fn subscriber_role_tracks_subscription() {
        let now = Utc::now();
        let expired = effective_roles(&user(100, Some(Duration::days(-2))), now);
        assert_eq!(expired, BTreeSet::from([Role::Designer]));
        let active = effective_roles(&user(100, Some(Duration::days(2))), now);
        assert!(active.contains(&Role::Subscriber));
    }

    #[test]
    fn avatar_falls_back_to_proxy_path() {
        assert_eq!(avatar_url("hana", None), "/api/avatar/hana");
        assert_eq!(avatar_url("hana", Some("  ")), "/api/avatar/hana");
        assert_eq!(
            avatar_url("hana", Some("https://cdn.example/h.png")),
            "https://cdn.example/h.png"
        );
    }

    #[test]
    fn user_view_lists_badges_with_names() {
        let view = user_view(&user(0, None), Utc::now());
        assert_eq!(view.roles.len(), 1);
        assert_eq!(view.roles[0].name, "Designer");
        assert!(!view.is_gold);
    }
}
