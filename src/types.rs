use crate::ranking::{Medal, TrophyTally};
use crate::repo::ContestFilter;
use crate::roles::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ContestPhase {
    Active,
    Ended,
}

impl ContestPhase {
    pub fn from_times(now: DateTime<Utc>, end_date: DateTime<Utc>) -> Self {
        if now > end_date {
            ContestPhase::Ended
        } else {
            ContestPhase::Active
        }
    }
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct SignupRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserView,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct RoleBadge {
    pub id: Role,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct UserView {
    pub id: i64,
    pub username: String,
    pub avatar_url: String,
    pub is_gold: bool,
    pub can_use_frame: bool,
    pub roles: Vec<RoleBadge>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ProfileResponse {
    pub user: UserView,
    pub trophies: TrophyTally,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct UpdateProfileRequest {
    pub avatar_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct CreateContestRequest {
    pub title: String,
    pub description: Option<String>,
    pub duration_days: i64,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ContestResponse {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub creator_username: String,
    pub entry_count: i64,
    pub phase: ContestPhase,
}

#[derive(Debug, Deserialize)]
pub struct ContestsQuery {
    pub filter: Option<ContestFilter>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct CreateEntryRequest {
    pub image_urls: Vec<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct EntryResponse {
    pub id: i64,
    pub contest_id: i64,
    pub user_id: i64,
    pub username: String,
    pub avatar_url: String,
    pub image_url: String,
    pub extra_image_urls: Vec<String>,
    pub comment: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub like_count: i64,
    pub has_liked: bool,
    pub rank: Option<u32>,
    pub medal: Option<Medal>,
}

#[derive(Debug, Deserialize)]
pub struct EntriesQuery {
    /// newest | oldest | likes_desc | likes_asc | trophy
    pub sort: Option<String>,
    pub cursor: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct EntryPageResponse {
    pub entries: Vec<EntryResponse>,
    pub next_cursor: Option<i64>,
    pub is_ended: bool,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct StandingItem {
    pub entry_id: i64,
    pub user_id: i64,
    pub like_count: i64,
    pub rank: u32,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct StandingsResponse {
    pub contest_id: i64,
    /// True once the contest has ended and the ranking counts for trophies.
    pub is_final: bool,
    pub standings: Vec<StandingItem>,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct WinnersResponse {
    pub contest_id: i64,
    pub podium: Vec<EntryResponse>,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct LikeResponse {
    pub entry_id: i64,
    pub liked: bool,
    pub like_count: i64,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct GrantRoleRequest {
    pub role: Role,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct SubscriptionRequest {
    pub amount: i64,
    pub expires_at: Option<DateTime<Utc>>,
}
