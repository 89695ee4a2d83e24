use crate::error::{AppError, AppResult};
use crate::ranking::{ContestStanding, RankInput};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, Pool, Postgres};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const DEFAULT_PAGE_SIZE: i64 = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub avatar_url: Option<String>,
    pub subscription_amount: i64,
    pub subscription_expires_at: Option<DateTime<Utc>>,
    pub roles: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub password_hash: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContestRecord {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub creator_id: i64,
    pub creator_username: String,
    pub created_at: DateTime<Utc>,
    pub entry_count: i64,
}

impl ContestRecord {
    pub fn is_ended(&self, now: DateTime<Utc>) -> bool {
        now > self.end_date
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NewContest<'a> {
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub creator_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRecord {
    pub id: i64,
    pub contest_id: i64,
    pub user_id: i64,
    pub username: String,
    pub user_avatar_url: Option<String>,
    pub image_url: String,
    pub extra_image_urls: Vec<String>,
    pub comment: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub like_count: i64,
    pub has_liked: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct NewEntry<'a> {
    pub contest_id: i64,
    pub user_id: i64,
    pub image_url: &'a str,
    pub extra_image_urls: &'a [String],
    pub comment: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContestFilter {
    #[display(fmt = "active")]
    Active,
    #[display(fmt = "ended")]
    Ended,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
pub enum EntrySort {
    #[default]
    #[display(fmt = "newest")]
    Newest,
    #[display(fmt = "oldest")]
    Oldest,
    #[display(fmt = "likes_desc")]
    LikesDesc,
    #[display(fmt = "likes_asc")]
    LikesAsc,
}

impl EntrySort {
    fn order_clause(&self) -> &'static str {
        match self {
            EntrySort::Newest => "submitted_at DESC, id DESC",
            EntrySort::Oldest => "submitted_at ASC, id ASC",
            EntrySort::LikesDesc => "like_count DESC, submitted_at ASC, id ASC",
            EntrySort::LikesAsc => "like_count ASC, submitted_at ASC, id ASC",
        }
    }

    fn compare(&self, a: &EntryRecord, b: &EntryRecord) -> std::cmp::Ordering {
        let by_time = a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id));
        match self {
            EntrySort::Newest => by_time.reverse(),
            EntrySort::Oldest => by_time,
            EntrySort::LikesDesc => b.like_count.cmp(&a.like_count).then(by_time),
            EntrySort::LikesAsc => a.like_count.cmp(&b.like_count).then(by_time),
        }
    }
}

impl FromStr for EntrySort {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newest" => Ok(EntrySort::Newest),
            "oldest" => Ok(EntrySort::Oldest),
            "likes_desc" => Ok(EntrySort::LikesDesc),
            "likes_asc" => Ok(EntrySort::LikesAsc),
            other => Err(AppError::Validation(format!("unknown sort: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EntryQuery {
    pub contest_id: i64,
    pub sort: EntrySort,
    pub viewer: Option<i64>,
    /// Id of the last entry of the previous page.
    pub cursor: Option<i64>,
    pub limit: i64,
}

#[derive(Debug, Clone)]
pub struct EntryPage {
    pub entries: Vec<EntryRecord>,
    pub next_cursor: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LikeToggle {
    pub liked: bool,
    pub like_count: i64,
}

#[async_trait]
pub trait ContestStore {
    async fn create_user(&self, user: NewUser<'_>) -> AppResult<UserRecord>;
    async fn user_by_username(&self, username: &str) -> AppResult<Option<UserRecord>>;
    async fn user_by_id(&self, user_id: i64) -> AppResult<UserRecord>;
    async fn set_user_roles(&self, user_id: i64, roles: &[String]) -> AppResult<UserRecord>;
    async fn update_avatar(&self, user_id: i64, avatar_url: Option<&str>)
        -> AppResult<UserRecord>;
    async fn set_subscription(
        &self,
        user_id: i64,
        amount: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> AppResult<UserRecord>;
    /// `key` is the digest of the bearer token, see `auth::session_key`.
    async fn create_session(
        &self,
        user_id: i64,
        key: &str,
        expires_at: DateTime<Utc>,
    ) -> AppResult<()>;
    async fn session_user(&self, key: &str, now: DateTime<Utc>)
        -> AppResult<Option<UserRecord>>;
    async fn create_contest(&self, contest: NewContest<'_>) -> AppResult<ContestRecord>;
    async fn get_contest(&self, contest_id: i64) -> AppResult<ContestRecord>;
    async fn list_contests(
        &self,
        filter: ContestFilter,
        now: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<ContestRecord>>;
    async fn create_entry(&self, entry: NewEntry<'_>) -> AppResult<EntryRecord>;
    async fn get_entry(&self, entry_id: i64, viewer: Option<i64>) -> AppResult<EntryRecord>;
    async fn list_entries(&self, query: EntryQuery) -> AppResult<EntryPage>;
    async fn toggle_like(&self, user_id: i64, entry_id: i64) -> AppResult<LikeToggle>;
    async fn contest_standings(&self, contest_id: i64) -> AppResult<Vec<RankInput>>;
    /// Snapshots of every contest ended before `now`; with `participant` set,
    /// only contests that user entered.
    async fn ended_contest_standings(
        &self,
        now: DateTime<Utc>,
        participant: Option<i64>,
    ) -> AppResult<Vec<ContestStanding>>;
}

fn unique_violation(err: sqlx::Error, message: &str) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::Conflict(message.to_string())
        }
        _ => AppError::DataUnavailable(err),
    }
}

fn group_standings(rows: Vec<DbStandingRow>) -> Vec<ContestStanding> {
    let mut grouped: BTreeMap<i64, ContestStanding> = BTreeMap::new();
    for row in rows {
        let standing = grouped
            .entry(row.contest_id)
            .or_insert_with(|| ContestStanding {
                contest_id: row.contest_id,
                end_date: row.end_date,
                entries: Vec::new(),
            });
        standing.entries.push(RankInput {
            entry_id: row.entry_id,
            contest_id: row.contest_id,
            user_id: row.user_id,
            submitted_at: row.submitted_at,
            like_count: row.like_count,
        });
    }
    grouped.into_values().collect()
}

const USER_COLUMNS: &str = "id, username, password_hash, avatar_url, subscription_amount, subscription_expires_at, roles, created_at";

const CONTEST_SELECT: &str = r#"
    SELECT c.id, c.title, c.description, c.start_date, c.end_date, c.creator_id,
           u.username AS creator_username, c.created_at,
           (SELECT COUNT(*) FROM contest_entries e WHERE e.contest_id = c.id)::BIGINT AS entry_count
    FROM contests c
    JOIN users u ON u.id = c.creator_id
"#;

// $1 = viewer id (nullable)
const ENTRY_SELECT: &str = r#"
    SELECT e.id, e.contest_id, e.user_id, u.username, u.avatar_url AS user_avatar_url,
           e.image_url, e.extra_image_urls, e.comment, e.submitted_at,
           (SELECT COUNT(*) FROM contest_likes l WHERE l.entry_id = e.id)::BIGINT AS like_count,
           EXISTS(
               SELECT 1 FROM contest_likes l WHERE l.entry_id = e.id AND l.user_id = $1
           ) AS has_liked
    FROM contest_entries e
    JOIN users u ON u.id = e.user_id
"#;

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub async fn connect(url: &str) -> AppResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(AppError::DataUnavailable)?;
        init_schema(&pool).await?;
        info!("postgres store ready");
        Ok(Self { pool })
    }

    async fn like_count(&self, entry_id: i64) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*)::BIGINT FROM contest_likes WHERE entry_id = $1"#,
        )
        .bind(entry_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl ContestStore for PgStore {
    async fn create_user(&self, user: NewUser<'_>) -> AppResult<UserRecord> {
        let rec = sqlx::query_as::<_, DbUser>(&format!(
            r#"
            INSERT INTO users (username, password_hash)
            VALUES ($1, $2)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(user.username)
        .bind(user.password_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| unique_violation(e, "username already taken"))?;
        Ok(rec.into())
    }

    async fn user_by_username(&self, username: &str) -> AppResult<Option<UserRecord>> {
        let rec = sqlx::query_as::<_, DbUser>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(rec.map(Into::into))
    }

    async fn user_by_id(&self, user_id: i64) -> AppResult<UserRecord> {
        sqlx::query_as::<_, DbUser>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Into::into)
            .ok_or(AppError::NotFound)
    }

    async fn set_user_roles(&self, user_id: i64, roles: &[String]) -> AppResult<UserRecord> {
        sqlx::query_as::<_, DbUser>(&format!(
            "UPDATE users SET roles = $2 WHERE id = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(user_id)
        .bind(roles)
        .fetch_optional(&self.pool)
        .await?
        .map(Into::into)
        .ok_or(AppError::NotFound)
    }

    async fn update_avatar(
        &self,
        user_id: i64,
        avatar_url: Option<&str>,
    ) -> AppResult<UserRecord> {
        sqlx::query_as::<_, DbUser>(&format!(
            "UPDATE users SET avatar_url = $2 WHERE id = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(user_id)
        .bind(avatar_url)
        .fetch_optional(&self.pool)
        .await?
        .map(Into::into)
        .ok_or(AppError::NotFound)
    }

    async fn set_subscription(
        &self,
        user_id: i64,
        amount: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> AppResult<UserRecord> {
        sqlx::query_as::<_, DbUser>(&format!(
            r#"
            UPDATE users
            SET subscription_amount = $2, subscription_expires_at = $3
            WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(amount)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?
        .map(Into::into)
        .ok_or(AppError::NotFound)
    }

    async fn create_session(
        &self,
        user_id: i64,
        key: &str,
        expires_at: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query(r#"INSERT INTO sessions (token_hash, user_id, expires_at) VALUES ($1, $2, $3)"#)
            .bind(key)
            .bind(user_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn session_user(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<UserRecord>> {
        let rec = sqlx::query_as::<_, DbUser>(
            r#"
            SELECT u.id, u.username, u.password_hash, u.avatar_url, u.subscription_amount,
                   u.subscription_expires_at, u.roles, u.created_at
            FROM sessions s
            JOIN users u ON u.id = s.user_id
            WHERE s.token_hash = $1 AND s.expires_at > $2
            "#,
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(rec.map(Into::into))
    }

    async fn create_contest(&self, contest: NewContest<'_>) -> AppResult<ContestRecord> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO contests (title, description, start_date, end_date, creator_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(contest.title)
        .bind(contest.description)
        .bind(contest.start_date)
        .bind(contest.end_date)
        .bind(contest.creator_id)
        .fetch_one(&self.pool)
        .await?;
        self.get_contest(id).await
    }

    async fn get_contest(&self, contest_id: i64) -> AppResult<ContestRecord> {
        sqlx::query_as::<_, DbContest>(&format!("{CONTEST_SELECT} WHERE c.id = $1"))
            .bind(contest_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Into::into)
            .ok_or(AppError::NotFound)
    }

    async fn list_contests(
        &self,
        filter: ContestFilter,
        now: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<ContestRecord>> {
        let rows = sqlx::query_as::<_, DbContest>(&format!(
            r#"
            {CONTEST_SELECT}
            WHERE (CASE WHEN $1 THEN c.end_date >= $2 ELSE c.end_date < $2 END)
            ORDER BY c.created_at DESC, c.id DESC
            LIMIT $3
            "#
        ))
        .bind(filter == ContestFilter::Active)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn create_entry(&self, entry: NewEntry<'_>) -> AppResult<EntryRecord> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO contest_entries (contest_id, user_id, image_url, extra_image_urls, comment)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(entry.contest_id)
        .bind(entry.user_id)
        .bind(entry.image_url)
        .bind(entry.extra_image_urls)
        .bind(entry.comment)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| unique_violation(e, "already entered this contest"))?;
        self.get_entry(id, Some(entry.user_id)).await
    }

    async fn get_entry(&self, entry_id: i64, viewer: Option<i64>) -> AppResult<EntryRecord> {
        sqlx::query_as::<_, DbEntry>(&format!("{ENTRY_SELECT} WHERE e.id = $2"))
            .bind(viewer)
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Into::into)
            .ok_or(AppError::NotFound)
    }

    async fn list_entries(&self, query: EntryQuery) -> AppResult<EntryPage> {
        // Cursor is positional: the page starts after the cursor entry's row
        // number in the requested ordering.
        let sql = format!(
            r#"
            WITH counted AS (
                {ENTRY_SELECT}
                WHERE e.contest_id = $2
            ), ordered AS (
                SELECT counted.*, ROW_NUMBER() OVER (ORDER BY {order}) AS pos
                FROM counted
            )
            SELECT * FROM ordered
            WHERE pos > COALESCE((SELECT pos FROM ordered WHERE id = $3), 0)
            ORDER BY pos
            LIMIT $4
            "#,
            order = query.sort.order_clause()
        );
        let rows = sqlx::query_as::<_, DbEntry>(&sql)
            .bind(query.viewer)
            .bind(query.contest_id)
            .bind(query.cursor)
            .bind(query.limit.max(1) + 1)
            .fetch_all(&self.pool)
            .await?;
        let entries: Vec<EntryRecord> = rows.into_iter().map(Into::into).collect();
        Ok(page_from(entries, query.limit))
    }

    async fn toggle_like(&self, user_id: i64, entry_id: i64) -> AppResult<LikeToggle> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query(
            r#"DELETE FROM contest_likes WHERE user_id = $1 AND entry_id = $2"#,
        )
        .bind(user_id)
        .bind(entry_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if removed == 0 {
            // A concurrent toggle may have inserted the same row; that is
            // already the state we want.
            let inserted = sqlx::query(
                r#"
                INSERT INTO contest_likes (user_id, entry_id)
                VALUES ($1, $2)
                ON CONFLICT (user_id, entry_id) DO NOTHING
                "#,
            )
            .bind(user_id)
            .bind(entry_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if inserted == 0 {
                debug!(user_id, entry_id, "like already present");
            }
        }
        tx.commit().await?;
        let like_count = self.like_count(entry_id).await?;
        Ok(LikeToggle {
            liked: removed == 0,
            like_count,
        })
    }

    async fn contest_standings(&self, contest_id: i64) -> AppResult<Vec<RankInput>> {
        let rows = sqlx::query_as::<_, DbStandingRow>(
            r#"
            SELECT c.id AS contest_id, c.end_date, e.id AS entry_id, e.user_id, e.submitted_at,
                   COUNT(l.id)::BIGINT AS like_count
            FROM contest_entries e
            JOIN contests c ON c.id = e.contest_id
            LEFT JOIN contest_likes l ON l.entry_id = e.id
            WHERE e.contest_id = $1
            GROUP BY c.id, e.id
            "#,
        )
        .bind(contest_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(group_standings(rows)
            .into_iter()
            .flat_map(|standing| standing.entries)
            .collect())
    }

    async fn ended_contest_standings(
        &self,
        now: DateTime<Utc>,
        participant: Option<i64>,
    ) -> AppResult<Vec<ContestStanding>> {
        let rows = sqlx::query_as::<_, DbStandingRow>(
            r#"
            SELECT c.id AS contest_id, c.end_date, e.id AS entry_id, e.user_id, e.submitted_at,
                   COUNT(l.id)::BIGINT AS like_count
            FROM contests c
            JOIN contest_entries e ON e.contest_id = c.id
            LEFT JOIN contest_likes l ON l.entry_id = e.id
            WHERE c.end_date < $1
              AND ($2::BIGINT IS NULL OR c.id IN (
                  SELECT contest_id FROM contest_entries WHERE user_id = $2
              ))
            GROUP BY c.id, e.id
            "#,
        )
        .bind(now)
        .bind(participant)
        .fetch_all(&self.pool)
        .await?;
        Ok(group_standings(rows))
    }
}

/// `entries` holds up to `limit + 1` rows; the extra row only signals that
/// another page exists.
fn page_from(mut entries: Vec<EntryRecord>, limit: i64) -> EntryPage {
    let limit = limit.max(1) as usize;
    let has_more = entries.len() > limit;
    entries.truncate(limit);
    let next_cursor = if has_more {
        entries.last().map(|e| e.id)
    } else {
        None
    };
    EntryPage {
        entries,
        next_cursor,
    }
}

#[derive(sqlx::FromRow)]
struct DbUser {
    id: i64,
    username: String,
    password_hash: String,
    avatar_url: Option<String>,
    subscription_amount: i64,
    subscription_expires_at: Option<DateTime<Utc>>,
    roles: Vec<String>,
    created_at: DateTime<Utc>,
}

impl From<DbUser> for UserRecord {
    fn from(value: DbUser) -> Self {
        Self {
            id: value.id,
            username: value.username,
            password_hash: value.password_hash,
            avatar_url: value.avatar_url,
            subscription_amount: value.subscription_amount,
            subscription_expires_at: value.subscription_expires_at,
            roles: value.roles,
            created_at: value.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DbContest {
    id: i64,
    title: String,
    description: Option<String>,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    creator_id: i64,
    creator_username: String,
    created_at: DateTime<Utc>,
    entry_count: i64,
}

impl From<DbContest> for ContestRecord {
    fn from(value: DbContest) -> Self {
        Self {
            id: value.id,
            title: value.title,
            description: value.description,
            start_date: value.start_date,
            end_date: value.end_date,
            creator_id: value.creator_id,
            creator_username: value.creator_username,
            created_at: value.created_at,
            entry_count: value.entry_count,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DbEntry {
    id: i64,
    contest_id: i64,
    user_id: i64,
    username: String,
    user_avatar_url: Option<String>,
    image_url: String,
    extra_image_urls: Vec<String>,
    comment: Option<String>,
    submitted_at: DateTime<Utc>,
    like_count: i64,
    has_liked: bool,
}

impl From<DbEntry> for EntryRecord {
    fn from(value: DbEntry) -> Self {
        Self {
            id: value.id,
            contest_id: value.contest_id,
            user_id: value.user_id,
            username: value.username,
            user_avatar_url: value.user_avatar_url,
            image_url: value.image_url,
            extra_image_urls: value.extra_image_urls,
            comment: value.comment,
            submitted_at: value.submitted_at,
            like_count: value.like_count,
            has_liked: value.has_liked,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DbStandingRow {
    contest_id: i64,
    end_date: DateTime<Utc>,
    entry_id: i64,
    user_id: i64,
    submitted_at: DateTime<Utc>,
    like_count: i64,
}

#[derive(Debug, Clone)]
struct MemEntry {
    id: i64,
    contest_id: i64,
    user_id: i64,
    image_url: String,
    extra_image_urls: Vec<String>,
    comment: Option<String>,
    submitted_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemState {
    next_id: i64,
    users: BTreeMap<i64, UserRecord>,
    sessions: HashMap<String, (i64, DateTime<Utc>)>,
    contests: BTreeMap<i64, ContestRecord>,
    entries: BTreeMap<i64, MemEntry>,
    /// (user_id, entry_id)
    likes: HashSet<(i64, i64)>,
}

impl MemState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn user(&self, user_id: i64) -> AppResult<&UserRecord> {
        self.users.get(&user_id).ok_or(AppError::NotFound)
    }

    fn like_count(&self, entry_id: i64) -> i64 {
        self.likes.iter().filter(|(_, e)| *e == entry_id).count() as i64
    }

    fn contest(&self, contest_id: i64) -> AppResult<ContestRecord> {
        let mut contest = self
            .contests
            .get(&contest_id)
            .cloned()
            .ok_or(AppError::NotFound)?;
        contest.entry_count = self
            .entries
            .values()
            .filter(|e| e.contest_id == contest_id)
            .count() as i64;
        Ok(contest)
    }

    fn entry(&self, entry: &MemEntry, viewer: Option<i64>) -> EntryRecord {
        let (username, user_avatar_url) = self
            .users
            .get(&entry.user_id)
            .map(|u| (u.username.clone(), u.avatar_url.clone()))
            .unwrap_or_default();
        EntryRecord {
            id: entry.id,
            contest_id: entry.contest_id,
            user_id: entry.user_id,
            username,
            user_avatar_url,
            image_url: entry.image_url.clone(),
            extra_image_urls: entry.extra_image_urls.clone(),
            comment: entry.comment.clone(),
            submitted_at: entry.submitted_at,
            like_count: self.like_count(entry.id),
            has_liked: viewer.is_some_and(|v| self.likes.contains(&(v, entry.id))),
        }
    }

    fn standing_inputs(&self, contest_id: i64) -> Vec<RankInput> {
        self.entries
            .values()
            .filter(|e| e.contest_id == contest_id)
            .map(|e| RankInput {
                entry_id: e.id,
                contest_id: e.contest_id,
                user_id: e.user_id,
                submitted_at: e.submitted_at,
                like_count: self.like_count(e.id),
            })
            .collect()
    }

    fn update_user(
        &mut self,
        user_id: i64,
        apply: impl FnOnce(&mut UserRecord),
    ) -> AppResult<UserRecord> {
        let user = self.users.get_mut(&user_id).ok_or(AppError::NotFound)?;
        apply(user);
        Ok(user.clone())
    }
}

/// In-memory store for tests and database-less runs. All state sits behind
/// one lock so every read is a consistent snapshot.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemState>>,
}

#[async_trait]
impl ContestStore for InMemoryStore {
    async fn create_user(&self, user: NewUser<'_>) -> AppResult<UserRecord> {
        let mut state = self.state.write().await;
        if state.users.values().any(|u| u.username == user.username) {
            return Err(AppError::Conflict("username already taken".into()));
        }
        let id = state.next_id();
        let record = UserRecord {
            id,
            username: user.username.to_string(),
            password_hash: user.password_hash.to_string(),
            avatar_url: None,
            subscription_amount: 0,
            subscription_expires_at: None,
            roles: Vec::new(),
            created_at: Utc::now(),
        };
        state.users.insert(id, record.clone());
        Ok(record)
    }

    async fn user_by_username(&self, username: &str) -> AppResult<Option<UserRecord>> {
        let state = self.state.read().await;
        Ok(state
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn user_by_id(&self, user_id: i64) -> AppResult<UserRecord> {
        self.state.read().await.user(user_id).cloned()
    }

    async fn set_user_roles(&self, user_id: i64, roles: &[String]) -> AppResult<UserRecord> {
        self.state
            .write()
            .await
            .update_user(user_id, |u| u.roles = roles.to_vec())
    }

    async fn update_avatar(
        &self,
        user_id: i64,
        avatar_url: Option<&str>,
    ) -> AppResult<UserRecord> {
        self.state
            .write()
            .await
            .update_user(user_id, |u| u.avatar_url = avatar_url.map(str::to_string))
    }

    async fn set_subscription(
        &self,
        user_id: i64,
        amount: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> AppResult<UserRecord> {
        self.state.write().await.update_user(user_id, |u| {
            u.subscription_amount = amount;
            u.subscription_expires_at = expires_at;
        })
    }

    async fn create_session(
        &self,
        user_id: i64,
        key: &str,
        expires_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.user(user_id)?;
        state
            .sessions
            .insert(key.to_string(), (user_id, expires_at));
        Ok(())
    }

    async fn session_user(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<UserRecord>> {
        let state = self.state.read().await;
        Ok(state
            .sessions
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .and_then(|(user_id, _)| state.users.get(user_id))
            .cloned())
    }

    async fn create_contest(&self, contest: NewContest<'_>) -> AppResult<ContestRecord> {
        let mut state = self.state.write().await;
        let creator_username = state.user(contest.creator_id)?.username.clone();
        let id = state.next_id();
        let record = ContestRecord {
            id,
            title: contest.title.to_string(),
            description: contest.description.map(str::to_string),
            start_date: contest.start_date,
            end_date: contest.end_date,
            creator_id: contest.creator_id,
            creator_username,
            created_at: Utc::now(),
            entry_count: 0,
        };
        state.contests.insert(id, record.clone());
        Ok(record)
    }

    async fn get_contest(&self, contest_id: i64) -> AppResult<ContestRecord> {
        self.state.read().await.contest(contest_id)
    }

    async fn list_contests(
        &self,
        filter: ContestFilter,
        now: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<ContestRecord>> {
        let state = self.state.read().await;
        let mut contests = state
            .contests
            .keys()
            .map(|id| state.contest(*id))
            .collect::<AppResult<Vec<_>>>()?;
        contests.retain(|c| match filter {
            ContestFilter::Active => !c.is_ended(now),
            ContestFilter::Ended => c.is_ended(now),
        });
        contests.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        contests.truncate(limit.max(1) as usize);
        Ok(contests)
    }

    async fn create_entry(&self, entry: NewEntry<'_>) -> AppResult<EntryRecord> {
        let mut state = self.state.write().await;
        state.contest(entry.contest_id)?;
        state.user(entry.user_id)?;
        if state
            .entries
            .values()
            .any(|e| e.contest_id == entry.contest_id && e.user_id == entry.user_id)
        {
            return Err(AppError::Conflict("already entered this contest".into()));
        }
        let id = state.next_id();
        let stored = MemEntry {
            id,
            contest_id: entry.contest_id,
            user_id: entry.user_id,
            image_url: entry.image_url.to_string(),
            extra_image_urls: entry.extra_image_urls.to_vec(),
            comment: entry.comment.map(str::to_string),
            submitted_at: Utc::now(),
        };
        let record = state.entry(&stored, Some(entry.user_id));
        state.entries.insert(id, stored);
        Ok(record)
    }

    async fn get_entry(&self, entry_id: i64, viewer: Option<i64>) -> AppResult<EntryRecord> {
        let state = self.state.read().await;
        let stored = state.entries.get(&entry_id).ok_or(AppError::NotFound)?;
        Ok(state.entry(stored, viewer))
    }

    async fn list_entries(&self, query: EntryQuery) -> AppResult<EntryPage> {
        let state = self.state.read().await;
        let mut entries: Vec<EntryRecord> = state
            .entries
            .values()
            .filter(|e| e.contest_id == query.contest_id)
            .map(|e| state.entry(e, query.viewer))
            .collect();
        entries.sort_by(|a, b| query.sort.compare(a, b));
        let start = query
            .cursor
            .and_then(|cursor| entries.iter().position(|e| e.id == cursor))
            .map(|pos| pos + 1)
            .unwrap_or(0);
        let page: Vec<EntryRecord> = entries
            .into_iter()
            .skip(start)
            .take(query.limit.max(1) as usize + 1)
            .collect();
        Ok(page_from(page, query.limit))
    }

    async fn toggle_like(&self, user_id: i64, entry_id: i64) -> AppResult<LikeToggle> {
        let mut state = self.state.write().await;
        if !state.entries.contains_key(&entry_id) {
            return Err(AppError::NotFound);
        }
        let liked = if state.likes.remove(&(user_id, entry_id)) {
            false
        } else {
            state.likes.insert((user_id, entry_id));
            true
        };
        Ok(LikeToggle {
            liked,
            like_count: state.like_count(entry_id),
        })
    }

    async fn contest_standings(&self, contest_id: i64) -> AppResult<Vec<RankInput>> {
        Ok(self.state.read().await.standing_inputs(contest_id))
    }

    async fn ended_contest_standings(
        &self,
        now: DateTime<Utc>,
        participant: Option<i64>,
    ) -> AppResult<Vec<ContestStanding>> {
        let state = self.state.read().await;
        let standings = state
            .contests
            .values()
            .map(|contest| ContestStanding {
                contest_id: contest.id,
                end_date: contest.end_date,
                entries: state.standing_inputs(contest.id),
            })
            .filter(|standing| standing.is_ended(now) && !standing.entries.is_empty())
            .filter(|standing| match participant {
                Some(user_id) => standing.entries.iter().any(|e| e.user_id == user_id),
                None => true,
            })
            .collect();
        Ok(standings)
    }
}

async fn init_schema(pool: &Pool<Postgres>) -> AppResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id BIGSERIAL PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            avatar_url TEXT,
            subscription_amount BIGINT NOT NULL DEFAULT 0,
            subscription_expires_at TIMESTAMPTZ,
            roles TEXT[] NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            token_hash TEXT PRIMARY KEY,
            user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            expires_at TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS contests (
            id BIGSERIAL PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            start_date TIMESTAMPTZ NOT NULL,
            end_date TIMESTAMPTZ NOT NULL,
            creator_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS contest_entries (
            id BIGSERIAL PRIMARY KEY,
            contest_id BIGINT NOT NULL REFERENCES contests(id) ON DELETE CASCADE,
            user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            image_url TEXT NOT NULL,
            extra_image_urls TEXT[] NOT NULL DEFAULT '{}',
            comment TEXT,
            submitted_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS contest_entries_contest_user_idx
        ON contest_entries(contest_id, user_id)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS contest_likes (
            id BIGSERIAL PRIMARY KEY,
            user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            entry_id BIGINT NOT NULL REFERENCES contest_entries(id) ON DELETE CASCADE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS contest_likes_user_entry_idx
        ON contest_likes(user_id, entry_id)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS contest_likes_entry_idx ON contest_likes(entry_id)
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}
