use crate::auth::{
    extract_bearer, hash_password, new_session_token, session_key, validate_password,
    validate_username, verify_password,
};
use crate::error::{AppError, AppResult};
use crate::ranking::{rank_entries, tally_trophies, winners, TrophyTally};
use crate::repo::{
    ContestFilter, ContestStore, EntryQuery, EntrySort, NewContest, NewEntry, NewUser, UserRecord,
    DEFAULT_PAGE_SIZE,
};
use crate::roles::{parse_stored_roles, to_stored_roles, AccessPolicy, Capability, Role};
use crate::types::{
    ContestResponse, ContestsQuery, CreateContestRequest, CreateEntryRequest, EntriesQuery,
    EntryPageResponse, EntryResponse, GrantRoleRequest, LikeResponse, LoginRequest, LoginResponse,
    ProfileResponse, SignupRequest, StandingItem, StandingsResponse, SubscriptionRequest,
    UpdateProfileRequest, UserView, WinnersResponse,
};
use crate::view::{contest_view, effective_roles, entry_view, podium_view, user_view};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

const TITLE_MAX: usize = 100;
const DESCRIPTION_MAX: usize = 500;
const COMMENT_MAX: usize = 200;
const MAX_DURATION_DAYS: i64 = 7;
const CONTEST_LIST_LIMIT: i64 = 50;

pub struct AppState<S> {
    store: Arc<S>,
    policy: AccessPolicy,
    password_pepper: String,
    session_ttl: Duration,
}

// Manual impl: the store sits behind an Arc, so S itself need not be Clone.
impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            policy: self.policy.clone(),
            password_pepper: self.password_pepper.clone(),
            session_ttl: self.session_ttl,
        }
    }
}

impl<S> AppState<S> {
    pub fn new(
        store: Arc<S>,
        policy: AccessPolicy,
        password_pepper: String,
        session_ttl: Duration,
    ) -> Self {
        Self {
            store,
            policy,
            password_pepper,
            session_ttl,
        }
    }
}

pub fn app_router<S>(state: AppState<S>) -> Router
where
    S: ContestStore + Send + Sync + 'static,
{
    Router::new()
        .route("/health", get(health))
        .route("/auth/signup", post(signup::<S>))
        .route("/auth/login", post(login::<S>))
        .route("/auth/me", get(me::<S>))
        .route("/users/me", axum::routing::patch(update_me::<S>))
        .route("/users/:username", get(user_profile::<S>))
        .route("/users/:username/trophies", get(user_trophies::<S>))
        .route(
            "/contests",
            post(create_contest::<S>).get(list_contests::<S>),
        )
        .route("/contests/:id", get(get_contest::<S>))
        .route(
            "/contests/:id/entries",
            post(create_entry::<S>).get(list_entries::<S>),
        )
        .route("/contests/:id/standings", get(contest_standings::<S>))
        .route("/contests/:id/winners", get(contest_winners::<S>))
        .route("/entries/:id/like", post(toggle_like::<S>))
        .route("/admin/users/:id/roles", post(grant_role::<S>))
        .route("/admin/users/:id/roles/:role", delete(revoke_role::<S>))
        .route("/admin/users/:id/subscription", put(set_subscription::<S>))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

async fn optional_user<S>(state: &AppState<S>, headers: &HeaderMap) -> AppResult<Option<UserRecord>>
where
    S: ContestStore + Send + Sync,
{
    match extract_bearer(headers)? {
        Some(token) => {
            state
                .store
                .session_user(&session_key(&token), Utc::now())
                .await
        }
        None => Ok(None),
    }
}

async fn current_user<S>(state: &AppState<S>, headers: &HeaderMap) -> AppResult<UserRecord>
where
    S: ContestStore + Send + Sync,
{
    optional_user(state, headers)
        .await?
        .ok_or(AppError::Unauthorized)
}

async fn issue_session<S>(state: &AppState<S>, user: &UserRecord) -> AppResult<LoginResponse>
where
    S: ContestStore + Send + Sync,
{
    let now = Utc::now();
    let token = new_session_token();
    let expires_at = now + state.session_ttl;
    state
        .store
        .create_session(user.id, &session_key(&token), expires_at)
        .await?;
    Ok(LoginResponse {
        token,
        expires_at,
        user: user_view(user, now),
    })
}

fn is_http_url(value: &str) -> bool {
    let rest = value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"));
    matches!(rest, Some(host) if !host.is_empty() && !host.contains(char::is_whitespace))
}

async fn signup<S>(
    State(state): State<AppState<S>>,
    Json(body): Json<SignupRequest>,
) -> Result<Json<LoginResponse>, AppError>
where
    S: ContestStore + Send + Sync,
{
    debug!(username = %body.username, "signup request");
    validate_username(&body.username)?;
    validate_password(&body.password)?;
    let password_hash = hash_password(&body.password, &state.password_pepper)
        .map_err(|e| AppError::Internal(format!("password hash error: {e}")))?;
    let user = state
        .store
        .create_user(NewUser {
            username: &body.username,
            password_hash: &password_hash,
        })
        .await?;
    info!(user_id = user.id, username = %user.username, "user signed up");
    Ok(Json(issue_session(&state, &user).await?))
}

async fn login<S>(
    State(state): State<AppState<S>>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError>
where
    S: ContestStore + Send + Sync,
{
    debug!(username = %body.username, "login request");
    let user = state
        .store
        .user_by_username(&body.username)
        .await?
        .ok_or(AppError::Unauthorized)?;
    let is_valid = verify_password(&body.password, &state.password_pepper, &user.password_hash)
        .map_err(|e| AppError::Internal(format!("password verify error: {e}")))?;
    if !is_valid {
        return Err(AppError::Unauthorized);
    }
    Ok(Json(issue_session(&state, &user).await?))
}

async fn me<S>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
) -> Result<Json<UserView>, AppError>
where
    S: ContestStore + Send + Sync,
{
    let user = current_user(&state, &headers).await?;
    Ok(Json(user_view(&user, Utc::now())))
}

async fn update_me<S>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Json(body): Json<UpdateProfileRequest>,
) -> Result<Json<UserView>, AppError>
where
    S: ContestStore + Send + Sync,
{
    let user = current_user(&state, &headers).await?;
    let avatar_url = body
        .avatar_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty());
    if let Some(url) = avatar_url {
        if !is_http_url(url) {
            return Err(AppError::Validation("avatar_url must be an http(s) URL".into()));
        }
    }
    let updated = state.store.update_avatar(user.id, avatar_url).await?;
    Ok(Json(user_view(&updated, Utc::now())))
}

async fn trophies_for<S>(state: &AppState<S>, user_id: i64) -> AppResult<TrophyTally>
where
    S: ContestStore + Send + Sync,
{
    let ended = state
        .store
        .ended_contest_standings(Utc::now(), Some(user_id))
        .await?;
    Ok(tally_trophies(user_id, &ended))
}

async fn user_profile<S>(
    State(state): State<AppState<S>>,
    Path(username): Path<String>,
) -> Result<Json<ProfileResponse>, AppError>
where
    S: ContestStore + Send + Sync,
{
    debug!(username, "user_profile request");
    let user = state
        .store
        .user_by_username(&username)
        .await?
        .ok_or(AppError::NotFound)?;
    let trophies = trophies_for(&state, user.id).await?;
    Ok(Json(ProfileResponse {
        user: user_view(&user, Utc::now()),
        trophies,
    }))
}

async fn user_trophies<S>(
    State(state): State<AppState<S>>,
    Path(username): Path<String>,
) -> Result<Json<TrophyTally>, AppError>
where
    S: ContestStore + Send + Sync,
{
    let user = state
        .store
        .user_by_username(&username)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(trophies_for(&state, user.id).await?))
}

async fn create_contest<S>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Json(body): Json<CreateContestRequest>,
) -> Result<Json<ContestResponse>, AppError>
where
    S: ContestStore + Send + Sync,
{
    let user = current_user(&state, &headers).await?;
    let now = Utc::now();
    state.policy.require(
        user.id,
        &effective_roles(&user, now),
        Capability::CreateContest,
    )?;
    let title = body.title.trim();
    if title.is_empty() || title.chars().count() > TITLE_MAX {
        return Err(AppError::Validation(format!(
            "title must be 1-{TITLE_MAX} characters"
        )));
    }
    let description = body
        .description
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty());
    if description.is_some_and(|d| d.chars().count() > DESCRIPTION_MAX) {
        return Err(AppError::Validation(format!(
            "description must be at most {DESCRIPTION_MAX} characters"
        )));
    }
    if !(1..=MAX_DURATION_DAYS).contains(&body.duration_days) {
        return Err(AppError::Validation(format!(
            "duration_days must be between 1 and {MAX_DURATION_DAYS}"
        )));
    }
    let record = state
        .store
        .create_contest(NewContest {
            title,
            description,
            start_date: now,
            end_date: now + Duration::days(body.duration_days),
            creator_id: user.id,
        })
        .await?;
    info!(
        contest_id = record.id,
        creator = %user.username,
        end_date = %record.end_date,
        "contest created"
    );
    Ok(Json(contest_view(record, now)))
}

async fn list_contests<S>(
    State(state): State<AppState<S>>,
    Query(params): Query<ContestsQuery>,
) -> Result<Json<Vec<ContestResponse>>, AppError>
where
    S: ContestStore + Send + Sync,
{
    let filter = params.filter.unwrap_or(ContestFilter::Active);
    let limit = params
        .limit
        .unwrap_or(CONTEST_LIST_LIMIT)
        .clamp(1, 100);
    debug!(%filter, limit, "list_contests request");
    let now = Utc::now();
    let records = state.store.list_contests(filter, now, limit).await?;
    Ok(Json(
        records
            .into_iter()
            .map(|record| contest_view(record, now))
            .collect(),
    ))
}

async fn get_contest<S>(
    State(state): State<AppState<S>>,
    Path(contest_id): Path<i64>,
) -> Result<Json<ContestResponse>, AppError>
where
    S: ContestStore + Send + Sync,
{
    let record = state.store.get_contest(contest_id).await?;
    Ok(Json(contest_view(record, Utc::now())))
}

async fn create_entry<S>(
    State(state): State<AppState<S>>,
    Path(contest_id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<CreateEntryRequest>,
) -> Result<Json<EntryResponse>, AppError>
where
    S: ContestStore + Send + Sync,
{
    let user = current_user(&state, &headers).await?;
    let contest = state.store.get_contest(contest_id).await?;
    if contest.is_ended(Utc::now()) {
        return Err(AppError::Validation("contest has ended".into()));
    }
    let Some((image_url, extra_image_urls)) = body.image_urls.split_first() else {
        return Err(AppError::Validation(
            "at least one image is required".into(),
        ));
    };
    if !body.image_urls.iter().all(|url| is_http_url(url)) {
        return Err(AppError::Validation("image_urls must be http(s) URLs".into()));
    }
    let comment = body
        .comment
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty());
    if comment.is_some_and(|c| c.chars().count() > COMMENT_MAX) {
        return Err(AppError::Validation(format!(
            "comment must be at most {COMMENT_MAX} characters"
        )));
    }
    let record = state
        .store
        .create_entry(NewEntry {
            contest_id,
            user_id: user.id,
            image_url,
            extra_image_urls,
            comment,
        })
        .await?;
    info!(contest_id, entry_id = record.id, user_id = user.id, "entry submitted");
    Ok(Json(entry_view(record)))
}

async fn podium_entries<S>(
    state: &AppState<S>,
    contest_id: i64,
    viewer: Option<i64>,
) -> AppResult<Vec<EntryResponse>>
where
    S: ContestStore + Send + Sync,
{
    let standings = state.store.contest_standings(contest_id).await?;
    let podium = winners(&standings);
    let mut views = Vec::with_capacity(podium.len());
    for place in &podium {
        let record = state.store.get_entry(place.entry.entry_id, viewer).await?;
        views.push(podium_view(record, place));
    }
    Ok(views)
}

fn ensure_ended(ended_at: DateTime<Utc>, now: DateTime<Utc>) -> AppResult<()> {
    if now > ended_at {
        Ok(())
    } else {
        Err(AppError::Validation(
            "ranking is only available after the contest ends".into(),
        ))
    }
}

async fn list_entries<S>(
    State(state): State<AppState<S>>,
    Path(contest_id): Path<i64>,
    headers: HeaderMap,
    Query(params): Query<EntriesQuery>,
) -> Result<Json<EntryPageResponse>, AppError>
where
    S: ContestStore + Send + Sync,
{
    let viewer = optional_user(&state, &headers).await?.map(|u| u.id);
    let contest = state.store.get_contest(contest_id).await?;
    let now = Utc::now();
    let is_ended = contest.is_ended(now);
    debug!(contest_id, sort = ?params.sort, cursor = ?params.cursor, "list_entries request");

    // The podium view only exists once the contest ends; before that a trophy
    // sort is served as the default listing.
    if params.sort.as_deref() == Some("trophy") && is_ended {
        let entries = podium_entries(&state, contest_id, viewer).await?;
        return Ok(Json(EntryPageResponse {
            entries,
            next_cursor: None,
            is_ended,
        }));
    }

    let sort = match params.sort.as_deref() {
        None | Some("trophy") => EntrySort::default(),
        Some(raw) => raw.parse::<EntrySort>()?,
    };
    let page = state
        .store
        .list_entries(EntryQuery {
            contest_id,
            sort,
            viewer,
            cursor: params.cursor,
            limit: params.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, 50),
        })
        .await?;
    Ok(Json(EntryPageResponse {
        entries: page.entries.into_iter().map(entry_view).collect(),
        next_cursor: page.next_cursor,
        is_ended,
    }))
}

async fn contest_standings<S>(
    State(state): State<AppState<S>>,
    Path(contest_id): Path<i64>,
) -> Result<Json<StandingsResponse>, AppError>
where
    S: ContestStore + Send + Sync,
{
    let contest = state.store.get_contest(contest_id).await?;
    let inputs = state.store.contest_standings(contest_id).await?;
    let standings = rank_entries(&inputs)
        .into_iter()
        .map(|ranked| StandingItem {
            entry_id: ranked.entry.entry_id,
            user_id: ranked.entry.user_id,
            like_count: ranked.entry.like_count,
            rank: ranked.rank,
        })
        .collect();
    Ok(Json(StandingsResponse {
        contest_id,
        is_final: contest.is_ended(Utc::now()),
        standings,
    }))
}

async fn contest_winners<S>(
    State(state): State<AppState<S>>,
    Path(contest_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<WinnersResponse>, AppError>
where
    S: ContestStore + Send + Sync,
{
    let viewer = optional_user(&state, &headers).await?.map(|u| u.id);
    let contest = state.store.get_contest(contest_id).await?;
    ensure_ended(contest.end_date, Utc::now())?;
    let podium = podium_entries(&state, contest_id, viewer).await?;
    Ok(Json(WinnersResponse { contest_id, podium }))
}

async fn toggle_like<S>(
    State(state): State<AppState<S>>,
    Path(entry_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<LikeResponse>, AppError>
where
    S: ContestStore + Send + Sync,
{
    let user = current_user(&state, &headers).await?;
    let entry = state.store.get_entry(entry_id, Some(user.id)).await?;
    let contest = state.store.get_contest(entry.contest_id).await?;
    if contest.is_ended(Utc::now()) {
        return Err(AppError::Validation("contest has ended".into()));
    }
    let toggled = state.store.toggle_like(user.id, entry_id).await?;
    debug!(
        entry_id,
        user_id = user.id,
        liked = toggled.liked,
        like_count = toggled.like_count,
        "like toggled"
    );
    Ok(Json(LikeResponse {
        entry_id,
        liked: toggled.liked,
        like_count: toggled.like_count,
    }))
}

async fn authorize_role_change<S>(
    state: &AppState<S>,
    headers: &HeaderMap,
    role: Role,
) -> AppResult<UserRecord>
where
    S: ContestStore + Send + Sync,
{
    let actor = current_user(state, headers).await?;
    if !role.is_grantable() {
        return Err(AppError::Validation(format!(
            "{role} is derived from the subscription"
        )));
    }
    let roles = effective_roles(&actor, Utc::now());
    state
        .policy
        .require(actor.id, &roles, state.policy.capability_for_role(role))?;
    Ok(actor)
}

async fn grant_role<S>(
    State(state): State<AppState<S>>,
    Path(user_id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<GrantRoleRequest>,
) -> Result<Json<UserView>, AppError>
where
    S: ContestStore + Send + Sync,
{
    let actor = authorize_role_change(&state, &headers, body.role).await?;
    let target = state.store.user_by_id(user_id).await?;
    let mut roles = parse_stored_roles(&target.roles);
    if !roles.insert(body.role) {
        return Ok(Json(user_view(&target, Utc::now())));
    }
    let updated = state
        .store
        .set_user_roles(user_id, &to_stored_roles(&roles))
        .await?;
    info!(actor = actor.id, target = user_id, role = %body.role, "role granted");
    Ok(Json(user_view(&updated, Utc::now())))
}

async fn revoke_role<S>(
    State(state): State<AppState<S>>,
    Path((user_id, role)): Path<(i64, String)>,
    headers: HeaderMap,
) -> Result<Json<UserView>, AppError>
where
    S: ContestStore + Send + Sync,
{
    let role: Role = role.parse()?;
    let actor = authorize_role_change(&state, &headers, role).await?;
    let target = state.store.user_by_id(user_id).await?;
    let mut roles = parse_stored_roles(&target.roles);
    if !roles.remove(&role) {
        return Ok(Json(user_view(&target, Utc::now())));
    }
    let updated = state
        .store
        .set_user_roles(user_id, &to_stored_roles(&roles))
        .await?;
    info!(actor = actor.id, target = user_id, %role, "role revoked");
    Ok(Json(user_view(&updated, Utc::now())))
}

async fn set_subscription<S>(
    State(state): State<AppState<S>>,
    Path(user_id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<SubscriptionRequest>,
) -> Result<Json<UserView>, AppError>
where
    S: ContestStore + Send + Sync,
{
    let actor = current_user(&state, &headers).await?;
    let now = Utc::now();
    state.policy.require(
        actor.id,
        &effective_roles(&actor, now),
        Capability::ManageSubscriptions,
    )?;
    if body.amount < 0 {
        return Err(AppError::Validation("amount must be non-negative".into()));
    }
    let updated = state
        .store
        .set_subscription(user_id, body.amount, body.expires_at)
        .await?;
    info!(actor = actor.id, target = user_id, amount = body.amount, "subscription updated");
    Ok(Json(user_view(&updated, now)))
}
