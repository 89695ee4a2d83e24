use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Duration, Utc};
use photocontest_backend::auth::hash_password;
use photocontest_backend::error::{AppError, AppResult};
use photocontest_backend::ranking::{ContestStanding, RankInput};
use photocontest_backend::repo::{
    ContestFilter, ContestRecord, ContestStore, EntryPage, EntryQuery, EntryRecord,
    InMemoryStore, LikeToggle, NewContest, NewEntry, NewUser, UserRecord,
};
use photocontest_backend::roles::AccessPolicy;
use photocontest_backend::routes::{app_router, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const PEPPER: &str = "test-pepper";

struct Harness {
    app: Router,
    store: Arc<InMemoryStore>,
    admin_token: String,
}

async fn harness() -> Harness {
    let store = Arc::new(InMemoryStore::default());
    let admin = store
        .create_user(NewUser {
            username: "admin",
            password_hash: &hash_password("admin-pass", PEPPER).unwrap(),
        })
        .await
        .unwrap();
    let state = AppState::new(
        store.clone(),
        AccessPolicy::new(Some(admin.id)),
        PEPPER.to_string(),
        Duration::hours(1),
    );
    let app = app_router(state);
    let (status, body) = send(
        &app,
        "POST",
        "/auth/login",
        None,
        Some(json!({ "username": "admin", "password": "admin-pass" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    Harness {
        app,
        store,
        admin_token: body["token"].as_str().unwrap().to_string(),
    }
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let res = app.clone().oneshot(request).await.unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

/// Returns (token, user id).
async fn signup(app: &Router, username: &str) -> (String, i64) {
    let (status, body) = send(
        app,
        "POST",
        "/auth/signup",
        None,
        Some(json!({ "username": username, "password": "secret123" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    (
        body["token"].as_str().unwrap().to_string(),
        body["user"]["id"].as_i64().unwrap(),
    )
}

async fn create_contest(app: &Router, token: &str) -> i64 {
    let (status, body) = send(
        app,
        "POST",
        "/contests",
        Some(token),
        Some(json!({ "title": "Golden hour", "description": "Sunsets only", "duration_days": 3 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["phase"], "active");
    body["id"].as_i64().unwrap()
}

/// Contest that closes `open_for` from now; returns (id, end_date).
async fn closing_contest(h: &Harness, creator_id: i64, open_for: Duration) -> (i64, DateTime<Utc>) {
    let now = Utc::now();
    let contest = h
        .store
        .create_contest(NewContest {
            title: "Blue hour",
            description: None,
            start_date: now,
            end_date: now + open_for,
            creator_id,
        })
        .await
        .unwrap();
    (contest.id, contest.end_date)
}

async fn wait_until_ended(end_date: DateTime<Utc>) {
    let remaining = (end_date - Utc::now()).to_std().unwrap_or_default();
    tokio::time::sleep(remaining + std::time::Duration::from_millis(50)).await;
}

async fn enter(app: &Router, contest_id: i64, token: &str) -> (StatusCode, Value) {
    send(
        app,
        "POST",
        &format!("/contests/{contest_id}/entries"),
        Some(token),
        Some(json!({ "image_urls": ["https://img.example/a.jpg"], "comment": "first try" })),
    )
    .await
}

async fn like(app: &Router, entry_id: i64, token: &str) -> (StatusCode, Value) {
    send(app, "POST", &format!("/entries/{entry_id}/like"), Some(token), None).await
}

#[tokio::test]
async fn health_is_ok() {
    let h = harness().await;
    let (status, _) = send(&h.app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn signup_login_and_me() {
    let h = harness().await;
    let (token, id) = signup(&h.app, "mika").await;

    let (status, me) = send(&h.app, "GET", "/auth/me", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["id"].as_i64(), Some(id));
    assert_eq!(me["avatar_url"], "/api/avatar/mika");
    assert_eq!(me["is_gold"], false);

    let (status, _) = send(
        &h.app,
        "POST",
        "/auth/login",
        None,
        Some(json!({ "username": "mika", "password": "wrong-pass" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &h.app,
        "POST",
        "/auth/signup",
        None,
        Some(json!({ "username": "mika", "password": "secret123" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&h.app, "GET", "/auth/me", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn second_entry_in_same_contest_conflicts() {
    let h = harness().await;
    let (token, _) = signup(&h.app, "mika").await;
    let contest_id = create_contest(&h.app, &token).await;

    let (status, entry) = enter(&h.app, contest_id, &token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entry["like_count"], 0);
    let (status, _) = enter(&h.app, contest_id, &token).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn like_toggles_on_and_off() {
    let h = harness().await;
    let (owner, _) = signup(&h.app, "mika").await;
    let (fan, _) = signup(&h.app, "sora").await;
    let contest_id = create_contest(&h.app, &owner).await;
    let (_, entry) = enter(&h.app, contest_id, &owner).await;
    let entry_id = entry["id"].as_i64().unwrap();

    let (status, body) = like(&h.app, entry_id, &fan).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["liked"], true);
    assert_eq!(body["like_count"], 1);

    let (_, body) = like(&h.app, entry_id, &fan).await;
    assert_eq!(body["liked"], false);
    assert_eq!(body["like_count"], 0);

    let (status, _) = send(&h.app, "POST", &format!("/entries/{entry_id}/like"), None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn ended_contest_awards_medals_with_shared_gold() {
    let h = harness().await;
    let (t1, aki_id) = signup(&h.app, "aki").await;
    let (t2, _) = signup(&h.app, "bea").await;
    let (t3, _) = signup(&h.app, "cho").await;
    let (t4, _) = signup(&h.app, "dan").await;
    let (contest_id, end_date) = closing_contest(&h, aki_id, Duration::milliseconds(1500)).await;

    let mut ids = Vec::new();
    for token in [&t1, &t2, &t3, &t4] {
        let (status, entry) = enter(&h.app, contest_id, token).await;
        assert_eq!(status, StatusCode::OK);
        ids.push(entry["id"].as_i64().unwrap());
    }
    let (a, b, c) = (ids[0], ids[1], ids[2]);
    for (entry, token) in [(a, &t2), (a, &t3), (b, &t1), (b, &t3), (c, &t1)] {
        let (status, _) = like(&h.app, entry, token).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, _) = send(&h.app, "GET", &format!("/contests/{contest_id}/winners"), None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, standings) = send(
        &h.app,
        "GET",
        &format!("/contests/{contest_id}/standings"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(standings["is_final"], false);

    wait_until_ended(end_date).await;

    let (status, body) = like(&h.app, ids[3], &t1).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "validation error: contest has ended");

    let (status, body) = send(&h.app, "GET", &format!("/contests/{contest_id}/winners"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    let podium = body["podium"].as_array().unwrap();
    let order: Vec<i64> = podium.iter().map(|e| e["id"].as_i64().unwrap()).collect();
    assert_eq!(order, vec![a, b, c]);
    let medals: Vec<&str> = podium.iter().map(|e| e["medal"].as_str().unwrap()).collect();
    assert_eq!(medals, vec!["gold", "gold", "bronze"]);
    let ranks: Vec<u64> = podium.iter().map(|e| e["rank"].as_u64().unwrap()).collect();
    assert_eq!(ranks, vec![1, 1, 3]);

    let (status, page) = send(
        &h.app,
        "GET",
        &format!("/contests/{contest_id}/entries?sort=trophy"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["is_ended"], true);
    assert_eq!(page["entries"].as_array().unwrap().len(), 3);

    let (_, aki) = send(&h.app, "GET", "/users/aki/trophies", None, None).await;
    assert_eq!(aki, json!({ "gold": 1, "silver": 0, "bronze": 0 }));
    let (_, cho) = send(&h.app, "GET", "/users/cho/trophies", None, None).await;
    assert_eq!(cho, json!({ "gold": 0, "silver": 0, "bronze": 1 }));
    let (_, dan) = send(&h.app, "GET", "/users/dan", None, None).await;
    assert_eq!(dan["trophies"], json!({ "gold": 0, "silver": 0, "bronze": 0 }));

    let (_, ended) = send(&h.app, "GET", "/contests?filter=ended", None, None).await;
    assert_eq!(ended.as_array().unwrap().len(), 1);
    assert_eq!(ended[0]["phase"], "ended");
}

#[tokio::test]
async fn trophy_sort_lists_newest_while_running() {
    let h = harness().await;
    let (t1, _) = signup(&h.app, "mika").await;
    let (t2, _) = signup(&h.app, "sora").await;
    let contest_id = create_contest(&h.app, &t1).await;
    let (_, first) = enter(&h.app, contest_id, &t1).await;
    let (_, second) = enter(&h.app, contest_id, &t2).await;

    let (status, page) = send(
        &h.app,
        "GET",
        &format!("/contests/{contest_id}/entries?sort=trophy"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["is_ended"], false);
    let entries = page["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["id"], second["id"]);
    assert_eq!(entries[1]["id"], first["id"]);
    assert!(entries[0]["medal"].is_null());

    let (status, _) = send(
        &h.app,
        "GET",
        &format!("/contests/{contest_id}/entries?sort=sideways"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn only_admin_grants_roles() {
    let h = harness().await;
    let (user_token, _) = signup(&h.app, "mika").await;
    let (_, target) = signup(&h.app, "sora").await;
    let uri = format!("/admin/users/{target}/roles");

    let (status, _) = send(
        &h.app,
        "POST",
        &uri,
        Some(&user_token),
        Some(json!({ "role": "designer" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, view) = send(
        &h.app,
        "POST",
        &uri,
        Some(&h.admin_token),
        Some(json!({ "role": "designer" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["roles"][0]["id"], "designer");
    assert_eq!(view["roles"][0]["name"], "Designer");

    let (status, _) = send(
        &h.app,
        "POST",
        &uri,
        Some(&h.admin_token),
        Some(json!({ "role": "subscriber" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, view) = send(
        &h.app,
        "DELETE",
        &format!("{uri}/designer"),
        Some(&h.admin_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(view["roles"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn subscription_unlocks_gold_and_subscriber_badge() {
    let h = harness().await;
    let (token, user_id) = signup(&h.app, "mika").await;
    let expires_at = Utc::now() + Duration::days(30);

    let (status, _) = send(
        &h.app,
        "PUT",
        &format!("/admin/users/{user_id}/subscription"),
        Some(&token),
        Some(json!({ "amount": 500, "expires_at": expires_at })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, view) = send(
        &h.app,
        "PUT",
        &format!("/admin/users/{user_id}/subscription"),
        Some(&h.admin_token),
        Some(json!({ "amount": 500, "expires_at": expires_at })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["is_gold"], true);
    assert_eq!(view["can_use_frame"], true);
    assert_eq!(view["roles"][0]["id"], "subscriber");
}

/// Store whose ranking reads fail; lookups of the user and an ended contest
/// still succeed so handlers reach the ranking code.
struct UnavailableStore;

fn unavailable<T>() -> AppResult<T> {
    Err(AppError::DataUnavailable(sqlx::Error::PoolTimedOut))
}

fn ghost_user() -> UserRecord {
    UserRecord {
        id: 1,
        username: "ghost".into(),
        password_hash: String::new(),
        avatar_url: None,
        subscription_amount: 0,
        subscription_expires_at: None,
        roles: Vec::new(),
        created_at: Utc::now(),
    }
}

#[async_trait::async_trait]
impl ContestStore for UnavailableStore {
    async fn create_user(&self, _user: NewUser<'_>) -> AppResult<UserRecord> {
        unavailable()
    }
    async fn user_by_username(&self, _username: &str) -> AppResult<Option<UserRecord>> {
        Ok(Some(ghost_user()))
    }
    async fn user_by_id(&self, _user_id: i64) -> AppResult<UserRecord> {
        Ok(ghost_user())
    }
    async fn set_user_roles(&self, _user_id: i64, _roles: &[String]) -> AppResult<UserRecord> {
        unavailable()
    }
    async fn update_avatar(
        &self,
        _user_id: i64,
        _avatar_url: Option<&str>,
    ) -> AppResult<UserRecord> {
        unavailable()
    }
    async fn set_subscription(
        &self,
        _user_id: i64,
        _amount: i64,
        _expires_at: Option<DateTime<Utc>>,
    ) -> AppResult<UserRecord> {
        unavailable()
    }
    async fn create_session(
        &self,
        _user_id: i64,
        _key: &str,
        _expires_at: DateTime<Utc>,
    ) -> AppResult<()> {
        unavailable()
    }
    async fn session_user(&self, _key: &str, _now: DateTime<Utc>) -> AppResult<Option<UserRecord>> {
        unavailable()
    }
    async fn create_contest(&self, _contest: NewContest<'_>) -> AppResult<ContestRecord> {
        unavailable()
    }
    async fn get_contest(&self, contest_id: i64) -> AppResult<ContestRecord> {
        let now = Utc::now();
        Ok(ContestRecord {
            id: contest_id,
            title: "Closed".into(),
            description: None,
            start_date: now - Duration::days(3),
            end_date: now - Duration::days(1),
            creator_id: 1,
            creator_username: "ghost".into(),
            created_at: now - Duration::days(3),
            entry_count: 3,
        })
    }
    async fn list_contests(
        &self,
        _filter: ContestFilter,
        _now: DateTime<Utc>,
        _limit: i64,
    ) -> AppResult<Vec<ContestRecord>> {
        unavailable()
    }
    async fn create_entry(&self, _entry: NewEntry<'_>) -> AppResult<EntryRecord> {
        unavailable()
    }
    async fn get_entry(&self, _entry_id: i64, _viewer: Option<i64>) -> AppResult<EntryRecord> {
        unavailable()
    }
    async fn list_entries(&self, _query: EntryQuery) -> AppResult<EntryPage> {
        unavailable()
    }
    async fn toggle_like(&self, _user_id: i64, _entry_id: i64) -> AppResult<LikeToggle> {
        unavailable()
    }
    async fn contest_standings(&self, _contest_id: i64) -> AppResult<Vec<RankInput>> {
        unavailable()
    }
    async fn ended_contest_standings(
        &self,
        _now: DateTime<Utc>,
        _participant: Option<i64>,
    ) -> AppResult<Vec<ContestStanding>> {
        unavailable()
    }
}

#[tokio::test]
async fn failed_ranking_reads_surface_as_unavailable() {
    let state = AppState::new(
        Arc::new(UnavailableStore),
        AccessPolicy::default(),
        String::new(),
        Duration::hours(1),
    );
    let app = app_router(state);

    for uri in [
        "/users/ghost/trophies",
        "/users/ghost",
        "/contests/7/winners",
        "/contests/7/standings",
    ] {
        let (status, body) = send(&app, "GET", uri, None, None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{uri}");
        assert!(
            body["message"]
                .as_str()
                .is_some_and(|m| m.starts_with("data unavailable")),
            "{uri}: {body}"
        );
        assert!(body.get("gold").is_none(), "{uri}");
        assert!(body.get("trophies").is_none(), "{uri}");
    }
}
