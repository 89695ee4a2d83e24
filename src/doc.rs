//! OpenAPI / Swagger documentation definitions.
use crate::ranking::{Medal, TrophyTally};
use crate::roles::Role;
use crate::types::{
    ContestPhase, ContestResponse, CreateContestRequest, CreateEntryRequest, EntryPageResponse,
    EntryResponse, GrantRoleRequest, LikeResponse, LoginRequest, LoginResponse, ProfileResponse,
    RoleBadge, SignupRequest, StandingItem, StandingsResponse, SubscriptionRequest,
    UpdateProfileRequest, UserView, WinnersResponse,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        health_doc,
        signup_doc,
        login_doc,
        me_doc,
        update_me_doc,
        user_profile_doc,
        user_trophies_doc,
        create_contest_doc,
        list_contests_doc,
        get_contest_doc,
        create_entry_doc,
        list_entries_doc,
        standings_doc,
        winners_doc,
        toggle_like_doc,
        grant_role_doc,
        revoke_role_doc,
        set_subscription_doc
    ),
    components(
        schemas(
            SignupRequest,
            LoginRequest,
            LoginResponse,
            UserView,
            RoleBadge,
            Role,
            ProfileResponse,
            UpdateProfileRequest,
            TrophyTally,
            Medal,
            ContestPhase,
            CreateContestRequest,
            ContestResponse,
            CreateEntryRequest,
            EntryResponse,
            EntryPageResponse,
            StandingItem,
            StandingsResponse,
            WinnersResponse,
            LikeResponse,
            GrantRoleRequest,
            SubscriptionRequest
        )
    ),
    tags(
        (name = "photocontest", description = "Photo contest API")
    )
)]
pub struct ApiDoc;

// Doc-only shim functions so utoipa can pick up signatures.
#[utoipa::path(get, path = "/health", responses((status = 200, description = "OK")))]
pub async fn health_doc() {}

#[utoipa::path(
    post,
    path = "/auth/signup",
    request_body = SignupRequest,
    responses((status = 200, body = LoginResponse), (status = 409, description = "Username taken"))
)]
pub async fn signup_doc() {}

#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses((status = 200, body = LoginResponse), (status = 401, description = "Bad credentials"))
)]
pub async fn login_doc() {}

#[utoipa::path(get, path = "/auth/me", responses((status = 200, body = UserView)))]
pub async fn me_doc() {}

#[utoipa::path(
    patch,
    path = "/users/me",
    request_body = UpdateProfileRequest,
    responses((status = 200, body = UserView))
)]
pub async fn update_me_doc() {}

#[utoipa::path(
    get,
    path = "/users/{username}",
    params(("username" = String, Path, description = "Username")),
    responses((status = 200, body = ProfileResponse))
)]
pub async fn user_profile_doc() {}

#[utoipa::path(
    get,
    path = "/users/{username}/trophies",
    params(("username" = String, Path, description = "Username")),
    responses((status = 200, body = TrophyTally))
)]
pub async fn user_trophies_doc() {}

#[utoipa::path(
    post,
    path = "/contests",
    request_body = CreateContestRequest,
    responses((status = 200, body = ContestResponse))
)]
pub async fn create_contest_doc() {}

#[utoipa::path(
    get,
    path = "/contests",
    params(
        ("filter" = Option<String>, Query, description = "active | ended"),
        ("limit" = Option<i64>, Query, description = "Max contests")
    ),
    responses((status = 200, body = [ContestResponse]))
)]
pub async fn list_contests_doc() {}

#[utoipa::path(
    get,
    path = "/contests/{id}",
    params(("id" = i64, Path, description = "Contest id")),
    responses((status = 200, body = ContestResponse))
)]
pub async fn get_contest_doc() {}

#[utoipa::path(
    post,
    path = "/contests/{id}/entries",
    params(("id" = i64, Path, description = "Contest id")),
    request_body = CreateEntryRequest,
    responses((status = 200, body = EntryResponse), (status = 409, description = "Already entered"))
)]
pub async fn create_entry_doc() {}

#[utoipa::path(
    get,
    path = "/contests/{id}/entries",
    params(
        ("id" = i64, Path, description = "Contest id"),
        ("sort" = Option<String>, Query, description = "newest | oldest | likes_desc | likes_asc | trophy (podium once ended, newest before)"),
        ("cursor" = Option<i64>, Query, description = "Last entry id of the previous page"),
        ("limit" = Option<i64>, Query, description = "Page size")
    ),
    responses((status = 200, body = EntryPageResponse))
)]
pub async fn list_entries_doc() {}

#[utoipa::path(
    get,
    path = "/contests/{id}/standings",
    params(("id" = i64, Path, description = "Contest id")),
    responses((status = 200, body = StandingsResponse))
)]
pub async fn standings_doc() {}

#[utoipa::path(
    get,
    path = "/contests/{id}/winners",
    params(("id" = i64, Path, description = "Contest id")),
    responses((status = 200, body = WinnersResponse), (status = 400, description = "Contest still running"))
)]
pub async fn winners_doc() {}

#[utoipa::path(
    post,
    path = "/entries/{id}/like",
    params(("id" = i64, Path, description = "Entry id")),
    responses((status = 200, body = LikeResponse))
)]
pub async fn toggle_like_doc() {}

#[utoipa::path(
    post,
    path = "/admin/users/{id}/roles",
    params(("id" = i64, Path, description = "User id")),
    request_body = GrantRoleRequest,
    responses((status = 200, body = UserView), (status = 403, description = "Missing capability"))
)]
pub async fn grant_role_doc() {}

#[utoipa::path(
    delete,
    path = "/admin/users/{id}/roles/{role}",
    params(
        ("id" = i64, Path, description = "User id"),
        ("role" = String, Path, description = "Role id")
    ),
    responses((status = 200, body = UserView), (status = 403, description = "Missing capability"))
)]
pub async fn revoke_role_doc() {}

#[utoipa::path(
    put,
    path = "/admin/users/{id}/subscription",
    params(("id" = i64, Path, description = "User id")),
    request_body = SubscriptionRequest,
    responses((status = 200, body = UserView), (status = 403, description = "Missing capability"))
)]
pub async fn set_subscription_doc() {}
