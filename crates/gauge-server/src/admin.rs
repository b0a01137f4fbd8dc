use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use gauge_store::{UserFilter, UserUpdate};
use gauge_types::{
    is_recognized_setting, required_unit_type, OrgUnitRecord, OrgUnitType, UserRole,
};

use crate::auth::{hash_api_key, new_api_key_token, require_admin, require_ui, token_prefix};
use crate::{ApiError, ApiResult, AppState};

async fn unit_to_json(state: &AppState, unit: &OrgUnitRecord) -> ApiResult<Value> {
    // Teams carry an explicit manager; departments and sectors surface the
    // GM/VP assigned to them.
    let manager = match unit.unit_type {
        OrgUnitType::Team => match &unit.manager_user_id {
            Some(id) => state.store.get_user(id).await?,
            None => None,
        },
        OrgUnitType::Department | OrgUnitType::Sector => {
            let role = if unit.unit_type == OrgUnitType::Department {
                UserRole::Gm
            } else {
                UserRole::Vp
            };
            state
                .store
                .list_users(&UserFilter {
                    role: Some(role),
                    team_unit_id: Some(unit.id.clone()),
                    ..Default::default()
                })
                .await?
                .into_iter()
                .find(|u| u.is_active)
        }
    };

    Ok(json!({
        "id": unit.id,
        "name": unit.name,
        "type": unit.unit_type,
        "parent_id": unit.parent_id,
        "manager": manager.map(|m| json!({
            "id": m.id,
            "email": m.email,
            "display_name": m.display_name,
        })),
        "created_at": unit.created_at.to_rfc3339(),
    }))
}

/// `GET /v1/admin/org/tree`: Sector, then Department, then Team.
pub async fn org_tree(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    let principal = require_ui(&state, &headers).await?;
    require_admin(&principal)?;

    let sectors = state.store.list_org_units_by_type(OrgUnitType::Sector).await?;
    let mut tree = Vec::new();
    for sector in &sectors {
        let mut sector_node = unit_to_json(&state, sector).await?;
        let mut dept_nodes = Vec::new();
        for dept in state.store.list_children(&sector.id).await? {
            let mut dept_node = unit_to_json(&state, &dept).await?;
            let mut team_nodes = Vec::new();
            for team in state.store.list_children(&dept.id).await? {
                team_nodes.push(unit_to_json(&state, &team).await?);
            }
            dept_node["children"] = Value::Array(team_nodes);
            dept_nodes.push(dept_node);
        }
        sector_node["children"] = Value::Array(dept_nodes);
        tree.push(sector_node);
    }
    Ok(Json(json!({ "tree": tree })))
}

pub async fn list_teams(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let principal = require_ui(&state, &headers).await?;
    require_admin(&principal)?;

    let teams = state.store.list_org_units_by_type(OrgUnitType::Team).await?;
    let mut out = Vec::new();
    for team in &teams {
        out.push(unit_to_json(&state, team).await?);
    }
    Ok(Json(json!({ "teams": out })))
}

#[derive(Debug, Deserialize)]
pub struct CreateOrgUnitRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub unit_type: OrgUnitType,
    #[serde(default)]
    pub parent_id: Option<String>,
}

async fn validate_parent(
    state: &AppState,
    unit_type: OrgUnitType,
    parent_id: Option<&str>,
) -> ApiResult<()> {
    match unit_type {
        OrgUnitType::Sector => {
            if parent_id.is_some() {
                return Err(ApiError::BadRequest("Sector cannot have a parent".to_string()));
            }
        }
        OrgUnitType::Department => {
            let Some(parent_id) = parent_id else {
                return Err(ApiError::BadRequest(
                    "Department requires a parent Sector".to_string(),
                ));
            };
            let parent = state.store.get_org_unit(parent_id).await?;
            if parent.map(|p| p.unit_type) != Some(OrgUnitType::Sector) {
                return Err(ApiError::BadRequest(
                    "Department parent must be a Sector".to_string(),
                ));
            }
        }
        OrgUnitType::Team => {
            let Some(parent_id) = parent_id else {
                return Err(ApiError::BadRequest(
                    "Team requires a parent Department".to_string(),
                ));
            };
            let parent = state.store.get_org_unit(parent_id).await?;
            if parent.map(|p| p.unit_type) != Some(OrgUnitType::Department) {
                return Err(ApiError::BadRequest(
                    "Team parent must be a Department".to_string(),
                ));
            }
        }
    }
    Ok(())
}

pub async fn create_org_unit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateOrgUnitRequest>,
) -> ApiResult<Json<Value>> {
    let principal = require_ui(&state, &headers).await?;
    require_admin(&principal)?;

    validate_parent(&state, req.unit_type, req.parent_id.as_deref()).await?;
    let unit = state
        .store
        .create_org_unit(&req.name, req.unit_type, req.parent_id.as_deref())
        .await?;
    state
        .store
        .append_audit(
            principal.user.as_ref().map(|u| u.id.as_str()),
            "org.unit.create",
            "org_unit",
            &unit.id,
            &json!({}),
            &json!({"name": unit.name, "type": unit.unit_type}),
        )
        .await?;
    unit_to_json(&state, &unit).await.map(Json)
}

#[derive(Debug, Deserialize)]
pub struct UpdateOrgUnitRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
}

pub async fn update_org_unit(
    State(state): State<AppState>,
    Path(unit_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<UpdateOrgUnitRequest>,
) -> ApiResult<Json<Value>> {
    let principal = require_ui(&state, &headers).await?;
    require_admin(&principal)?;

    let unit = state
        .store
        .get_org_unit(&unit_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("org unit not found".to_string()))?;

    if let Some(name) = &req.name {
        state.store.rename_org_unit(&unit_id, name).await?;
    }

    if let Some(new_parent) = &req.parent_id {
        if Some(new_parent.clone()) != unit.parent_id {
            if unit.unit_type == OrgUnitType::Sector {
                return Err(ApiError::BadRequest("Cannot move a Sector".to_string()));
            }
            validate_parent(&state, unit.unit_type, Some(new_parent)).await?;
            state.store.move_org_unit(&unit_id, new_parent).await?;
        }
    }

    let updated = state
        .store
        .get_org_unit(&unit_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("org unit not found".to_string()))?;
    unit_to_json(&state, &updated).await.map(Json)
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn delete_org_unit(
    State(state): State<AppState>,
    Path(unit_id): Path<String>,
    Query(query): Query<DeleteQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let principal = require_ui(&state, &headers).await?;
    require_admin(&principal)?;

    let unit = state
        .store
        .get_org_unit(&unit_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("org unit not found".to_string()))?;

    let children = state.store.count_children(&unit_id).await?;
    if children > 0 && !query.force {
        return Err(ApiError::BadRequest(format!(
            "org unit has {children} child unit(s); pass force=true to orphan them"
        )));
    }
    if unit.unit_type == OrgUnitType::Team {
        let members = state.store.count_team_members(&unit_id).await?;
        if members > 0 && !query.force {
            return Err(ApiError::BadRequest(format!(
                "team has {members} assigned user(s); pass force=true to unassign them"
            )));
        }
        if members > 0 {
            state.store.clear_team_members(&unit_id).await?;
        }
    }
    if children > 0 {
        state.store.orphan_children(&unit_id).await?;
    }

    state.store.delete_org_unit(&unit_id).await?;
    state
        .store
        .append_audit(
            principal.user.as_ref().map(|u| u.id.as_str()),
            "org.unit.delete",
            "org_unit",
            &unit_id,
            &json!({"name": unit.name}),
            &json!({}),
        )
        .await?;
    Ok(Json(json!({ "ok": true, "deleted_id": unit_id })))
}

#[derive(Debug, Deserialize)]
pub struct AssignManagerRequest {
    #[serde(default)]
    pub manager_user_id: Option<String>,
}

/// `PUT /v1/admin/org/teams/{team_id}/manager`: at most one managed team
/// per user and one manager per team.
pub async fn assign_team_manager(
    State(state): State<AppState>,
    Path(team_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<AssignManagerRequest>,
) -> ApiResult<Json<Value>> {
    let principal = require_ui(&state, &headers).await?;
    require_admin(&principal)?;

    let team = state
        .store
        .get_org_unit(&team_id)
        .await?
        .filter(|u| u.unit_type == OrgUnitType::Team)
        .ok_or_else(|| ApiError::NotFound("team not found".to_string()))?;

    if let Some(new_manager) = &req.manager_user_id {
        let user = state
            .store
            .get_user(new_manager)
            .await?
            .ok_or_else(|| ApiError::BadRequest("user not found".to_string()))?;

        if let Some(other) = state.store.other_team_managed_by(&user.id, &team_id).await? {
            return Err(ApiError::BadRequest(format!(
                "user is already manager of team '{}'; remove them first",
                other.name
            )));
        }

        state
            .store
            .update_user(
                &user.id,
                &UserUpdate {
                    role: Some(UserRole::Manager),
                    team_unit_id: Some(Some(team_id.clone())),
                    ..Default::default()
                },
            )
            .await?;
    }

    // Demote a replaced manager back to employee.
    if let Some(old_manager_id) = &team.manager_user_id {
        if req.manager_user_id.as_deref() != Some(old_manager_id) {
            if let Some(old) = state.store.get_user(old_manager_id).await? {
                if old.role == UserRole::Manager {
                    state
                        .store
                        .update_user(
                            &old.id,
                            &UserUpdate {
                                role: Some(UserRole::Employee),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
            }
        }
    }

    // Any other MANAGER-role members of this team lose the role too.
    let other_managers = state
        .store
        .list_users(&UserFilter {
            role: Some(UserRole::Manager),
            team_unit_id: Some(team_id.clone()),
            ..Default::default()
        })
        .await?;
    for manager in other_managers {
        if Some(&manager.id) != req.manager_user_id.as_ref() {
            state
                .store
                .update_user(
                    &manager.id,
                    &UserUpdate {
                        role: Some(UserRole::Employee),
                        ..Default::default()
                    },
                )
                .await?;
        }
    }

    state
        .store
        .set_team_manager(&team_id, req.manager_user_id.as_deref())
        .await?;
    state
        .store
        .append_audit(
            principal.user.as_ref().map(|u| u.id.as_str()),
            "org.team.assign_manager",
            "org_unit",
            &team_id,
            &json!({"manager_user_id": team.manager_user_id}),
            &json!({"manager_user_id": req.manager_user_id}),
        )
        .await?;

    let updated = state
        .store
        .get_org_unit(&team_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("team not found".to_string()))?;
    unit_to_json(&state, &updated).await.map(Json)
}

pub async fn rebuild_closure(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let principal = require_ui(&state, &headers).await?;
    require_admin(&principal)?;
    let count = state.store.rebuild_closure().await?;
    Ok(Json(json!({ "ok": true, "closure_entries": count })))
}

#[derive(Debug, Deserialize)]
pub struct ListUsersQuery {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<UserRole>,
    #[serde(default)]
    pub team_id: Option<String>,
}

async fn user_to_json(state: &AppState, user: &gauge_types::UserRecord) -> ApiResult<Value> {
    let team = match &user.team_unit_id {
        Some(id) => state
            .store
            .get_org_unit(id)
            .await?
            .map(|t| json!({"id": t.id, "name": t.name})),
        None => None,
    };
    Ok(json!({
        "id": user.id,
        "email": user.email,
        "display_name": user.display_name,
        "title": user.title,
        "role": user.role,
        "team": team,
        "is_active": user.is_active,
        "created_at": user.created_at.to_rfc3339(),
    }))
}

pub async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<ListUsersQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let principal = require_ui(&state, &headers).await?;
    require_admin(&principal)?;

    let users = state
        .store
        .list_users(&UserFilter {
            email_contains: query.email,
            role: query.role,
            team_unit_id: query.team_id,
        })
        .await?;
    let mut out = Vec::with_capacity(users.len());
    for user in &users {
        out.push(user_to_json(&state, user).await?);
    }
    Ok(Json(json!({ "users": out })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub role: Option<UserRole>,
    #[serde(default)]
    pub team_unit_id: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

async fn validate_unit_for_role(
    state: &AppState,
    unit_id: Option<&str>,
    role: UserRole,
) -> ApiResult<()> {
    let Some(unit_id) = unit_id else {
        return Ok(());
    };
    if role == UserRole::Admin {
        return Err(ApiError::BadRequest(
            "admin users should not be assigned to an org unit".to_string(),
        ));
    }
    let unit = state
        .store
        .get_org_unit(unit_id)
        .await?
        .ok_or_else(|| ApiError::BadRequest("org unit not found".to_string()))?;
    if let Some(expected) = required_unit_type(role) {
        if unit.unit_type != expected {
            return Err(ApiError::BadRequest(format!(
                "{} must be assigned to a {}",
                role.as_str(),
                expected.display_name()
            )));
        }
    }
    Ok(())
}

/// `PATCH /v1/admin/users/{id}`: role/team updates with the role-to-org-type
/// matrix enforced and the team manager pointer kept in sync.
pub async fn update_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<UpdateUserRequest>,
) -> ApiResult<Json<Value>> {
    let principal = require_ui(&state, &headers).await?;
    require_admin(&principal)?;

    let user = state
        .store
        .get_user(&user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("user not found".to_string()))?;

    let mut update = UserUpdate::default();

    if let Some(email) = &req.email {
        let email = email.trim().to_lowercase();
        if let Some(existing) = state.store.get_user_by_email(&email).await? {
            if existing.id != user_id {
                return Err(ApiError::BadRequest("email already in use".to_string()));
            }
        }
        update.email = Some(email);
    }
    update.display_name = req.display_name.clone();
    update.is_active = req.is_active;

    let old_role = user.role;
    let old_team = user.team_unit_id.clone();

    let final_role = req.role.unwrap_or(user.role);
    let mut final_team = match &req.team_unit_id {
        Some(id) if id.is_empty() => None,
        Some(id) => Some(id.clone()),
        None => user.team_unit_id.clone(),
    };
    if final_role == UserRole::Admin {
        final_team = None;
    }

    validate_unit_for_role(&state, final_team.as_deref(), final_role).await?;

    update.role = req.role;
    if req.team_unit_id.is_some() || final_role == UserRole::Admin {
        update.team_unit_id = Some(final_team.clone());
    }

    // Promotion to manager claims the team's manager slot, which must be free.
    if final_role == UserRole::Manager {
        if let Some(team_id) = &final_team {
            if let Some(other) = state.store.other_team_managed_by(&user_id, team_id).await? {
                return Err(ApiError::BadRequest(format!(
                    "user is already manager of team '{}'; remove them first",
                    other.name
                )));
            }
            let team = state
                .store
                .get_org_unit(team_id)
                .await?
                .ok_or_else(|| ApiError::BadRequest("org unit not found".to_string()))?;
            if let Some(current) = &team.manager_user_id {
                if current != &user_id {
                    let name = state
                        .store
                        .get_user(current)
                        .await?
                        .map(|u| {
                            if u.display_name.is_empty() {
                                u.email
                            } else {
                                u.display_name
                            }
                        })
                        .unwrap_or_else(|| "another user".to_string());
                    return Err(ApiError::BadRequest(format!(
                        "team '{}' already has a manager: {name}; remove them first",
                        team.name
                    )));
                }
            }
            state.store.set_team_manager(team_id, Some(&user_id)).await?;
        }
    }

    // Leaving the manager role (or the team) releases the old slot.
    if old_role == UserRole::Manager {
        if let Some(old_team_id) = &old_team {
            if final_role != UserRole::Manager || final_team.as_ref() != Some(old_team_id) {
                let old_team_unit = state.store.get_org_unit(old_team_id).await?;
                if old_team_unit.and_then(|t| t.manager_user_id) == Some(user_id.clone()) {
                    state.store.set_team_manager(old_team_id, None).await?;
                }
            }
        }
    }

    let updated = state.store.update_user(&user_id, &update).await?;
    user_to_json(&state, &updated).await.map(Json)
}

pub async fn get_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let principal = require_ui(&state, &headers).await?;
    require_admin(&principal)?;

    let settings: serde_json::Map<String, Value> = state
        .store
        .all_settings()
        .await?
        .into_iter()
        .map(|(k, v)| (k, json!(v)))
        .collect();
    Ok(Json(json!({ "settings": settings })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSettingsRequest {
    #[serde(default)]
    pub settings: std::collections::BTreeMap<String, String>,
}

pub async fn update_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UpdateSettingsRequest>,
) -> ApiResult<Json<Value>> {
    let principal = require_ui(&state, &headers).await?;
    require_admin(&principal)?;

    for (key, value) in &req.settings {
        if !is_recognized_setting(key) {
            return Err(ApiError::BadRequest(format!("unknown setting: {key}")));
        }
        state.store.set_setting(key, value).await?;
    }

    let settings: serde_json::Map<String, Value> = state
        .store
        .all_settings()
        .await?
        .into_iter()
        .map(|(k, v)| (k, json!(v)))
        .collect();
    Ok(Json(json!({ "settings": settings })))
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub user_id: String,
    #[serde(default)]
    pub name: String,
}

/// `POST /v1/admin/api-keys`: mint a bearer token for engine traffic. The
/// token is returned exactly once; only prefix + hash are stored.
pub async fn create_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateApiKeyRequest>,
) -> ApiResult<Json<Value>> {
    let principal = require_ui(&state, &headers).await?;
    require_admin(&principal)?;

    let user = state
        .store
        .get_user(&req.user_id)
        .await?
        .ok_or_else(|| ApiError::BadRequest("user not found".to_string()))?;

    let token = new_api_key_token();
    let record = state
        .store
        .create_api_key(&user.id, &req.name, &token_prefix(&token), &hash_api_key(&token))
        .await?;

    Ok(Json(json!({
        "id": record.id,
        "user_id": record.user_id,
        "name": record.name,
        "prefix": record.prefix,
        "token": token,
    })))
}

pub async fn revoke_api_key(
    State(state): State<AppState>,
    Path(key_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let principal = require_ui(&state, &headers).await?;
    require_admin(&principal)?;
    state.store.revoke_api_key(&key_id).await?;
    Ok(Json(json!({ "ok": true })))
}
