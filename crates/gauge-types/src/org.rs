use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    Employee,
    Manager,
    Gm,
    Vp,
    Admin,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            UserRole::Employee => "EMPLOYEE",
            UserRole::Manager => "MANAGER",
            UserRole::Gm => "GM",
            UserRole::Vp => "VP",
            UserRole::Admin => "ADMIN",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "EMPLOYEE" => Some(UserRole::Employee),
            "MANAGER" => Some(UserRole::Manager),
            "GM" => Some(UserRole::Gm),
            "VP" => Some(UserRole::Vp),
            "ADMIN" => Some(UserRole::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrgUnitType {
    Team,
    Department,
    Sector,
}

impl OrgUnitType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrgUnitType::Team => "TEAM",
            OrgUnitType::Department => "DEPARTMENT",
            OrgUnitType::Sector => "SECTOR",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "TEAM" => Some(OrgUnitType::Team),
            "DEPARTMENT" => Some(OrgUnitType::Department),
            "SECTOR" => Some(OrgUnitType::Sector),
            _ => None,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            OrgUnitType::Team => "Team",
            OrgUnitType::Department => "Department",
            OrgUnitType::Sector => "Sector",
        }
    }
}

/// The org unit type a role must be assigned to. `None` for ADMIN, which
/// carries no org unit at all.
pub fn required_unit_type(role: UserRole) -> Option<OrgUnitType> {
    match role {
        UserRole::Employee | UserRole::Manager => Some(OrgUnitType::Team),
        UserRole::Gm => Some(OrgUnitType::Department),
        UserRole::Vp => Some(OrgUnitType::Sector),
        UserRole::Admin => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub title: String,
    pub role: UserRole,
    pub is_active: bool,
    pub team_unit_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgUnitRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub unit_type: OrgUnitType,
    pub parent_id: Option<String>,
    /// Only meaningful on TEAM units.
    pub manager_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgUnitClosureRow {
    pub ancestor_id: String,
    pub descendant_id: String,
    /// 0 = self link.
    pub depth: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub prefix: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_serializes_screaming_snake() {
        let json = serde_json::to_string(&UserRole::Gm).unwrap();
        assert_eq!(json, "\"GM\"");
        let back: UserRole = serde_json::from_str("\"EMPLOYEE\"").unwrap();
        assert_eq!(back, UserRole::Employee);
    }

    #[test]
    fn role_unit_matrix() {
        assert_eq!(required_unit_type(UserRole::Employee), Some(OrgUnitType::Team));
        assert_eq!(required_unit_type(UserRole::Manager), Some(OrgUnitType::Team));
        assert_eq!(required_unit_type(UserRole::Gm), Some(OrgUnitType::Department));
        assert_eq!(required_unit_type(UserRole::Vp), Some(OrgUnitType::Sector));
        assert_eq!(required_unit_type(UserRole::Admin), None);
    }
}
