//! Single-team membership store used when no teams service is configured.

use serde::{Deserialize, Serialize};
use std::path::Path;

use nexis_common::{Error, Result};

use super::{now_iso, JsonFileStore};

pub const DEFAULT_TEAM_ID: &str = "default";
pub const DEFAULT_TEAM_NAME: &str = "Nexis Cloud Team";
pub const FALLBACK_OWNER_EMAIL: &str = "owner@nexis.local";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamRole {
    Admin,
    Editor,
    Viewer,
}

impl TeamRole {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(TeamRole::Admin),
            "editor" => Some(TeamRole::Editor),
            "viewer" => Some(TeamRole::Viewer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Active,
    Invited,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
    pub id: String,
    pub email: String,
    pub role: TeamRole,
    pub status: MemberStatus,
    pub invited_at: String,
    pub joined_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamRecord {
    pub id: String,
    pub name: String,
    pub members: Vec<TeamMember>,
    pub created_at: String,
    pub updated_at: String,
}

impl TeamRecord {
    pub fn member_role(&self, member_id: &str) -> Option<TeamRole> {
        self.members.iter().find(|m| m.id == member_id).map(|m| m.role)
    }

    fn admin_count(&self) -> usize {
        self.members.iter().filter(|m| m.role == TeamRole::Admin).count()
    }

    fn member_index(&self, member_id: &str) -> Result<usize> {
        self.members
            .iter()
            .position(|m| m.id == member_id)
            .ok_or_else(|| Error::NotFound {
                kind: "team member".to_string(),
                id: member_id.to_string(),
            })
    }
}

/// Store at `<data>/teams/team.json`
#[derive(Debug, Clone)]
pub struct TeamStore {
    file: JsonFileStore<Option<TeamRecord>>,
}

impl TeamStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            file: JsonFileStore::new(data_dir.join("teams").join("team.json")),
        }
    }

    /// Existing team, or a new one with `owner_id` as its only admin.
    pub async fn get_or_create(&self, owner_id: &str, owner_email: Option<&str>) -> Result<TeamRecord> {
        if let Some(team) = self.file.read().await {
            return Ok(team);
        }
        let now = now_iso();
        let team = TeamRecord {
            id: DEFAULT_TEAM_ID.to_string(),
            name: DEFAULT_TEAM_NAME.to_string(),
            members: vec![TeamMember {
                id: owner_id.to_string(),
                email: owner_email
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or(FALLBACK_OWNER_EMAIL)
                    .to_string(),
                role: TeamRole::Admin,
                status: MemberStatus::Active,
                invited_at: now.clone(),
                joined_at: Some(now.clone()),
            }],
            created_at: now.clone(),
            updated_at: now,
        };
        self.file.write(&Some(team.clone())).await?;
        Ok(team)
    }

    /// Persist `team` with a fresh `updatedAt`.
    pub async fn update(&self, mut team: TeamRecord) -> Result<TeamRecord> {
        team.updated_at = now_iso();
        self.file.write(&Some(team.clone())).await?;
        Ok(team)
    }

    pub async fn invite(&self, team: TeamRecord, email: &str, role: TeamRole) -> Result<TeamRecord> {
        let email = email.trim().to_ascii_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(Error::validation("A valid email is required."));
        }
        if team.members.iter().any(|m| m.email.eq_ignore_ascii_case(&email)) {
            return Err(Error::validation(format!("{email} is already a member.")));
        }
        let mut team = team;
        team.members.push(TeamMember {
            id: uuid::Uuid::new_v4().to_string(),
            email,
            role,
            status: MemberStatus::Invited,
            invited_at: now_iso(),
            joined_at: None,
        });
        self.update(team).await
    }

    pub async fn set_role(&self, team: TeamRecord, member_id: &str, role: TeamRole) -> Result<TeamRecord> {
        let mut team = team;
        let index = team.member_index(member_id)?;
        if team.members[index].role == TeamRole::Admin && role != TeamRole::Admin && team.admin_count() == 1 {
            return Err(Error::validation("A team needs at least one admin."));
        }
        team.members[index].role = role;
        self.update(team).await
    }

    pub async fn remove(&self, team: TeamRecord, member_id: &str) -> Result<TeamRecord> {
        let mut team = team;
        let index = team.member_index(member_id)?;
        if team.members[index].role == TeamRole::Admin && team.admin_count() == 1 {
            return Err(Error::validation("A team needs at least one admin."));
        }
        team.members.remove(index);
        self.update(team).await
    }
}
