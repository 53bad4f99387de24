//! Users, groups and memberships

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::engine::EngineContext;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            first_name: None,
            last_name: None,
            email: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: Option<String>,
    /// Free-form classification, e.g. `assignment` or `security-role`
    pub group_type: Option<String>,
}

impl Group {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            group_type: None,
        }
    }
}

/// Manages users and groups; candidate task queries resolve through it
#[derive(Clone)]
pub struct IdentityService {
    ctx: Arc<EngineContext>,
}

impl IdentityService {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Insert or replace a user
    #[instrument(skip(self, user), fields(user_id = %user.id))]
    pub async fn save_user(&self, user: &User) -> Result<()> {
        if user.id.trim().is_empty() {
            return Err(EngineError::IllegalArgument("user id must not be empty".into()));
        }
        self.ctx.store.save_user(user).await?;
        debug!("saved user");
        Ok(())
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>> {
        Ok(self.ctx.store.find_user(id).await?)
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        Ok(self.ctx.store.list_users().await?)
    }

    /// Delete a user and their memberships
    pub async fn delete_user(&self, id: &str) -> Result<()> {
        Ok(self.ctx.store.delete_user(id).await?)
    }

    #[instrument(skip(self, group), fields(group_id = %group.id))]
    pub async fn save_group(&self, group: &Group) -> Result<()> {
        if group.id.trim().is_empty() {
            return Err(EngineError::IllegalArgument("group id must not be empty".into()));
        }
        self.ctx.store.save_group(group).await?;
        debug!("saved group");
        Ok(())
    }

    pub async fn get_group(&self, id: &str) -> Result<Option<Group>> {
        Ok(self.ctx.store.find_group(id).await?)
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>> {
        Ok(self.ctx.store.list_groups().await?)
    }

    /// Delete a group and its memberships
    pub async fn delete_group(&self, id: &str) -> Result<()> {
        Ok(self.ctx.store.delete_group(id).await?)
    }

    /// Both user and group must exist
    pub async fn create_membership(&self, user_id: &str, group_id: &str) -> Result<()> {
        Ok(self.ctx.store.create_membership(user_id, group_id).await?)
    }

    pub async fn delete_membership(&self, user_id: &str, group_id: &str) -> Result<()> {
        Ok(self.ctx.store.delete_membership(user_id, group_id).await?)
    }

    pub async fn groups_of_user(&self, user_id: &str) -> Result<Vec<Group>> {
        Ok(self.ctx.store.groups_of_user(user_id).await?)
    }

    pub async fn users_of_group(&self, group_id: &str) -> Result<Vec<User>> {
        Ok(self.ctx.store.users_of_group(group_id).await?)
    }
}
