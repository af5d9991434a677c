//! Who may change what.

use serde::{Deserialize, Serialize};

use crate::api::{Resource, ResourceStatus};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Admin,
  Reviewer,
  #[default]
  Author,
  Viewer,
}

/// The user on whose behalf mutations run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
  pub id: String,
  #[serde(default)]
  pub role: Role,
}

impl Actor {
  pub fn new(id: impl Into<String>, role: Role) -> Self {
    Self {
      id: id.into(),
      role,
    }
  }

  pub fn owns(&self, resource: &Resource) -> bool {
    self.id == resource.author_id
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
  pub allowed: bool,
  pub reason: Option<String>,
}

impl Decision {
  pub fn allow() -> Self {
    Self {
      allowed: true,
      reason: None,
    }
  }

  pub fn deny(reason: impl Into<String>) -> Self {
    Self {
      allowed: false,
      reason: Some(reason.into()),
    }
  }

  pub fn into_result(self) -> Result<()> {
    if self.allowed {
      return Ok(());
    }
    Err(Error::PermissionDenied(
      self.reason.unwrap_or_else(|| "not allowed".to_string()),
    ))
  }
}

/// Permission checks run before any optimistic change is applied.
pub trait Permissions: Send + Sync {
  fn can_create(&self, actor: &Actor) -> Decision;

  fn can_edit(&self, actor: &Actor, resource: &Resource) -> Decision;

  fn can_delete(&self, actor: &Actor, resource: &Resource) -> Decision;

  /// Status changes are edits unless a policy says otherwise.
  fn can_change_status(
    &self,
    actor: &Actor,
    resource: &Resource,
    _status: ResourceStatus,
  ) -> Decision {
    self.can_edit(actor, resource)
  }
}

/// Role-based policy for the marketplace.
///
/// Authors manage their own work and may submit it for review; reviewers
/// edit and publish or reject anything not owned by the system; system
/// resources belong to admins alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct RolePermissions;

const SYSTEM_ONLY: &str = "system resources can only be changed by an admin";

impl Permissions for RolePermissions {
  fn can_create(&self, actor: &Actor) -> Decision {
    match actor.role {
      Role::Viewer => Decision::deny("viewers cannot create resources"),
      _ => Decision::allow(),
    }
  }

  fn can_edit(&self, actor: &Actor, resource: &Resource) -> Decision {
    match actor.role {
      Role::Admin => Decision::allow(),
      _ if resource.is_system_owned() => Decision::deny(SYSTEM_ONLY),
      Role::Reviewer => Decision::allow(),
      Role::Author if actor.owns(resource) => Decision::allow(),
      Role::Author => Decision::deny("authors can only edit their own resources"),
      Role::Viewer => Decision::deny("viewers cannot edit resources"),
    }
  }

  fn can_delete(&self, actor: &Actor, resource: &Resource) -> Decision {
    match actor.role {
      Role::Admin => Decision::allow(),
      _ if resource.is_system_owned() => Decision::deny(SYSTEM_ONLY),
      Role::Author if actor.owns(resource) => Decision::allow(),
      Role::Author => Decision::deny("authors can only delete their own resources"),
      Role::Reviewer => Decision::deny("reviewers cannot delete resources"),
      Role::Viewer => Decision::deny("viewers cannot delete resources"),
    }
  }

  fn can_change_status(
    &self,
    actor: &Actor,
    resource: &Resource,
    status: ResourceStatus,
  ) -> Decision {
    let decision = self.can_edit(actor, resource);
    if !decision.allowed || actor.role != Role::Author {
      return decision;
    }
    match status {
      ResourceStatus::Draft | ResourceStatus::Pending => decision,
      ResourceStatus::Published | ResourceStatus::Rejected => {
        Decision::deny("only reviewers can publish or reject resources")
      }
    }
  }
}
