//! Table-level access control
//!
//! Every workflow endpoint declares the table it touches and the action it
//! performs. The configured admin role may do anything; other roles get
//! explicit grants of the form `role:table:actions`, e.g.
//! `buyer:workflow.alerts:read,update;auditor:*:read`.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::middleware::AuthUser;
use crate::error::{ApiResult, AppError};

/// Tables guarded by table permissions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    AutomationRules,
    RuleActions,
    ActionEdges,
    ActionTemplates,
    Executions,
    Alerts,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutomationRules => "workflow.automation_rules",
            Self::RuleActions => "workflow.rule_actions",
            Self::ActionEdges => "workflow.action_edges",
            Self::ActionTemplates => "workflow.action_templates",
            Self::Executions => "workflow.executions",
            Self::Alerts => "workflow.alerts",
        }
    }
}

/// Actions that can be performed on a table
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TableAction {
    Create,
    Read,
    Update,
    Delete,
}

impl TableAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "create" => Some(Self::Create),
            "read" => Some(Self::Read),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Decides whether a caller may perform an action on a table.
pub trait TablePermissions: Send + Sync {
    fn allows(&self, user: &AuthUser, table: Table, action: TableAction) -> bool;
}

/// Admin-role-plus-grants permission set, built from configuration.
#[derive(Debug, Clone, Default)]
pub struct RoleTablePermissions {
    admin_role: String,
    // role name -> table ("*" for any) -> actions
    grants: HashMap<String, HashMap<String, HashSet<TableAction>>>,
}

impl RoleTablePermissions {
    pub fn new(admin_role: impl Into<String>) -> Self {
        Self {
            admin_role: admin_role.into(),
            grants: HashMap::new(),
        }
    }

    pub fn grant(mut self, role: &str, table: &str, actions: &[TableAction]) -> Self {
        self.grants
            .entry(role.to_string())
            .or_default()
            .entry(table.to_string())
            .or_default()
            .extend(actions.iter().copied());
        self
    }

    /// Parses `role:table:action,action;...`. Malformed entries are logged and skipped.
    pub fn with_grants(mut self, spec: &str) -> Self {
        for entry in spec.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let parts: Vec<&str> = entry.splitn(3, ':').collect();
            let [role, table, actions] = parts.as_slice() else {
                tracing::warn!(%entry, "Ignoring malformed table grant");
                continue;
            };
            let actions: Vec<TableAction> = actions.split(',').filter_map(TableAction::parse).collect();
            if actions.is_empty() {
                tracing::warn!(%entry, "Table grant names no known actions");
                continue;
            }
            self = self.grant(role.trim(), table.trim(), &actions);
        }
        self
    }
}

impl TablePermissions for RoleTablePermissions {
    fn allows(&self, user: &AuthUser, table: Table, action: TableAction) -> bool {
        user.role_names.iter().any(|role| {
            if *role == self.admin_role {
                return true;
            }
            let Some(tables) = self.grants.get(role) else {
                return false;
            };
            [table.as_str(), "*"]
                .iter()
                .filter_map(|t| tables.get(*t))
                .any(|actions| actions.contains(&action))
        })
    }
}

/// Fails with `PermissionDenied` unless `user` may perform `action` on `table`.
pub fn require(
    permissions: &dyn TablePermissions,
    user: &AuthUser,
    table: Table,
    action: TableAction,
) -> ApiResult<()> {
    if permissions.allows(user, table, action) {
        Ok(())
    } else {
        tracing::debug!(
            user_id = %user.user_id,
            table = table.as_str(),
            action = action.as_str(),
            "Table permission denied"
        );
        Err(AppError::PermissionDenied(format!(
            "Not permitted to {} {}",
            action.as_str(),
            table.as_str()
        )))
    }
}
