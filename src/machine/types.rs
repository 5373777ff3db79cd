// Core value types for state transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Open key/value bag carried by contexts, results and audit records
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Opaque lifecycle state token for one entity kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(String);

impl State {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for State {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

impl From<String> for State {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl PartialEq<str> for State {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for State {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Acting principal. The tenant travels with the principal, never ambiently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub tenant: Option<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tenant: None,
        }
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }
}

/// Who is transitioning, why, and under which flags.
///
/// Built once with the `with_*` methods and then only read. A dry-run
/// variant is derived with [`TransitionContext::as_dry_run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionContext {
    principal: Option<Principal>,
    reason: String,
    comments: Option<String>,
    metadata: Metadata,
    timestamp: DateTime<Utc>,
    skip_permissions: bool,
    skip_validation: bool,
    dry_run: bool,
}

impl TransitionContext {
    pub fn new(principal: Principal, reason: impl Into<String>) -> Self {
        Self {
            principal: Some(principal),
            reason: reason.into(),
            comments: None,
            metadata: Metadata::new(),
            timestamp: Utc::now(),
            skip_permissions: false,
            skip_validation: false,
            dry_run: false,
        }
    }

    /// System-initiated transition: no principal, permission checks skipped
    pub fn system(reason: impl Into<String>) -> Self {
        Self {
            principal: None,
            reason: reason.into(),
            comments: None,
            metadata: Metadata::new(),
            timestamp: Utc::now(),
            skip_permissions: true,
            skip_validation: false,
            dry_run: false,
        }
    }

    /// No principal, permission checks still enforced. Any required
    /// permission is reported missing.
    pub fn anonymous(reason: impl Into<String>) -> Self {
        Self {
            skip_permissions: false,
            ..Self::system(reason)
        }
    }

    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_skip_permissions(mut self) -> Self {
        self.skip_permissions = true;
        self
    }

    /// Bypass every validation step. Dangerous; intended for data repair.
    pub fn with_skip_validation(mut self) -> Self {
        self.skip_validation = true;
        self
    }

    pub fn with_dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    /// Derive a dry-run copy, leaving `self` untouched
    pub fn as_dry_run(&self) -> Self {
        self.clone().with_dry_run()
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn principal_id(&self) -> Option<&str> {
        self.principal.as_ref().map(|p| p.id.as_str())
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn skip_permissions(&self) -> bool {
        self.skip_permissions
    }

    pub fn skip_validation(&self) -> bool {
        self.skip_validation
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }
}

/// Why a validation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// `(from, to)` is not an edge of the graph
    InvalidTransition,
    /// The principal lacks one or more required permissions
    PermissionDenied,
    /// Rejected by the business-rule hook
    BusinessRule,
    /// Rejected by the pre-transition hook
    PreTransition,
}

/// Outcome of a validate or execute call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionResult {
    pub success: bool,
    pub from_state: State,
    pub to_state: State,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub missing_permissions: Vec<String>,
    pub warnings: Vec<String>,
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
}

impl TransitionResult {
    pub fn success(from: State, to: State) -> Self {
        Self {
            success: true,
            from_state: from,
            to_state: to,
            error: None,
            failure_kind: None,
            missing_permissions: Vec::new(),
            warnings: Vec::new(),
            metadata: Metadata::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn failure(from: State, to: State, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            failure_kind: Some(kind),
            ..Self::success(from, to)
        }
    }

    pub fn invalid(from: State, to: State) -> Self {
        let message = format!("Invalid transition from {from} to {to}");
        Self::failure(from, to, FailureKind::InvalidTransition, message)
    }

    pub fn permission_denied(from: State, to: State, missing: Vec<String>) -> Self {
        let message = format!("Missing permission(s): {}", missing.join(", "));
        Self {
            missing_permissions: missing,
            ..Self::failure(from, to, FailureKind::PermissionDenied, message)
        }
    }

    /// Business-rule rejection, the usual failure returned by hooks
    pub fn rejected(from: State, to: State, message: impl Into<String>) -> Self {
        Self::failure(from, to, FailureKind::BusinessRule, message)
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_warnings(mut self, warnings: impl IntoIterator<Item = String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Entry in a state machine's in-memory transition log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from_state: State,
    pub to_state: State,
    pub principal_id: Option<String>,
    pub reason: String,
    pub at: DateTime<Utc>,
}
