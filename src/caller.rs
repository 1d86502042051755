use std::{collections::BTreeSet, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Actor id recorded for callers that present no identity.
pub const ANONYMOUS: &str = "anonymous";

/// Audience a caller belongs to. Drives search visibility only; what a
/// caller may change is decided by its capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Public,
    Staff,
    Admin,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Public, Role::Staff, Role::Admin];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Public => "public",
            Role::Staff => "staff",
            Role::Admin => "admin",
        }
    }

    /// Capabilities a caller of this role holds when none are given
    /// explicitly.
    pub fn default_capabilities(self) -> BTreeSet<Capability> {
        match self {
            Role::Public => BTreeSet::new(),
            Role::Staff => BTreeSet::from([Capability::FormRead]),
            Role::Admin => Capability::ALL.into_iter().collect(),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| Error::Invalid(format!("unknown role '{s}'")))
    }
}

/// A permission granted to a caller by the identity collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "form:create")]
    FormCreate,
    #[serde(rename = "form:read")]
    FormRead,
    #[serde(rename = "form:edit")]
    FormEdit,
    #[serde(rename = "form:delete")]
    FormDelete,
    #[serde(rename = "form:submit_for_review")]
    SubmitForReview,
    #[serde(rename = "form:review")]
    Review,
    #[serde(rename = "form:approve")]
    Approve,
    #[serde(rename = "form:publish")]
    Publish,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::FormCreate,
        Capability::FormRead,
        Capability::FormEdit,
        Capability::FormDelete,
        Capability::SubmitForReview,
        Capability::Review,
        Capability::Approve,
        Capability::Publish,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::FormCreate => "form:create",
            Capability::FormRead => "form:read",
            Capability::FormEdit => "form:edit",
            Capability::FormDelete => "form:delete",
            Capability::SubmitForReview => "form:submit_for_review",
            Capability::Review => "form:review",
            Capability::Approve => "form:approve",
            Capability::Publish => "form:publish",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::Invalid(format!("unknown capability '{s}'")))
    }
}

/// The caller as presented by the identity collaborator. The core never
/// authenticates; it only authorizes against these capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub id: String,
    pub role: Role,
    pub capabilities: BTreeSet<Capability>,
}

impl Caller {
    pub fn new(
        id: impl Into<String>,
        role: Role,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Self {
        Self {
            id: id.into(),
            role,
            capabilities: capabilities.into_iter().collect(),
        }
    }

    /// An anonymous visitor.
    pub fn public() -> Self {
        Self::new(ANONYMOUS, Role::Public, [])
    }

    /// A staff member holding the role's default capabilities plus `extra`.
    pub fn staff(
        id: impl Into<String>,
        extra: impl IntoIterator<Item = Capability>,
    ) -> Self {
        let mut caller = Self::new(id, Role::Staff, extra);
        caller
            .capabilities
            .extend(Role::Staff.default_capabilities());
        caller
    }

    /// A backend or administrative caller holding every capability.
    pub fn admin(id: impl Into<String>) -> Self {
        Self::new(id, Role::Admin, Role::Admin.default_capabilities())
    }

    pub fn can(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Fail with `PermissionDenied` unless the caller holds `capability`.
    pub fn require(&self, capability: Capability) -> Result<()> {
        if self.can(capability) {
            Ok(())
        } else {
            Err(Error::PermissionDenied {
                actor: self.id.clone(),
                capability,
            })
        }
    }
}
