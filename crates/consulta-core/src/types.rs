use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Service tier a license grants access to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Ai,
    Lawyer,
    Both,
}

impl Tier {
    /// Whether a grant of this tier covers a request for `requested`.
    pub fn covers(self, requested: Tier) -> bool {
        self == Tier::Both || self == requested
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ai => write!(f, "ai"),
            Self::Lawyer => write!(f, "lawyer"),
            Self::Both => write!(f, "both"),
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ai" => Ok(Self::Ai),
            "lawyer" => Ok(Self::Lawyer),
            "both" => Ok(Self::Both),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// Kind of metered consultation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionType {
    #[serde(rename = "chat_ia")]
    AiChat,
    #[serde(rename = "chat_lawyer")]
    LawyerChat,
}

impl SessionType {
    pub fn tier(self) -> Tier {
        match self {
            Self::AiChat => Tier::Ai,
            Self::LawyerChat => Tier::Lawyer,
        }
    }
}

impl std::fmt::Display for SessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AiChat => write!(f, "chat_ia"),
            Self::LawyerChat => write!(f, "chat_lawyer"),
        }
    }
}

impl std::str::FromStr for SessionType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat_ia" => Ok(Self::AiChat),
            "chat_lawyer" => Ok(Self::LawyerChat),
            other => Err(format!("unknown session type: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseKind {
    Trial,
    Standard,
    Premium,
}

impl std::fmt::Display for LicenseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trial => write!(f, "trial"),
            Self::Standard => write!(f, "standard"),
            Self::Premium => write!(f, "premium"),
        }
    }
}

impl std::str::FromStr for LicenseKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" => Ok(Self::Trial),
            "standard" => Ok(Self::Standard),
            "premium" => Ok(Self::Premium),
            other => Err(format!("unknown license kind: {other}")),
        }
    }
}

/// How a grant came to exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantSource {
    Trial,
    Purchase,
    Manual,
}

impl std::fmt::Display for GrantSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trial => write!(f, "trial"),
            Self::Purchase => write!(f, "purchase"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for GrantSource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" => Ok(Self::Trial),
            "purchase" => Ok(Self::Purchase),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown grant source: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    Active,
    Expired,
}

impl std::fmt::Display for GrantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for GrantStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown grant status: {other}")),
        }
    }
}

/// Platform role of whoever is acting on a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Lawyer,
    Admin,
    /// The AI assistant identity.
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Lawyer => write!(f, "lawyer"),
            Self::Admin => write!(f, "admin"),
            Self::System => write!(f, "system"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn user(id: UserId) -> Self {
        Self { user_id: id, role: Role::User }
    }

    pub fn lawyer(id: UserId) -> Self {
        Self { user_id: id, role: Role::Lawyer }
    }

    pub fn admin(id: UserId) -> Self {
        Self { user_id: id, role: Role::Admin }
    }

    pub fn system() -> Self {
        Self {
            user_id: UserId::from_raw("system"),
            role: Role::System,
        }
    }
}
