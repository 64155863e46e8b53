use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one keyserver. Thread and user ids minted by a keyserver are
/// prefixed with this value, so it is kept as the raw string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyserverId(pub String);

impl KeyserverId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyserverId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Ios,
    Android,
    Web,
    Windows,
    Macos,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformDetails {
    pub platform: Platform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_version: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedInUserInfo {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedOutUserInfo {
    anonymous: bool,
}

impl LoggedOutUserInfo {
    pub fn new() -> Self {
        Self { anonymous: true }
    }
}

impl Default for LoggedOutUserInfo {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CurrentUserInfo {
    LoggedIn(LoggedInUserInfo),
    LoggedOut(LoggedOutUserInfo),
}

impl CurrentUserInfo {
    pub fn logged_in(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self::LoggedIn(LoggedInUserInfo {
            id: id.into(),
            username: username.into(),
        })
    }

    pub fn anonymous() -> Self {
        Self::LoggedOut(LoggedOutUserInfo::new())
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::LoggedOut(_))
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Self::LoggedIn(info) => Some(&info.id),
            Self::LoggedOut(_) => None,
        }
    }
}

impl From<LoggedOutUserInfo> for CurrentUserInfo {
    fn from(value: LoggedOutUserInfo) -> Self {
        Self::LoggedOut(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
}
