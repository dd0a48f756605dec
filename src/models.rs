use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One spreadsheet row: column name to cell text, in sheet column order.
pub type Row = IndexMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Employee,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Employee => "employee",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "employee" => Ok(Role::Employee),
            other => Err(anyhow!("unknown role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordStatus {
    Win,
    Lose,
    Pending,
    #[serde(rename = "")]
    Unset,
}

impl Default for RecordStatus {
    fn default() -> Self {
        RecordStatus::Unset
    }
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Win => "Win",
            RecordStatus::Lose => "Lose",
            RecordStatus::Pending => "Pending",
            RecordStatus::Unset => "",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Win" => Ok(RecordStatus::Win),
            "Lose" => Ok(RecordStatus::Lose),
            "Pending" => Ok(RecordStatus::Pending),
            "" => Ok(RecordStatus::Unset),
            other => Err(anyhow!("unknown status: {}", other)),
        }
    }
}

/// A stored account. Never serialised: the hash stays on the server.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Employee {
    pub id: i64,
    pub username: String,
    pub role: Role,
}

impl From<User> for Employee {
    fn from(user: User) -> Self {
        Employee {
            id: user.id,
            username: user.username,
            role: user.role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: i64,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub file_id: i64,
    pub data: Row,
    #[serde(default)]
    pub status: RecordStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// An authenticated caller, as resolved from a session token.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub token: String,
    pub user_id: i64,
    pub username: String,
    pub role: Role,
}
