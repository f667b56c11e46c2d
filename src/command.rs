//! Command interface.
//!
//! A request layer talks to the store through four operation shapes and
//! gets back a [`Response`] carrying a numeric [`Status`], a human-readable
//! message and zero or more result byte-strings. Commands are executed
//! with [`Db::execute`](crate::Db::execute).

use std::fmt;

use crate::key::HexKey;

/// One operation against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Stores `value` under `key`, replacing any existing value.
    Add { key: Vec<u8>, value: Vec<u8> },

    /// Removes `key`. Deleting a missing key succeeds.
    Delete { key: Vec<u8> },

    /// Replaces the value under `key`. Behaves as an upsert: a missing key
    /// is created.
    Update { key: Vec<u8>, new_value: Vec<u8> },

    /// Looks up the current value of `key`.
    Get { key: Vec<u8> },
}

impl Command {
    /// Key the command operates on.
    pub fn key(&self) -> &[u8] {
        match self {
            Command::Add { key, .. }
            | Command::Delete { key }
            | Command::Update { key, .. }
            | Command::Get { key } => key,
        }
    }

    /// Short lowercase name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Add { .. } => "add",
            Command::Delete { .. } => "delete",
            Command::Update { .. } => "update",
            Command::Get { .. } => "get",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name(), HexKey(self.key()))
    }
}

/// Outcome code of a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    NotFound = 1,
    InvalidArgument = 2,
    Error = 3,
}

impl Status {
    /// Wire value of the status.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Result of executing a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub message: String,
    pub data: Vec<Vec<u8>>,
}

impl Response {
    pub fn ok() -> Self {
        Self::new(Status::Ok, "ok")
    }

    /// Successful lookup carrying `value`.
    pub fn found(value: Vec<u8>) -> Self {
        Self {
            data: vec![value],
            ..Self::ok()
        }
    }

    pub fn not_found() -> Self {
        Self::new(Status::NotFound, "key not found")
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Status::InvalidArgument, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Status::Error, message)
    }

    fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            data: Vec::new(),
        }
    }

    /// Returns `true` when the status is [`Status::Ok`].
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}
