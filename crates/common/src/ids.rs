//! Type-safe identifier newtypes for Baton.
//!
//! These keep generation numbers and connection numbers from being mixed up
//! when they travel through logs, the handoff environment and the drain
//! bookkeeping.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Monotonic identifier of one process generation.
///
/// The first process started by an operator is generation 1; every
/// successor spawned during an upgrade is its predecessor's id plus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GenerationId(u64);

impl GenerationId {
    /// Generation of a process that was not spawned by a predecessor
    pub const FIRST: GenerationId = GenerationId(1);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Identifier the successor of this generation will carry
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for GenerationId {
    fn default() -> Self {
        Self::FIRST
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GenerationId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Identifier of a tracked long-lived connection.
///
/// Only unique within the generation that allocated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
