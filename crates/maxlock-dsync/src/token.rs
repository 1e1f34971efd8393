use std::fmt;

use maxlock_common::error::{MaxlockError, Result};
use ring::rand::{SecureRandom, SystemRandom};
use serde::Serialize;

const TOKEN_BYTES: usize = 20;

/// Random value gating extend and release to the holder of a lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct LockToken(String);

impl LockToken {
    pub fn generate() -> Result<Self> {
        let mut bytes = [0_u8; TOKEN_BYTES];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| MaxlockError::InternalError("system random source failed".to_string()))?;
        Ok(Self(hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
