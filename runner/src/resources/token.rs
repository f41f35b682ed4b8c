use super::access::DependencyStatus;
use serde::{Deserialize, Serialize};

/// Counters of a token resource, a counting semaphore shared by jobs
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TokenPayload {
    pub limit: u32,
    #[serde(default)]
    used_tokens: u32,
}

impl TokenPayload {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            used_tokens: 0,
        }
    }

    pub fn used_tokens(&self) -> u32 {
        self.used_tokens
    }

    pub fn is_blocking(&self) -> bool {
        self.used_tokens >= self.limit
    }

    /// a slot is granted as long as one is free at evaluation time
    pub fn accept(&self) -> DependencyStatus {
        if self.is_blocking() {
            DependencyStatus::Wait
        } else {
            DependencyStatus::Ok
        }
    }

    pub fn increase_used_tokens(&mut self) {
        self.used_tokens += 1;
    }

    /// Returns false on an over-release, which leaves the counter at zero
    pub fn unlock(&mut self) -> bool {
        match self.used_tokens.checked_sub(1) {
            Some(used) => {
                self.used_tokens = used;
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_used_tokens(&mut self, used: u32) {
        self.used_tokens = used;
    }
}
