//! Caller identity passed explicitly into every workflow operation.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;

/// Marketplace role carried by the caller's token.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Role {
    #[serde(rename = "CLIENTE")]
    Client,
    #[serde(rename = "PRESTADOR")]
    Provider,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "CLIENTE" | "CLIENT" => Some(Self::Client),
            "PRESTADOR" | "PROVIDER" | "TRABAJADOR" => Some(Self::Provider),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => write!(f, "CLIENTE"),
            Role::Provider => write!(f, "PRESTADOR"),
        }
    }
}

/// Who is calling: user id plus the role they act under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: Role,
}

impl Actor {
    #[cfg(test)]
    pub fn client(user_id: Uuid) -> Self {
        Self {
            user_id,
            role: Role::Client,
        }
    }

    #[cfg(test)]
    pub fn provider(user_id: Uuid) -> Self {
        Self {
            user_id,
            role: Role::Provider,
        }
    }

    /// Succeeds only when the caller acts as a client and is `client_id`.
    pub fn require_client(&self, client_id: Uuid) -> Result<(), ApiError> {
        if self.role == Role::Client && self.user_id == client_id {
            Ok(())
        } else {
            Err(ApiError::forbidden("Only the requesting client can do this"))
        }
    }

    /// Succeeds only when the caller acts as a provider and is `provider_id`.
    pub fn require_provider(&self, provider_id: Uuid) -> Result<(), ApiError> {
        if self.role == Role::Provider && self.user_id == provider_id {
            Ok(())
        } else {
            Err(ApiError::forbidden("Only the assigned provider can do this"))
        }
    }

    /// Either side of the deal, in its own role.
    pub fn require_party(&self, client_id: Uuid, provider_id: Uuid) -> Result<(), ApiError> {
        self.require_client(client_id)
            .or_else(|_| self.require_provider(provider_id))
            .map_err(|_| ApiError::forbidden("You are not a party to this budget"))
    }
}
