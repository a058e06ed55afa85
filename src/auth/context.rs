use super::Claims;
use uuid::Uuid;

use crate::domain::{Actor, Role};
use crate::error::{ApiError, ApiResult};

/// Authenticated caller, built from verified JWT claims
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,

    pub email: Option<String>,

    /// Marketplace role, if the token carries one
    pub role: Option<Role>,

    pub issuer: String,
}

impl AuthContext {
    pub fn from_claims(claims: &Claims) -> Result<Self, &'static str> {
        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| "Invalid user ID in token")?;

        Ok(Self {
            user_id,
            email: claims.email.clone(),
            role: claims.marketplace_role(),
            issuer: claims.iss.clone(),
        })
    }

    /// The identity handed to the workflow services.
    pub fn actor(&self) -> ApiResult<Actor> {
        let role = self.role.ok_or_else(|| {
            ApiError::unauthorized("Token carries no marketplace role (CLIENTE or PRESTADOR)")
        })?;

        Ok(Actor {
            user_id: self.user_id,
            role,
        })
    }
}
