use serde::{Deserialize, Serialize};

use crate::domain::Role;

/// JWT claims issued by the identity provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,

    pub aud: String,

    pub iss: String,

    pub iat: i64,

    pub exp: i64,

    #[serde(default)]
    pub nbf: Option<i64>,

    #[serde(default)]
    pub email: Option<String>,

    /// Token-level role (`authenticated`), not the marketplace role
    #[serde(default)]
    pub role: Option<String>,

    #[serde(default)]
    pub app_metadata: Option<AppMetadata>,

    #[serde(default)]
    pub user_metadata: Option<UserMetadata>,
}

/// Set by the backend; trusted over user metadata.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppMetadata {
    #[serde(default)]
    pub provider: Option<String>,

    #[serde(default)]
    pub role: Option<String>,
}

/// Chosen by the user at sign-up.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserMetadata {
    #[serde(default, alias = "role")]
    pub rol: Option<String>,

    #[serde(default)]
    pub nombre: Option<String>,
}

impl Claims {
    /// Marketplace role: `app_metadata.role` first, then `user_metadata.rol`.
    pub fn marketplace_role(&self) -> Option<Role> {
        let from_app = self
            .app_metadata
            .as_ref()
            .and_then(|m| m.role.as_deref())
            .and_then(Role::parse);

        from_app.or_else(|| {
            self.user_metadata
                .as_ref()
                .and_then(|m| m.rol.as_deref())
                .and_then(Role::parse)
        })
    }
}
