use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{PgWireError, PgWireResult};

use crate::observability::AUTH_FAILURES_TOTAL;
use crate::tenant::TenantManager;

/// Shared-password login. Besides the password, the login name must be
/// the admin user or a user registered in the target database.
pub struct SamayAuthSource {
    password: String,
    admin_user: String,
    tenant_manager: Arc<TenantManager>,
}

impl fmt::Debug for SamayAuthSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamayAuthSource")
            .field("admin_user", &self.admin_user)
            .finish_non_exhaustive()
    }
}

impl SamayAuthSource {
    pub fn new(password: String, admin_user: String, tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            password,
            admin_user,
            tenant_manager,
        }
    }

    fn known_login(&self, user: &str, database: &str) -> bool {
        if user == self.admin_user {
            return true;
        }
        self.tenant_manager
            .get_or_create(database)
            .is_ok_and(|engine| engine.find_user(user).is_some())
    }
}

#[async_trait]
impl AuthSource for SamayAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        let database = login.database().unwrap_or("default");
        if !self.known_login(user, database) {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            tracing::info!("login refused for unknown user {user:?} on {database:?}");
            return Err(PgWireError::InvalidPassword(user.to_string()));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
