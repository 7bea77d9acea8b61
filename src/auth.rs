use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Shared-password cleartext auth. The login user name is not checked here;
/// when it is a user id the wire layer adopts it as the session actor.
#[derive(Debug)]
pub struct LabdeskAuthSource {
    password: String,
}

impl LabdeskAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for LabdeskAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!(user = ?login.user(), "password login");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
