use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Login credentials. Staff tooling and the booking frontend authenticate as
/// service accounts, not as individual people: one staff user name with its
/// own password, and a shared password for every other user name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub password: String,
    pub staff_user: String,
    pub staff_password: String,
}

impl Credentials {
    /// Only the staff login may override capacity or dates, decide bookings,
    /// or change the catalog.
    pub fn is_staff(&self, user: Option<&str>) -> bool {
        user == Some(self.staff_user.as_str())
    }

    fn password_for(&self, user: Option<&str>) -> &str {
        if self.is_staff(user) {
            &self.staff_password
        } else {
            &self.password
        }
    }
}

#[derive(Debug)]
pub struct LarderAuthSource {
    credentials: Arc<Credentials>,
}

impl LarderAuthSource {
    pub fn new(credentials: Arc<Credentials>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl AuthSource for LarderAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let password = self.credentials.password_for(login.user());
        Ok(Password::new(None, password.as_bytes().to_vec()))
    }
}
