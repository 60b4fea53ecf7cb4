//! Basic and Bearer credentials for the HTTP and WebSocket boundary.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Credentials an endpoint requires (listener) or presents (connection).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    /// No `Authorization` header is sent or checked.
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
    },
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Credentials::Bearer {
            token: token.into(),
        }
    }

    /// Pick credentials from optional parts.
    ///
    /// A username/password pair takes precedence over a bearer token; a lone
    /// username or password is ignored.
    pub fn from_parts(
        username: Option<String>,
        password: Option<String>,
        token: Option<String>,
    ) -> Self {
        match (username, password, token) {
            (Some(username), Some(password), _) => Credentials::Basic { username, password },
            (_, _, Some(token)) => Credentials::Bearer { token },
            _ => Credentials::None,
        }
    }

    /// The `Authorization` header value for these credentials.
    pub fn authorization_header(&self) -> Option<String> {
        match self {
            Credentials::None => None,
            Credentials::Basic { username, password } => Some(format!(
                "Basic {}",
                STANDARD.encode(format!("{}:{}", username, password))
            )),
            Credentials::Bearer { token } => Some(format!("Bearer {}", token)),
        }
    }

    /// Check a received `Authorization` header against these credentials.
    pub fn authorize(&self, header: Option<&str>) -> bool {
        match self.authorization_header() {
            None => true,
            Some(expected) => header == Some(expected.as_str()),
        }
    }

    pub fn is_required(&self) -> bool {
        !matches!(self, Credentials::None)
    }
}
