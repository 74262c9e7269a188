use std::collections::HashMap;

/// Credential check used during username/password sub-negotiation.
///
/// Implementations are shared by every connection of a listener, so
/// `verify` may be called concurrently.
pub trait Authenticator: Send + Sync {
    /// Returns `true` if the pair is accepted.
    fn verify(&self, username: &str, password: &str) -> bool;
}

/// A username/password pair.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct User {
    /// Username. Must be a valid UTF-8 string with length not exceeding 255 bytes.
    pub username: String,

    /// Password. Must be a valid UTF-8 string with length not exceeding 255 bytes.
    pub password: String,
}

impl User {
    #[allow(missing_docs)]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// [`Authenticator`] backed by a fixed user list.
///
/// When a username appears more than once the last entry wins.
#[derive(Clone, Debug, Default)]
pub struct UserAuthenticator {
    users: HashMap<String, String>,
}

impl UserAuthenticator {
    #[allow(missing_docs)]
    pub fn new<I>(users: I) -> Self
    where
        I: IntoIterator<Item = User>,
    {
        Self {
            users: users
                .into_iter()
                .map(|u| (u.username, u.password))
                .collect(),
        }
    }
}

impl Authenticator for UserAuthenticator {
    fn verify(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .is_some_and(|expected| expected == password)
    }
}
