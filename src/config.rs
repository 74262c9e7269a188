use std::{net::SocketAddr, sync::Arc};

use crate::{
    auth::{Authenticator, User, UserAuthenticator},
    handshake::MethodRejection,
};

/// Settings for a [`Socks5Listener`](crate::Socks5Listener).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address the TCP listener binds to.
    pub listen: SocketAddr,
    /// Accepted credentials. When empty, clients must use `no authentication`.
    pub users: Vec<User>,
    /// Behaviour when the client offers no acceptable method.
    pub method_rejection: MethodRejection,
}

impl ServerConfig {
    #[allow(missing_docs)]
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            users: Vec::new(),
            method_rejection: MethodRejection::default(),
        }
    }

    /// Adds an accepted username/password pair.
    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.push(User::new(username, password));
        self
    }

    #[allow(missing_docs)]
    pub fn with_method_rejection(mut self, method_rejection: MethodRejection) -> Self {
        self.method_rejection = method_rejection;
        self
    }

    /// Credential check derived from `users`, `None` if there are none.
    pub fn authenticator(&self) -> Option<Arc<dyn Authenticator>> {
        if self.users.is_empty() {
            return None;
        }
        Some(Arc::new(UserAuthenticator::new(self.users.iter().cloned())))
    }
}
