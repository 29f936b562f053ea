use serde::Deserialize;

use super::{Authentication, ClientBuilder};

#[derive(Debug, Deserialize)]
pub(super) struct FromEnv {
    nats_username: Option<String>,
    nats_password: Option<String>,
    nats_token: Option<String>,
    nats_inbox_prefix: Option<String>,
}

impl ClientBuilder {
    /// Construct [`ClientBuilder`] from environment variables
    ///
    /// Reads the following environment variables:
    ///
    /// * `NATS_USERNAME` and `NATS_PASSWORD`: username and password
    ///   authentication
    /// * `NATS_TOKEN`: token authentication
    /// * `NATS_INBOX_PREFIX`: the reply subject prefix
    ///
    /// # Panics
    ///
    /// It panics if the environment cannot be read or if
    /// `NATS_INBOX_PREFIX` is not a valid subject.
    #[must_use]
    pub fn from_env() -> Self {
        let env = envy::from_env::<FromEnv>().expect("FromEnv deserialization error");

        let mut this = Self::new();

        match (env.nats_username, env.nats_password, env.nats_token) {
            (Some(username), Some(password), _) => {
                this = this.authentication(Some(Authentication::UserAndPassword {
                    username,
                    password,
                }));
            }
            (_, _, Some(token)) => {
                this = this.authentication(Some(Authentication::Token(token)));
            }
            _ => {}
        }

        if let Some(inbox_prefix) = env.nats_inbox_prefix {
            this = this.inbox_prefix(inbox_prefix.try_into().expect("invalid NATS_INBOX_PREFIX"));
        }

        this
    }
}
