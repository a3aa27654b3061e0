// Credential checks for the CONNECT handshake.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Login/passcode check performed once per connection.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, login: &str, passcode: &str) -> bool;
}

/// No credential file configured: every connection is accepted.
#[derive(Debug)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _login: &str, _passcode: &str) -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
struct Credential {
    #[serde(rename = "Login")]
    login: String,
    #[serde(rename = "Passcode")]
    passcode: String,
}

/// Credentials loaded from a JSON array of `{"Login", "Passcode"}` objects.
#[derive(Debug)]
pub struct FileAuth {
    users: HashMap<String, String>,
}

impl FileAuth {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("read credential file: {}", path.display()))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let credentials: Vec<Credential> =
            serde_json::from_str(contents).context("parse credential file")?;
        let mut users = HashMap::new();
        for credential in credentials {
            // First occurrence wins on duplicate logins.
            if users.contains_key(&credential.login) {
                tracing::warn!(login = %credential.login, "duplicate login in credential file ignored");
                continue;
            }
            users.insert(credential.login, credential.passcode);
        }
        Ok(Self { users })
    }
}

impl Authenticator for FileAuth {
    fn authenticate(&self, login: &str, passcode: &str) -> bool {
        self.users
            .get(login)
            .is_some_and(|expected| expected == passcode)
    }
}
