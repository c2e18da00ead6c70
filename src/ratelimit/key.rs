//! Identifier keys and key scoping.

use serde::{Deserialize, Serialize};

/// How the caller was identified.
///
/// The same identifier string under two modes addresses two distinct limiter
/// records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyMode {
    #[serde(rename = "ip")]
    Ip,
    #[serde(rename = "apiKey", alias = "apikey", alias = "api_key")]
    ApiKey,
    #[serde(rename = "user")]
    User,
}

impl KeyMode {
    /// Name used in store keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyMode::Ip => "ip",
            KeyMode::ApiKey => "apiKey",
            KeyMode::User => "user",
        }
    }
}

impl std::fmt::Display for KeyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for KeyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ip" => Ok(KeyMode::Ip),
            "apiKey" | "apikey" | "api_key" => Ok(KeyMode::ApiKey),
            "user" => Ok(KeyMode::User),
            other => Err(format!("unknown key mode: {}", other)),
        }
    }
}

/// A key that uniquely identifies one limiter record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentifierKey {
    /// How the identifier was resolved
    pub mode: KeyMode,
    /// The resolved identifier (IP, API key, user id)
    pub identifier: String,
}

impl IdentifierKey {
    /// Create a new identifier key.
    pub fn new(mode: KeyMode, identifier: impl Into<String>) -> Self {
        Self {
            mode,
            identifier: identifier.into(),
        }
    }

    /// Serialize the key for use as a store key.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.mode, self.identifier)
    }
}

impl std::fmt::Display for IdentifierKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_key_to_string() {
        let key = IdentifierKey::new(KeyMode::ApiKey, "abc123");
        assert_eq!(key.to_string_key(), "apiKey:abc123");
        assert_eq!(key.to_string(), "apiKey:abc123");
    }

    #[test]
    fn test_modes_scope_identical_identifiers() {
        let ip = IdentifierKey::new(KeyMode::Ip, "42");
        let user = IdentifierKey::new(KeyMode::User, "42");

        assert_ne!(ip, user);
        assert_ne!(ip.to_string_key(), user.to_string_key());
    }

    #[test]
    fn test_key_mode_parse() {
        assert_eq!("ip".parse::<KeyMode>().unwrap(), KeyMode::Ip);
        assert_eq!("apiKey".parse::<KeyMode>().unwrap(), KeyMode::ApiKey);
        assert_eq!("api_key".parse::<KeyMode>().unwrap(), KeyMode::ApiKey);
        assert_eq!("user".parse::<KeyMode>().unwrap(), KeyMode::User);
        assert!("session".parse::<KeyMode>().is_err());
    }

    #[test]
    fn test_key_mode_serde_names() {
        let mode: KeyMode = serde_yaml::from_str("apikey").unwrap();
        assert_eq!(mode, KeyMode::ApiKey);
        assert_eq!(serde_yaml::to_string(&KeyMode::ApiKey).unwrap().trim(), "apiKey");
    }
}
