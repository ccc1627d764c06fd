//! Namespaced counter keys.

use std::fmt;

/// Tag prefixed to address-based keys.
const ADDRESS_TAG: &str = "ip";
/// Tag prefixed to credential-based keys.
const CREDENTIAL_TAG: &str = "token";

/// A key that identifies one counter in the store.
///
/// The identifier class is part of the key, so an address and a credential
/// with the same literal value never share a counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LimitKey {
    /// A network address, e.g. `192.168.1.1`
    Address(String),
    /// An access credential, e.g. an API token
    Credential(String),
}

impl LimitKey {
    /// Create an address-scoped key.
    pub fn address(address: impl Into<String>) -> Self {
        LimitKey::Address(address.into())
    }

    /// Create a credential-scoped key.
    pub fn credential(credential: impl Into<String>) -> Self {
        LimitKey::Credential(credential.into())
    }

    /// The identifier class tag.
    pub fn class(&self) -> &'static str {
        match self {
            LimitKey::Address(_) => ADDRESS_TAG,
            LimitKey::Credential(_) => CREDENTIAL_TAG,
        }
    }

    /// The raw identifier value, without its class tag.
    pub fn identifier(&self) -> &str {
        match self {
            LimitKey::Address(value) | LimitKey::Credential(value) => value,
        }
    }

    /// The string under which the counter is stored.
    pub fn to_store_key(&self) -> String {
        format!("{}:{}", self.class(), self.identifier())
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class(), self.identifier())
    }
}
