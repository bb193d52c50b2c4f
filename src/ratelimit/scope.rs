//! Scope keys identifying what a rate limit counter applies to.

/// The unit a window counter is kept for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// A key's own rate limit.
    Key { key_id: String },
    /// An identifier within a ratelimit namespace.
    Namespace {
        namespace_id: String,
        identifier: String,
    },
}

impl Scope {
    pub fn key(key_id: &str) -> Self {
        Scope::Key {
            key_id: key_id.to_string(),
        }
    }

    pub fn namespace(namespace_id: &str, identifier: &str) -> Self {
        Scope::Namespace {
            namespace_id: namespace_id.to_string(),
            identifier: identifier.to_string(),
        }
    }

    /// Storage key of this scope.
    ///
    /// The identifier is last so it may itself contain the delimiter.
    pub fn to_string_key(&self) -> String {
        match self {
            Scope::Key { key_id } => format!("key|{}", key_id),
            Scope::Namespace {
                namespace_id,
                identifier,
            } => format!("ns|{}|{}", namespace_id, identifier),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
