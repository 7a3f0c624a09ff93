//! Strongly-typed identifiers.
//!
//! All IDs are validated at construction time and implement common traits.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a strongly-typed ID newtype wrapper.
///
/// Generates: struct, `from_string()`, `must()`, `as_str()`, Display,
/// Serialize, Deserialize. With a prefix literal, also generates `new()`
/// (prefixed short UUID v4) and `Default`.
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!(
                    "{}_{}",
                    $prefix,
                    &uuid::Uuid::new_v4().simple().to_string()[..16]
                ))
            }

            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            /// Construct from a known-good value; panics on the empty string.
            #[allow(clippy::panic)]
            pub fn must(s: &str) -> Self {
                match Self::from_string(s.to_string()) {
                    Ok(id) => id,
                    Err(e) => panic!("{}", e),
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            /// Construct from a known-good value; panics on the empty string.
            #[allow(clippy::panic)]
            pub fn must(s: &str) -> Self {
                match Self::from_string(s.to_string()) {
                    Ok(id) => id,
                    Err(e) => panic!("{}", e),
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(JobId, "job");
define_id!(MessageId, "msg");
define_id!(CorrelationId, "corr");
define_id!(PlanId, "plan");
define_id!(RuleId, "rule");
define_id!(ConversationId, "conv");
define_id!(WorkerId);

/// Logical component address on the message router.
///
/// Either one of the fixed component names or a plugin-scoped tag
/// (`plugin:<gear-id>`). Exactly one handler is bound per id at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentId(String);

/// Fixed component names known to the router.
pub const FIXED_COMPONENTS: &[&str] = &["planner", "validator", "router", "queue", "sandbox-host"];

impl ComponentId {
    pub fn planner() -> Self {
        Self("planner".to_string())
    }

    pub fn validator() -> Self {
        Self("validator".to_string())
    }

    pub fn router() -> Self {
        Self("router".to_string())
    }

    pub fn queue() -> Self {
        Self("queue".to_string())
    }

    pub fn sandbox_host() -> Self {
        Self("sandbox-host".to_string())
    }

    /// Plugin-scoped component tag.
    pub fn plugin(gear_id: &str) -> Self {
        Self(format!("plugin:{}", gear_id))
    }

    pub fn from_string(s: String) -> Result<Self, &'static str> {
        if FIXED_COMPONENTS.contains(&s.as_str()) {
            return Ok(Self(s));
        }
        if let Some(gear_id) = s.strip_prefix("plugin:") {
            if !gear_id.is_empty() {
                return Ok(Self(s));
            }
        }
        Err("ComponentId must be a fixed component name or plugin:<id>")
    }

    /// Construct from a known-good value; panics on an invalid id.
    #[allow(clippy::panic)]
    pub fn must(s: &str) -> Self {
        match Self::from_string(s.to_string()) {
            Ok(id) => id,
            Err(e) => panic!("{}", e),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The gear id, if this is a plugin-scoped tag.
    pub fn gear_id(&self) -> Option<&str> {
        self.0.strip_prefix("plugin:")
    }

    pub fn is_validator(&self) -> bool {
        self.0 == "validator"
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_prefix() {
        let id = JobId::new();
        assert!(id.as_str().starts_with("job_"));
        assert_eq!(id.as_str().len(), "job_".len() + 16);
    }

    #[test]
    fn test_ids_unique() {
        assert_ne!(MessageId::new(), MessageId::new());
    }

    #[test]
    fn test_empty_id_rejected() {
        assert!(JobId::from_string(String::new()).is_err());
        assert!(WorkerId::from_string(String::new()).is_err());
    }

    #[test]
    fn test_component_id_fixed_names() {
        for name in FIXED_COMPONENTS {
            assert!(ComponentId::from_string(name.to_string()).is_ok());
        }
        assert_eq!(ComponentId::planner().as_str(), "planner");
        assert_eq!(ComponentId::sandbox_host().as_str(), "sandbox-host");
    }

    #[test]
    fn test_component_id_plugin_scoped() {
        let id = ComponentId::plugin("file-manager");
        assert_eq!(id.as_str(), "plugin:file-manager");
        assert_eq!(id.gear_id(), Some("file-manager"));
        assert!(!id.is_validator());
    }

    #[test]
    fn test_component_id_rejects_unknown() {
        assert!(ComponentId::from_string("journal".to_string()).is_err());
        assert!(ComponentId::from_string("plugin:".to_string()).is_err());
        assert!(ComponentId::from_string(String::new()).is_err());
    }
}
