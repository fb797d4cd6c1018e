//! Keys resolvable through a context chain.

use std::fmt;
use std::sync::Arc;

/// A key that can be bound to and resolved from a [`Context`] chain.
///
/// The intrinsic variants cover the fixed set of privileged bindings the
/// orchestration core knows about; [`Key::Custom`] covers everything else.
/// Construct custom keys through [`Key::custom`], which normalizes
/// well-known names to their canonical intrinsic variant so lookups by
/// equivalent-but-distinct key representations still match.
///
/// The logger and the request carrier are not resolved through
/// [`Context::value`](super::Context::value); they have dedicated accessors
/// ([`Context::log_level`](super::Context::log_level) and
/// [`Context::carrier`](super::Context::carrier)).
///
/// [`Context`]: super::Context
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    /// The context's logger binding.
    Logger,
    /// The per-request carrier object.
    Carrier,
    /// The transport route the request matched.
    Route,
    /// The resolved backend storage service.
    Service,
    /// The instance identity resolved for the bound service's driver.
    InstanceId,
    /// The local devices resolved for the bound service's driver.
    LocalDevices,
    /// Map of instance identities for every driver, keyed by driver name.
    AllInstanceIds,
    /// Map of local devices for every driver, keyed by driver name.
    AllLocalDevices,
    /// The request-scoped transaction.
    Transaction,
    /// The identifier of the task the work function is running under.
    TaskId,
    /// Name of the server handling the request.
    Server,
    /// The request's storage profile.
    Profile,
    /// A caller-defined key.
    Custom(Arc<str>),
}

impl Key {
    /// Build a key from a name, normalizing well-known names to their
    /// canonical intrinsic variant.
    pub fn custom(name: &str) -> Self {
        let lower = name.to_lowercase();
        match lower.as_str() {
            "logger" => Self::Logger,
            "carrier" => Self::Carrier,
            "route" => Self::Route,
            "service" => Self::Service,
            "instanceid" => Self::InstanceId,
            "localdevices" => Self::LocalDevices,
            "allinstanceids" => Self::AllInstanceIds,
            "alllocaldevices" => Self::AllLocalDevices,
            "transaction" => Self::Transaction,
            "taskid" => Self::TaskId,
            "server" => Self::Server,
            "profile" => Self::Profile,
            _ => Self::Custom(Arc::from(lower.as_str())),
        }
    }

    /// Canonical name of the key.
    pub fn name(&self) -> &str {
        match self {
            Self::Logger => "logger",
            Self::Carrier => "carrier",
            Self::Route => "route",
            Self::Service => "service",
            Self::InstanceId => "instanceid",
            Self::LocalDevices => "localdevices",
            Self::AllInstanceIds => "allinstanceids",
            Self::AllLocalDevices => "alllocaldevices",
            Self::Transaction => "transaction",
            Self::TaskId => "taskid",
            Self::Server => "server",
            Self::Profile => "profile",
            Self::Custom(name) => name,
        }
    }

    /// Re-normalize the key, folding a [`Key::Custom`] that spells a
    /// well-known name back into its intrinsic variant.
    pub(crate) fn normalized(self) -> Self {
        match self {
            Self::Custom(name) => Self::custom(&name),
            other => other,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_normalizes_well_known_names() {
        assert_eq!(Key::custom("transaction"), Key::Transaction);
        assert_eq!(Key::custom("Transaction"), Key::Transaction);
        assert_eq!(Key::custom("INSTANCEID"), Key::InstanceId);
    }

    #[test]
    fn custom_keys_are_case_folded() {
        let a = Key::custom("MyKey");
        let b = Key::custom("mykey");
        assert_eq!(a, b);
        assert_eq!(a.name(), "mykey");
    }

    #[test]
    fn explicit_custom_variant_normalizes() {
        let k = Key::Custom("service".into()).normalized();
        assert_eq!(k, Key::Service);
    }
}
