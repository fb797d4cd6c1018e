//! Request-scoped context propagation.
//!
//! A [`Context`] is an immutable, persistent, singly-linked chain of nodes.
//! Every derivation (`with_value`, `with_storage_service`, `join`,
//! `require_tx`, ...) produces a new leaf node that references its parent;
//! no existing node is ever mutated, so concurrently executing tasks can
//! share ancestry freely without synchronization.  The single exception is
//! the one-time copy-on-write logger upgrade performed by
//! [`Context::set_log_level`], which replaces that node's logger reference
//! without touching the node's bindings or any other node.
//!
//! Key resolution walks, in order: the side index of the bound carrier (for
//! non-intrinsic keys), this node's own binding, the parent chain, and
//! finally the right-fallback chain installed by [`Context::join`].

mod key;
mod logger;

pub use key::Key;
pub use logger::{LogFormat, LogLevel, LogSink, Logger};

use std::fmt;
use std::sync::{Arc, RwLock};

use crate::service::StorageService;
use crate::task::TaskId;
use crate::types::{
    InstanceId, InstanceIdMap, LocalDevices, LocalDevicesMap, RequestRoute, Transaction,
};

/// A value bound to a context node.
#[derive(Debug, Clone)]
pub enum ContextValue {
    /// The matched transport route.
    Route(RequestRoute),
    /// A resolved backend storage service.
    Service(Arc<StorageService>),
    /// Instance identity for the bound service's driver.
    InstanceId(InstanceId),
    /// Local devices for the bound service's driver.
    LocalDevices(LocalDevices),
    /// Instance identities for every driver.
    AllInstanceIds(InstanceIdMap),
    /// Local devices for every driver.
    AllLocalDevices(LocalDevicesMap),
    /// A request-scoped transaction.
    Transaction(Transaction),
    /// The id of the task the work function runs under.
    TaskId(TaskId),
    /// A plain string value.
    String(String),
    /// An arbitrary JSON value.
    Json(serde_json::Value),
}

impl ContextValue {
    /// The value as a string slice, if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Side index attached to a context node by
/// [`Context::with_request_route`].
///
/// A carrier is an opaque per-request object (typically the inbound
/// transport request) that can resolve additional keys scoped to that
/// request.  It is consulted before the node's own bindings, but only for
/// keys that are not intrinsic to the context itself (the logger, the
/// carrier, and the transaction are always resolved by the chain).
pub trait Carrier: Send + Sync {
    /// Resolve `key` from the carrier's side index.
    fn get(&self, key: &Key) -> Option<ContextValue>;
}

struct LoggerSlot {
    logger: Arc<Logger>,
    /// True only after a level override allocated this node's own copy.
    owned: bool,
}

struct Node {
    parent: Option<Context>,
    binding: Option<(Key, ContextValue)>,
    /// Secondary chain consulted only when the ancestry resolves nothing.
    right: Option<Context>,
    carrier: Option<Arc<dyn Carrier>>,
    logger: RwLock<LoggerSlot>,
}

/// An immutable, persistent request context.
///
/// `Context` is a cheap handle (`Clone` bumps one reference count); the
/// chain stays alive as long as any leaf or external holder references it.
#[derive(Clone)]
pub struct Context(Arc<Node>);

impl Context {
    fn new_node(
        parent: Option<Context>,
        binding: Option<(Key, ContextValue)>,
        carrier: Option<Arc<dyn Carrier>>,
        right: Option<Context>,
    ) -> Context {
        // Reference the parent's logger; a fresh root gets the default.
        let logger = match &parent {
            Some(p) => p.effective_logger(),
            None => Arc::new(Logger::default()),
        };
        Context(Arc::new(Node {
            parent,
            binding,
            right,
            carrier,
            logger: RwLock::new(LoggerSlot {
                logger,
                owned: false,
            }),
        }))
    }

    /// A fresh root context with default logging.
    pub fn background() -> Context {
        Self::new_node(None, None, None, None)
    }

    /// A trivial derivation: a new node with no binding of its own.
    pub fn derive(&self) -> Context {
        Self::new_node(Some(self.clone()), None, None, None)
    }

    /// Derive a context binding `key` to `val`.
    ///
    /// Custom keys spelling a well-known name are normalized to their
    /// canonical intrinsic variant before storage.
    pub fn with_value(&self, key: Key, val: ContextValue) -> Context {
        Self::new_node(Some(self.clone()), Some((key.normalized(), val)), None, None)
    }

    /// Derive a context binding the matched transport route and remembering
    /// `carrier` for side-index lookups.
    pub fn with_request_route(&self, carrier: Arc<dyn Carrier>, route: RequestRoute) -> Context {
        Self::new_node(
            Some(self.clone()),
            Some((Key::Route, ContextValue::Route(route))),
            Some(carrier),
            None,
        )
    }

    /// Derive a context binding the resolved backend service.
    ///
    /// If the chain already carries an instance-identity map or a
    /// local-device map keyed by driver name, intermediate nodes binding
    /// the entry for this service's driver are pre-derived, so every
    /// downstream call sees backend-specific identity without re-deriving
    /// it at each call site.
    pub fn with_storage_service(&self, service: Arc<StorageService>) -> Context {
        let driver_name = service.driver().name().to_lowercase();

        let mut parent = self.clone();

        if let Some(ContextValue::AllInstanceIds(iidm)) = self.value(&Key::AllInstanceIds) {
            if let Some(iid) = iidm.get(&driver_name) {
                parent =
                    parent.with_value(Key::InstanceId, ContextValue::InstanceId(iid.clone()));
            }
        }

        if let Some(ContextValue::AllLocalDevices(ldm)) = self.value(&Key::AllLocalDevices) {
            if let Some(ld) = ldm.get(&driver_name) {
                parent =
                    parent.with_value(Key::LocalDevices, ContextValue::LocalDevices(ld.clone()));
            }
        }

        parent.with_value(Key::Service, ContextValue::Service(service))
    }

    /// Join this chain with a secondary one that is consulted only when
    /// nothing in this chain resolves a key (left precedence).
    ///
    /// `join(a, None)` and `join(a, a)` return `a` itself.
    pub fn join(&self, right: Option<&Context>) -> Context {
        let Some(right) = right else {
            return self.clone();
        };
        if self.ptr_eq(right) {
            return self.clone();
        }
        Self::new_node(Some(self.clone()), None, None, Some(right.clone()))
    }

    /// Ensure the chain carries a transaction.
    ///
    /// If one is already bound anywhere in the chain, a trivial derivation
    /// is returned so callers get a distinguishable node without a
    /// duplicate transaction; otherwise a fresh transaction identity is
    /// allocated and bound.
    pub fn require_tx(&self) -> Context {
        if self.transaction().is_some() {
            return self.derive();
        }
        self.with_value(Key::Transaction, ContextValue::Transaction(Transaction::new()))
    }

    /// Whether two contexts are the same node.
    pub fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    /// Resolve `key` against the chain, or `None` if it is bound nowhere.
    ///
    /// Per node the order is: the carrier side index (non-intrinsic keys
    /// only), then the node's own binding; then the parent chain; then the
    /// right-fallback chain.
    pub fn value(&self, key: &Key) -> Option<ContextValue> {
        let node = &*self.0;

        if let Some(carrier) = &node.carrier {
            if !matches!(key, Key::Logger | Key::Carrier | Key::Transaction) {
                if let Some(val) = carrier.get(key) {
                    return Some(val);
                }
            }
        }

        if let Some((k, v)) = &node.binding {
            if k == key {
                return Some(v.clone());
            }
        }

        if let Some(parent) = &node.parent {
            if let Some(val) = parent.value(key) {
                return Some(val);
            }
        }

        if let Some(right) = &node.right {
            return right.value(key);
        }

        None
    }

    /// The nearest carrier attached to the chain, if any.
    pub fn carrier(&self) -> Option<Arc<dyn Carrier>> {
        let node = &*self.0;
        if let Some(carrier) = &node.carrier {
            return Some(carrier.clone());
        }
        if let Some(parent) = &node.parent {
            if let Some(carrier) = parent.carrier() {
                return Some(carrier);
            }
        }
        node.right.as_ref().and_then(|r| r.carrier())
    }

    // -----------------------------------------------------------------------
    // Typed accessors
    // -----------------------------------------------------------------------

    /// The instance identity bound to the chain, if any.
    pub fn instance_id(&self) -> Option<InstanceId> {
        match self.value(&Key::InstanceId) {
            Some(ContextValue::InstanceId(iid)) => Some(iid),
            _ => None,
        }
    }

    /// The instance identity bound to the chain.
    ///
    /// # Panics
    ///
    /// Panics if no instance identity is bound.  Callers must guarantee the
    /// value is present before calling this, typically by having passed
    /// through [`Context::with_storage_service`] with the relevant
    /// instance-identity map in scope; use [`Context::instance_id`] when
    /// presence is not guaranteed.
    pub fn must_instance_id(&self) -> InstanceId {
        self.instance_id()
            .unwrap_or_else(|| panic!("invariant violation: no instance ID bound to context"))
    }

    /// The local devices bound to the chain, if any.
    pub fn local_devices(&self) -> Option<LocalDevices> {
        match self.value(&Key::LocalDevices) {
            Some(ContextValue::LocalDevices(ld)) => Some(ld),
            _ => None,
        }
    }

    /// The storage service bound to the chain, if any.
    pub fn service(&self) -> Option<Arc<StorageService>> {
        match self.value(&Key::Service) {
            Some(ContextValue::Service(svc)) => Some(svc),
            _ => None,
        }
    }

    /// The storage service bound to the chain.
    ///
    /// # Panics
    ///
    /// Panics if no service is bound; see [`Context::must_instance_id`] for
    /// the calling convention.
    pub fn must_service(&self) -> Arc<StorageService> {
        self.service()
            .unwrap_or_else(|| panic!("invariant violation: no storage service bound to context"))
    }

    /// The name of the bound storage service, if any.
    pub fn service_name(&self) -> Option<String> {
        match self.value(&Key::Service) {
            Some(ContextValue::Service(svc)) => Some(svc.name().to_owned()),
            Some(ContextValue::String(name)) => Some(name),
            _ => None,
        }
    }

    /// The transaction bound to the chain, if any.
    pub fn transaction(&self) -> Option<Transaction> {
        match self.value(&Key::Transaction) {
            Some(ContextValue::Transaction(tx)) => Some(tx),
            _ => None,
        }
    }

    /// The transaction bound to the chain.
    ///
    /// # Panics
    ///
    /// Panics if no transaction is bound; callers must have passed through
    /// [`Context::require_tx`] first.  Use [`Context::transaction`] when
    /// presence is not guaranteed.
    pub fn must_transaction(&self) -> Transaction {
        self.transaction()
            .unwrap_or_else(|| panic!("invariant violation: no transaction bound to context"))
    }

    /// The matched transport route, if any.
    pub fn route(&self) -> Option<RequestRoute> {
        match self.value(&Key::Route) {
            Some(ContextValue::Route(route)) => Some(route),
            _ => None,
        }
    }

    /// The name of the server handling the request, if any.
    pub fn server(&self) -> Option<String> {
        match self.value(&Key::Server) {
            Some(ContextValue::String(s)) => Some(s),
            _ => None,
        }
    }

    /// The request's storage profile, if any.
    pub fn profile(&self) -> Option<String> {
        match self.value(&Key::Profile) {
            Some(ContextValue::String(s)) => Some(s),
            _ => None,
        }
    }

    /// The id of the task this context runs under, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self.value(&Key::TaskId) {
            Some(ContextValue::TaskId(id)) => Some(id),
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Logging
    // -----------------------------------------------------------------------

    fn effective_logger(&self) -> Arc<Logger> {
        self.0
            .logger
            .read()
            .expect("context logger lock poisoned")
            .logger
            .clone()
    }

    /// The log level observed on this node.
    pub fn log_level(&self) -> LogLevel {
        self.effective_logger().level()
    }

    /// Set the log level on this node.
    ///
    /// If the effective level already equals `level` this is a no-op.
    /// Otherwise the node allocates its own copy of the logger (sink and
    /// format carry over) and sets the level on the copy, so the change is
    /// scoped to this node and its later derivations — it never leaks
    /// upward to ancestors or sideways to siblings sharing the same
    /// ancestor logger.
    pub fn set_log_level(&self, level: LogLevel) {
        let mut slot = self
            .0
            .logger
            .write()
            .expect("context logger lock poisoned");
        if slot.logger.level() == level {
            return;
        }
        slot.logger = Arc::new(slot.logger.with_level(level));
        slot.owned = true;
    }

    /// Emit a record through the context's logger.
    pub fn log(&self, level: LogLevel, msg: &str) {
        self.effective_logger().log(level, msg);
    }

    /// Emit an error-level record.
    pub fn error(&self, msg: impl AsRef<str>) {
        self.log(LogLevel::Error, msg.as_ref());
    }

    /// Emit a warn-level record.
    pub fn warn(&self, msg: impl AsRef<str>) {
        self.log(LogLevel::Warn, msg.as_ref());
    }

    /// Emit an info-level record.
    pub fn info(&self, msg: impl AsRef<str>) {
        self.log(LogLevel::Info, msg.as_ref());
    }

    /// Emit a debug-level record.
    pub fn debug(&self, msg: impl AsRef<str>) {
        self.log(LogLevel::Debug, msg.as_ref());
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = &*self.0;
        f.debug_struct("Context")
            .field("binding", &node.binding.as_ref().map(|(k, _)| k))
            .field("has_parent", &node.parent.is_some())
            .field("has_right", &node.right.is_some())
            .field("has_carrier", &node.carrier.is_some())
            .finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn iid(driver: &str, id: &str) -> InstanceId {
        InstanceId {
            id: id.to_owned(),
            driver: driver.to_owned(),
            fields: Default::default(),
        }
    }

    #[test]
    fn unbound_key_resolves_to_none() {
        let ctx = Context::background();
        assert!(ctx.value(&Key::custom("nope")).is_none());
        assert!(ctx.value(&Key::Service).is_none());
        assert!(ctx.transaction().is_none());
    }

    #[test]
    fn with_value_is_non_destructive() {
        let a = Context::background()
            .with_value(Key::custom("k1"), ContextValue::String("v1".into()));
        let b = a.with_value(Key::custom("k2"), ContextValue::String("v2".into()));

        assert_eq!(
            b.value(&Key::custom("k1")).and_then(|v| v.as_str().map(String::from)),
            Some("v1".into())
        );
        assert_eq!(
            b.value(&Key::custom("k2")).and_then(|v| v.as_str().map(String::from)),
            Some("v2".into())
        );
        // The original chain never sees the new binding.
        assert!(a.value(&Key::custom("k2")).is_none());
    }

    #[test]
    fn shadowing_resolves_to_the_nearest_binding() {
        let a = Context::background()
            .with_value(Key::custom("k"), ContextValue::String("old".into()));
        let b = a.with_value(Key::custom("k"), ContextValue::String("new".into()));

        assert_eq!(b.value(&Key::custom("k")).unwrap().as_str(), Some("new"));
        assert_eq!(a.value(&Key::custom("k")).unwrap().as_str(), Some("old"));
    }

    #[test]
    fn with_value_normalizes_custom_keys() {
        let tx = Transaction::new();
        let ctx = Context::background()
            .with_value(Key::custom("transaction"), ContextValue::Transaction(tx.clone()));
        assert_eq!(ctx.transaction(), Some(tx));
    }

    #[test]
    fn join_has_left_precedence() {
        let left = Context::background()
            .with_value(Key::custom("shared"), ContextValue::String("left".into()))
            .with_value(Key::custom("only-left"), ContextValue::String("l".into()));
        let right = Context::background()
            .with_value(Key::custom("shared"), ContextValue::String("right".into()))
            .with_value(Key::custom("only-right"), ContextValue::String("r".into()));

        let joined = left.join(Some(&right));

        assert_eq!(joined.value(&Key::custom("shared")).unwrap().as_str(), Some("left"));
        assert_eq!(joined.value(&Key::custom("only-left")).unwrap().as_str(), Some("l"));
        assert_eq!(joined.value(&Key::custom("only-right")).unwrap().as_str(), Some("r"));
    }

    #[test]
    fn join_identities() {
        let a = Context::background()
            .with_value(Key::custom("k"), ContextValue::String("v".into()));

        assert!(a.join(None).ptr_eq(&a));
        assert!(a.join(Some(&a)).ptr_eq(&a));

        let b = Context::background();
        assert!(!a.join(Some(&b)).ptr_eq(&a));
    }

    #[test]
    fn log_level_override_is_node_scoped() {
        let parent = Context::background();
        let child = parent.derive();
        let sibling = parent.derive();

        child.set_log_level(LogLevel::Trace);

        assert_eq!(child.log_level(), LogLevel::Trace);
        assert_eq!(parent.log_level(), LogLevel::Info);
        assert_eq!(sibling.log_level(), LogLevel::Info);

        // Derivations made after the override inherit the new level.
        assert_eq!(child.derive().log_level(), LogLevel::Trace);
    }

    #[test]
    fn set_log_level_same_level_is_a_noop() {
        let ctx = Context::background();
        ctx.set_log_level(LogLevel::Info);
        let slot = ctx.0.logger.read().unwrap();
        assert!(!slot.owned);
    }

    #[test]
    fn require_tx_is_idempotent() {
        let ctx = Context::background();
        let a = ctx.require_tx();
        let b = a.require_tx();

        let tx_a = a.transaction().expect("transaction bound");
        let tx_b = b.transaction().expect("transaction bound");
        assert_eq!(tx_a, tx_b);
        // The second call still produced a distinguishable node.
        assert!(!a.ptr_eq(&b));
    }

    struct MapCarrier(HashMap<Key, ContextValue>);

    impl Carrier for MapCarrier {
        fn get(&self, key: &Key) -> Option<ContextValue> {
            self.0.get(key).cloned()
        }
    }

    #[test]
    fn carrier_side_index_resolves_non_intrinsic_keys() {
        let carrier = Arc::new(MapCarrier(HashMap::from([(
            Key::custom("request-id"),
            ContextValue::String("req-7".into()),
        )])));
        let route = RequestRoute {
            name: "volumes".into(),
            method: "GET".into(),
            path: "/volumes".into(),
        };
        let ctx = Context::background().with_request_route(carrier, route.clone());

        assert_eq!(
            ctx.value(&Key::custom("request-id")).unwrap().as_str(),
            Some("req-7")
        );
        assert_eq!(ctx.route(), Some(route));
        assert!(ctx.carrier().is_some());
        // Descendants still reach the carrier through the chain.
        assert!(ctx.derive().carrier().is_some());
    }

    #[test]
    fn carrier_never_shadows_the_transaction() {
        let carrier = Arc::new(MapCarrier(HashMap::from([(
            Key::Transaction,
            ContextValue::Transaction(Transaction::new()),
        )])));
        let route = RequestRoute {
            name: "volumes".into(),
            method: "GET".into(),
            path: "/volumes".into(),
        };
        let ctx = Context::background()
            .require_tx()
            .with_request_route(carrier, route);

        let bound = ctx.transaction().expect("transaction bound");
        // require_tx on top still sees the chain's transaction, not the
        // carrier's.
        let again = ctx.require_tx();
        assert_eq!(again.transaction(), Some(bound));
    }

    #[test]
    #[should_panic(expected = "invariant violation")]
    fn must_instance_id_panics_when_absent() {
        Context::background().must_instance_id();
    }

    #[test]
    fn must_transaction_returns_the_bound_transaction() {
        let ctx = Context::background().require_tx();
        assert_eq!(ctx.must_transaction(), ctx.transaction().unwrap());
    }

    #[test]
    #[should_panic(expected = "invariant violation")]
    fn must_transaction_panics_when_absent() {
        Context::background().must_transaction();
    }

    #[test]
    fn instance_id_accessors() {
        let ctx = Context::background()
            .with_value(Key::InstanceId, ContextValue::InstanceId(iid("mock", "i-1")));
        assert_eq!(ctx.instance_id().unwrap().id, "i-1");
        assert_eq!(ctx.must_instance_id().id, "i-1");
    }
}
