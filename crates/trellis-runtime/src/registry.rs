//! Implementation registry — local services and how to invoke them.
//!
//! Maps a service name to a factory (keyed by lifetime) and a table of
//! type-erased async method handlers. There is no runtime code generation:
//! the registry IS the dispatch table, and the typed [`ServiceBuilder`]
//! wraps argument decoding, invocation, and result encoding around each
//! handler. Handlers are awaited before their value is serialized, so the
//! wire never carries a future.
//!
//! Registration is append-only at startup; lookups afterwards are
//! lock-free reads.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use trellis_core::{RpcError, ScopeId};

/// A type-erased service instance.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// A type-erased method handler: instance + encoded args → encoded result.
pub type MethodFn =
    Arc<dyn Fn(Instance, Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, RpcError>> + Send + Sync>;

/// Instance lifetime for a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// One cached instance for the process lifetime.
    Singleton,
    /// One instance per scope id, created on first use within the scope.
    Scoped,
    /// A fresh instance for every call.
    Transient,
}

/// One method of a service descriptor.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub param_type: &'static str,
    /// `None` for methods that return nothing.
    pub return_type: Option<&'static str>,
}

/// Immutable description of a registered service.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub lifetime: Lifetime,
    pub methods: Vec<MethodDescriptor>,
}

struct Registration {
    descriptor: ServiceDescriptor,
    factory: Arc<dyn Fn() -> Instance + Send + Sync>,
    singleton: OnceLock<Instance>,
    methods: HashMap<String, MethodFn>,
}

/// A scoped instance slot. Local holders keep the `Arc`; the slot keeps a
/// `Weak` so an abandoned scope becomes sweepable. Scopes used by remote
/// callers are pinned strongly until the caller releases the scope — or,
/// if the release never arrives, until the pin sits idle past the
/// sweeper's TTL.
struct ScopeSlot {
    weak: Weak<dyn Any + Send + Sync>,
    pin: Option<Instance>,
    last_used: Instant,
}

pub struct ImplementationRegistry {
    services: DashMap<String, Arc<Registration>>,
    scopes: DashMap<(String, ScopeId), ScopeSlot>,
}

impl ImplementationRegistry {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            scopes: DashMap::new(),
        }
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    pub fn descriptor(&self, service: &str) -> Option<ServiceDescriptor> {
        self.services.get(service).map(|r| r.descriptor.clone())
    }

    /// The sorted set of service names this node hosts locally — the
    /// payload of the catalogue exchange.
    pub fn local_service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Resolve an instance honoring the lifetime and scope.
    ///
    /// `pin_scope` is set for remote callers: their scoped instance is held
    /// strongly until the scope is released, because nothing else in this
    /// process keeps it alive.
    pub fn resolve(
        &self,
        service: &str,
        scope: Option<ScopeId>,
        pin_scope: bool,
    ) -> Result<Instance, RpcError> {
        let reg = self
            .services
            .get(service)
            .ok_or_else(|| RpcError::no_route(service))?
            .value()
            .clone();

        match reg.descriptor.lifetime {
            Lifetime::Singleton => Ok(reg.singleton.get_or_init(|| (reg.factory)()).clone()),
            Lifetime::Transient => Ok((reg.factory)()),
            Lifetime::Scoped => {
                let scope = scope.ok_or_else(|| {
                    RpcError::application(format!(
                        "service {service:?} is scoped and requires a scope id"
                    ))
                })?;
                Ok(self.scoped_instance(&reg, service, scope, pin_scope))
            }
        }
    }

    fn scoped_instance(
        &self,
        reg: &Registration,
        service: &str,
        scope: ScopeId,
        pin: bool,
    ) -> Instance {
        match self.scopes.entry((service.to_string(), scope)) {
            Entry::Occupied(mut slot) => {
                if let Some(instance) = slot.get().weak.upgrade() {
                    let slot = slot.get_mut();
                    if pin && slot.pin.is_none() {
                        slot.pin = Some(instance.clone());
                    }
                    slot.last_used = Instant::now();
                    return instance;
                }
                // The previous instance died; start the scope over.
                let instance = (reg.factory)();
                *slot.get_mut() = ScopeSlot {
                    weak: Arc::downgrade(&instance),
                    pin: pin.then(|| instance.clone()),
                    last_used: Instant::now(),
                };
                instance
            }
            Entry::Vacant(slot) => {
                let instance = (reg.factory)();
                slot.insert(ScopeSlot {
                    weak: Arc::downgrade(&instance),
                    pin: pin.then(|| instance.clone()),
                    last_used: Instant::now(),
                });
                instance
            }
        }
    }

    /// Invoke `service.method` with encoded arguments.
    pub async fn invoke(
        &self,
        service: &str,
        method: &str,
        scope: Option<ScopeId>,
        args: Vec<u8>,
        pin_scope: bool,
    ) -> Result<Vec<u8>, RpcError> {
        let handler = {
            let reg = self
                .services
                .get(service)
                .ok_or_else(|| RpcError::no_route(service))?;
            reg.methods.get(method).cloned().ok_or_else(|| {
                RpcError::application(format!("service {service:?} has no method {method:?}"))
            })?
        };
        let instance = self.resolve(service, scope, pin_scope)?;
        handler(instance, args).await
    }

    /// Drop the strong pins for a scope across all services. Instances
    /// still held elsewhere survive until their last holder drops them.
    pub fn release_scope(&self, scope: ScopeId) {
        self.scopes.retain(|(_, sid), slot| {
            if *sid == scope {
                slot.pin = None;
                slot.weak.upgrade().is_some()
            } else {
                true
            }
        });
    }

    /// Remove slots whose instance has died, plus pinned slots whose
    /// release never arrived and that have sat idle past `pin_idle`. Run
    /// periodically by the runtime's sweeper task.
    pub fn sweep_scopes(&self, pin_idle: Duration) -> usize {
        let before = self.scopes.len();
        self.scopes.retain(|_, slot| {
            if slot.pin.is_some() {
                slot.last_used.elapsed() < pin_idle
            } else {
                slot.weak.upgrade().is_some()
            }
        });
        before - self.scopes.len()
    }

    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }
}

impl Default for ImplementationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive a service name from an interface-style name: a leading `I`
/// followed by an uppercase letter is stripped.
pub fn service_name_from_interface(interface: &str) -> &str {
    let mut chars = interface.chars();
    if chars.next() == Some('I') {
        if let Some(second) = chars.next() {
            if second.is_ascii_uppercase() {
                return &interface[1..];
            }
        }
    }
    interface
}

// ── Typed builder ─────────────────────────────────────────────────────────────

/// Builds a service registration with typed method handlers.
///
/// ```ignore
/// ServiceBuilder::new("IEcho", Lifetime::Singleton, EchoService::new)
///     .method("ping", |svc: Arc<EchoService>, (text,): (String,)| async move {
///         Ok(svc.ping(&text))
///     })
///     .register(runtime.registry());
/// ```
pub struct ServiceBuilder<S> {
    name: String,
    lifetime: Lifetime,
    factory: Arc<dyn Fn() -> Arc<S> + Send + Sync>,
    methods: HashMap<String, MethodFn>,
    descriptors: Vec<MethodDescriptor>,
    _marker: PhantomData<fn() -> S>,
}

impl<S: Send + Sync + 'static> ServiceBuilder<S> {
    /// `interface` may carry the leading-`I` convention; the registered
    /// service name has it stripped.
    pub fn new<F>(interface: &str, lifetime: Lifetime, factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
    {
        Self {
            name: service_name_from_interface(interface).to_string(),
            lifetime,
            factory: Arc::new(move || Arc::new(factory())),
            methods: HashMap::new(),
            descriptors: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Add a method. Arguments arrive as one tuple; the handler's value is
    /// awaited and serialized before it goes on the wire.
    pub fn method<A, R, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: MethodFn = Arc::new(move |instance: Instance, args: Vec<u8>| {
            let handler = handler.clone();
            Box::pin(async move {
                let service = instance
                    .downcast::<S>()
                    .map_err(|_| RpcError::application("service instance type mismatch"))?;
                let parsed: A = bincode::deserialize(&args)
                    .map_err(|e| RpcError::application(format!("argument decode failed: {e}")))?;
                let value = handler(service, parsed).await?;
                bincode::serialize(&value)
                    .map_err(|e| RpcError::application(format!("result encode failed: {e}")))
            })
        });
        self.methods.insert(name.to_string(), erased);
        self.descriptors.push(MethodDescriptor {
            name: name.to_string(),
            param_type: type_name::<A>(),
            return_type: if type_name::<R>() == "()" {
                None
            } else {
                Some(type_name::<R>())
            },
        });
        self
    }

    pub fn register(self, registry: &ImplementationRegistry) {
        let factory = self.factory;
        let erased: Arc<dyn Fn() -> Instance + Send + Sync> = Arc::new(move || {
            let instance: Instance = factory();
            instance
        });
        let descriptor = ServiceDescriptor {
            name: self.name.clone(),
            lifetime: self.lifetime,
            methods: self.descriptors,
        };
        tracing::debug!(service = %descriptor.name, lifetime = ?self.lifetime, "service registered");
        registry.services.insert(
            self.name,
            Arc::new(Registration {
                descriptor,
                factory: erased,
                singleton: OnceLock::new(),
                methods: self.methods,
            }),
        );
    }
}
