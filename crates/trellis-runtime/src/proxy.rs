//! Table-driven dispatchers for remote services.
//!
//! A [`ServiceProxy`] stands in for a service with no local implementation.
//! Each call boxes its arguments into a tuple, serializes them, hands the
//! `"service.method"` procedure to the invocation engine, and decodes the
//! result — or re-raises the wire error unchanged. Property accessors are
//! the `get_x` / `set_x` method convention.
//!
//! [`ScopedProxy`] binds a fresh scope id so the remote side keeps one
//! scoped instance for this dispatcher. Dropping the handle releases the
//! scope best-effort; hold it for as long as the scope must live.

use std::ops::Deref;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use trellis_core::{RpcError, ScopeId};

use crate::registry::service_name_from_interface;
use crate::RuntimeInner;

/// The reserved procedure a dropped scope handle sends to its host.
pub(crate) const SCOPE_RELEASE: &str = "$scope.release";

#[derive(Clone)]
pub struct ServiceProxy {
    inner: Arc<RuntimeInner>,
    service: String,
    scope: Option<ScopeId>,
}

impl ServiceProxy {
    pub(crate) fn new(inner: Arc<RuntimeInner>, interface: &str) -> Self {
        Self {
            inner,
            service: service_name_from_interface(interface).to_string(),
            scope: None,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Invoke `method` with an argument tuple, decoding the result.
    pub async fn call<A, R>(&self, method: &str, args: A) -> Result<R, RpcError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let args = bincode::serialize(&args)
            .map_err(|e| RpcError::application(format!("argument encode failed: {e}")))?;
        let procedure = format!("{}.{}", self.service, method);
        let result = self.inner.invoke_raw(self.scope, &procedure, args).await?;
        bincode::deserialize(&result)
            .map_err(|e| RpcError::application(format!("result decode failed: {e}")))
    }

    /// Invoke a method that returns nothing.
    pub async fn call_unit<A: Serialize>(&self, method: &str, args: A) -> Result<(), RpcError> {
        self.call::<A, ()>(method, args).await
    }

    /// Read a remote property via its `get_` accessor.
    pub async fn get<R: DeserializeOwned>(&self, property: &str) -> Result<R, RpcError> {
        self.call(&format!("get_{property}"), ()).await
    }

    /// Write a remote property via its `set_` accessor.
    pub async fn set<V: Serialize>(&self, property: &str, value: V) -> Result<(), RpcError> {
        self.call_unit(&format!("set_{property}"), (value,)).await
    }

    /// Bind a fresh scope, so the remote side serves this dispatcher from
    /// one scoped instance.
    pub fn scoped(&self) -> ScopedProxy {
        let scope = rand::random();
        ScopedProxy {
            proxy: ServiceProxy {
                inner: self.inner.clone(),
                service: self.service.clone(),
                scope: Some(scope),
            },
            scope,
        }
    }
}

/// A dispatcher bound to one scoped instance on the remote side. Hold it
/// for as long as the scope must live.
pub struct ScopedProxy {
    proxy: ServiceProxy,
    scope: ScopeId,
}

impl ScopedProxy {
    pub fn scope_id(&self) -> ScopeId {
        self.scope
    }
}

impl Deref for ScopedProxy {
    type Target = ServiceProxy;

    fn deref(&self) -> &ServiceProxy {
        &self.proxy
    }
}

impl Drop for ScopedProxy {
    fn drop(&mut self) {
        let scope = self.scope;
        let inner = self.proxy.inner.clone();
        let service = self.proxy.service.clone();
        // Best-effort release on every peer that may host the scope. Off a
        // tokio context (e.g. a test dropping late) the host's idle-pin
        // sweep is the fallback.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                inner.release_scope_everywhere(&service, scope).await;
            });
        }
    }
}
