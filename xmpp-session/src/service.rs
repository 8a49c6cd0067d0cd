// Copyright (c) 2026 xmpp-rs contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Client services
//!
//! Protocol extensions are implemented as [`Service`]s which live in a
//! per-client registry. A service is built the first time it is requested
//! through [`Client::summon`][`crate::client::Client::summon`], after the
//! services it depends on. Each service type exists at most once per
//! client.
//!
//! Services only interact with the session through the public surface of
//! the [`StanzaBroker`] and the client signals handed to them in the
//! [`ServiceContext`].

use alloc::sync::Arc;
use core::any::{type_name, Any, TypeId};
use core::fmt;
use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::broker::StanzaBroker;
use crate::client::ClientSignals;
use crate::jid::Jid;
use crate::Error;

/// A protocol extension built on top of the session engine.
pub trait Service: Any + Send + Sync + Sized {
    /// Services which must be built before this one.
    fn dependencies() -> Vec<ServiceKind> {
        Vec::new()
    }

    /// Build the service.
    ///
    /// `deps` holds an instance of every service returned by
    /// [`Self::dependencies`].
    fn new(ctx: &ServiceContext, deps: &Dependencies) -> Result<Self, Error>;

    /// Release whatever the service registered with the session.
    ///
    /// Called when the client is stopped, in reverse order of construction.
    fn shutdown(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

type AnyArc = Arc<dyn Any + Send + Sync>;

trait ErasedService: Send + Sync {
    fn shutdown(self: Arc<Self>) -> BoxFuture<'static, ()>;
}

impl<S: Service> ErasedService for S {
    fn shutdown(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Service::shutdown(self)
    }
}

struct Instance {
    name: &'static str,
    any: AnyArc,
    erased: Arc<dyn ErasedService>,
}

fn build<S: Service>(ctx: &ServiceContext, deps: &Dependencies) -> Result<Instance, Error> {
    let service = Arc::new(S::new(ctx, deps)?);
    Ok(Instance {
        name: type_name::<S>(),
        any: service.clone(),
        erased: service,
    })
}

/// Type-erased reference to a [`Service`] type, used to declare
/// dependencies.
#[derive(Clone, Copy)]
pub struct ServiceKind {
    id: TypeId,
    name: &'static str,
    dependencies: fn() -> Vec<ServiceKind>,
    build: fn(&ServiceContext, &Dependencies) -> Result<Instance, Error>,
}

impl ServiceKind {
    /// The kind of service `S`.
    pub fn of<S: Service>() -> Self {
        Self {
            id: TypeId::of::<S>(),
            name: type_name::<S>(),
            dependencies: S::dependencies,
            build: build::<S>,
        }
    }

    /// Name of the service type.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("ServiceKind").field(&self.name).finish()
    }
}

impl PartialEq for ServiceKind {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceKind {}

/// The already-built dependencies of a service under construction.
#[derive(Default)]
pub struct Dependencies {
    inner: HashMap<TypeId, AnyArc>,
}

impl Dependencies {
    /// Get the instance of dependency `S`.
    ///
    /// Fails with [`Error::InvalidState`] if `S` was not declared as a
    /// dependency.
    pub fn get<S: Service>(&self) -> Result<Arc<S>, Error> {
        self.inner
            .get(&TypeId::of::<S>())
            .and_then(|any| any.clone().downcast::<S>().ok())
            .ok_or(Error::InvalidState)
    }
}

/// What a service gets to work with.
#[derive(Clone)]
pub struct ServiceContext {
    /// The client's stanza broker.
    pub broker: StanzaBroker,

    /// The client's lifecycle signals.
    pub signals: Arc<ClientSignals>,

    /// The account address the client was configured with.
    pub jid: Jid,
}

/// Per-client arena of services.
pub struct ServiceRegistry {
    ctx: ServiceContext,
    instances: HashMap<TypeId, Instance>,
    order: Vec<TypeId>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            ctx,
            instances: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Get the instance of `S`, building it and its dependencies first if
    /// needed.
    pub fn summon<S: Service>(&mut self) -> Result<Arc<S>, Error> {
        let any = self.summon_kind(ServiceKind::of::<S>(), &mut Vec::new())?;
        any.downcast::<S>().map_err(|_| Error::InvalidState)
    }

    fn summon_kind(
        &mut self,
        kind: ServiceKind,
        stack: &mut Vec<ServiceKind>,
    ) -> Result<AnyArc, Error> {
        if let Some(instance) = self.instances.get(&kind.id) {
            return Ok(instance.any.clone());
        }
        if let Some(start) = stack.iter().position(|k| *k == kind) {
            let path: Vec<&str> = stack[start..]
                .iter()
                .map(|k| k.name)
                .chain([kind.name])
                .collect();
            return Err(Error::ServiceCycle(path.join(" -> ")));
        }

        stack.push(kind);
        let mut deps = Dependencies::default();
        for dep in (kind.dependencies)() {
            let instance = self.summon_kind(dep, stack)?;
            deps.inner.insert(dep.id, instance);
        }
        stack.pop();

        log::debug!("Building service {}", kind.name);
        let instance = (kind.build)(&self.ctx, &deps)?;
        let any = instance.any.clone();
        self.instances.insert(kind.id, instance);
        self.order.push(kind.id);
        Ok(any)
    }

    /// Get the instance of `S` if it has been built.
    pub fn get<S: Service>(&self) -> Option<Arc<S>> {
        self.instances
            .get(&TypeId::of::<S>())
            .and_then(|instance| instance.any.clone().downcast::<S>().ok())
    }

    /// Number of services built.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Return true if no service has been built.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Remove all services and return a future which shuts them down, most
    /// recently built first.
    pub fn shutdown(&mut self) -> BoxFuture<'static, ()> {
        let services: Vec<Instance> = self
            .order
            .drain(..)
            .rev()
            .filter_map(|id| self.instances.remove(&id))
            .collect();
        Box::pin(async move {
            for instance in services {
                log::debug!("Shutting down service {}", instance.name);
                instance.erased.shutdown().await;
            }
        })
    }
}
