//! Composite models.
//!
//! [`RdModel`] groups named entities under one node of the entity tree. A
//! child's id is derived from the model's id and the child's name, so both
//! endpoints assign the same ids without talking to each other. Binding the
//! model binds every child under it with the same lifetime.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::ProtocolError;
use crate::lifetime::Lifetime;
use crate::protocol::{Identities, Protocol, RdId};

use super::entity::{BindCore, RdBindable, RdDynamic};

type Children = Vec<(String, Arc<dyn RdBindable>)>;

/// A bindable node with named children.
///
/// # Example
///
/// ```rust,ignore
/// let model = RdModel::new();
/// let title = model.add("title", RdProperty::new(String::new()));
/// let items = model.add("items", RdList::<String>::new());
///
/// protocol.bind_root(&lifetime, "document", model.as_ref())?;
/// title.set("draft".into())?;
/// ```
pub struct RdModel {
    core: Arc<BindCore>,
    children: RwLock<Children>,
}

impl RdModel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { core: BindCore::new(), children: RwLock::new(Vec::new()) })
    }

    /// Allow the model itself to be bound from any thread. Children keep
    /// their own setting.
    pub fn make_async(self: Arc<Self>) -> Arc<Self> {
        self.core.set_async(true);
        self
    }

    /// Register `child` under `name` and return it.
    ///
    /// Children must be added before the model is identified.
    pub fn add<B>(&self, name: &str, child: Arc<B>) -> Arc<B>
    where
        B: RdBindable + 'static,
    {
        self.children.write().push((name.to_string(), child.clone() as Arc<dyn RdBindable>));
        child
    }

    pub fn child_names(&self) -> Vec<String> {
        self.children.read().iter().map(|(name, _)| name.clone()).collect()
    }

    fn child_id(identities: &Identities, id: RdId, name: &str) -> RdId {
        identities.mix(id, &format!(".{name}"))
    }
}

impl RdDynamic for RdModel {
    fn protocol(&self) -> Option<Arc<Protocol>> {
        self.core.protocol()
    }

    fn location(&self) -> String {
        self.core.location()
    }
}

impl RdBindable for RdModel {
    fn rd_id(&self) -> RdId {
        self.core.rd_id()
    }

    fn identify(&self, identities: &Identities, id: RdId) -> Result<(), ProtocolError> {
        self.core.identify(id)?;
        for (name, child) in self.children.read().iter() {
            child.identify(identities, Self::child_id(identities, id, name))?;
        }
        Ok(())
    }

    fn bind(&self, lifetime: &Lifetime, parent: &dyn RdDynamic, name: &str) -> Result<(), ProtocolError> {
        self.core.bind(lifetime, parent, name, None)?;

        let children: Children = self.children.read().clone();
        for (name, child) in children {
            child.bind(lifetime, self, &name)?;
        }
        Ok(())
    }

    fn is_bound(&self) -> bool {
        self.core.is_bound()
    }
}
