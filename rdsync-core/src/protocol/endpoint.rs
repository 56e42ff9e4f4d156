//! Protocol
//!
//! The composition root of one endpoint: identities, scheduler, wire,
//! serializers and the root lifetime. Entities reach all of these through the
//! protocol they are bound to.

use std::sync::{Arc, Weak};

use tracing::debug;

use crate::config::ProtocolConfig;
use crate::error::ProtocolError;
use crate::lifetime::Lifetime;
use crate::reactive::{InternRoot, Internable, RdBindable, RdDynamic};

use super::id::{IdKind, Identities, RdId};
use super::scheduler::Scheduler;
use super::serializer::{SerializationCtx, Serializers};
use super::wire::Wire;

/// Scope name of the intern root every protocol owns.
pub const PROTOCOL_INTERN_SCOPE: &str = "Protocol";

/// One endpoint of a synchronized connection.
pub struct Protocol {
    name: String,
    config: ProtocolConfig,
    identities: Identities,
    scheduler: Arc<dyn Scheduler>,
    wire: Arc<dyn Wire>,
    serialization: SerializationCtx,
    lifetime: Lifetime,
    intern_root: Arc<InternRoot<String>>,
    me: Weak<Protocol>,
}

impl Protocol {
    /// Create an endpoint living as long as `lifetime`.
    ///
    /// Binds the protocol-level `String` intern root under the
    /// [`PROTOCOL_INTERN_SCOPE`] scope.
    pub fn new(
        config: ProtocolConfig,
        scheduler: Arc<dyn Scheduler>,
        wire: Arc<dyn Wire>,
        lifetime: &Lifetime,
    ) -> Result<Arc<Self>, ProtocolError> {
        let lifetime = lifetime.create_nested();
        lifetime.set_termination_wait(config.termination_wait());
        let protocol = Arc::new_cyclic(|me| Self {
            name: config.name.clone(),
            identities: Identities::new(config.id_kind),
            config,
            scheduler,
            wire,
            serialization: SerializationCtx::new(Arc::new(Serializers::new())),
            lifetime,
            intern_root: InternRoot::new(),
            me: me.clone(),
        });

        let root = Arc::clone(&protocol.intern_root);
        root.identify(&protocol.identities, protocol.identities.mix(RdId::NULL, "ProtocolInternRoot"))?;
        root.bind(&protocol.lifetime, protocol.as_ref(), "ProtocolInternRoot")?;
        protocol.serialization.register_intern_root(PROTOCOL_INTERN_SCOPE, root);

        debug!(protocol = %protocol.name, kind = ?protocol.identities.kind(), "protocol created");
        Ok(protocol)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn identities(&self) -> &Identities {
        &self.identities
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn wire(&self) -> &Arc<dyn Wire> {
        &self.wire
    }

    pub fn serialization_ctx(&self) -> &SerializationCtx {
        &self.serialization
    }

    pub fn serializers(&self) -> &Serializers {
        self.serialization.serializers()
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    /// The protocol-level intern root for strings.
    pub fn intern_root(&self) -> &Arc<InternRoot<String>> {
        &self.intern_root
    }

    /// Properties are master on the server side unless overridden.
    pub fn is_master(&self) -> bool {
        self.identities.kind() == IdKind::Server
    }

    /// Identify `entity` with a stable id derived from `name` and bind it as
    /// a top-level entity of this protocol.
    pub fn bind_root(&self, lifetime: &Lifetime, name: &str, entity: &dyn RdBindable) -> Result<(), ProtocolError> {
        entity.identify(&self.identities, self.identities.mix(RdId::NULL, name))?;
        entity.bind(lifetime, self, name)
    }

    /// Identify and bind an intern root and make it available to
    /// [`SerializationCtx::write_interned`] under `scope`.
    pub fn register_intern_root<T: Internable>(
        &self,
        lifetime: &Lifetime,
        scope: &str,
        root: Arc<InternRoot<T>>,
    ) -> Result<(), ProtocolError> {
        let name = format!("InternRoot-{scope}");
        root.identify(&self.identities, self.identities.mix(RdId::NULL, &name))?;
        root.bind(lifetime, self, &name)?;
        self.serialization.register_intern_root(scope, root);
        Ok(())
    }
}

impl RdDynamic for Protocol {
    fn protocol(&self) -> Option<Arc<Protocol>> {
        self.me.upgrade()
    }

    fn location(&self) -> String {
        self.name.clone()
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("kind", &self.identities.kind())
            .field("connected", &self.wire.is_connected())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
