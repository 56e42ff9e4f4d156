//! Serialization
//!
//! Values cross the wire through the [`Marshaller`] trait: a pair of `read`
//! and `write` functions over a [`Buffer`], with access to the endpoint's
//! [`SerializationCtx`]. Generated model code only has to provide these two
//! functions per type.
//!
//! Types that already implement serde can be wrapped in [`MsgPack`] and are
//! encoded as a length-prefixed MessagePack blob.
//!
//! # Polymorphic Values
//!
//! [`Serializers`] maps concrete types to ids derived from their type names,
//! so a value whose concrete type is only known at runtime can be written as
//! `[RdId type][u32 length][payload]` and read back on the other side.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::error::ProtocolError;
use crate::reactive::{InternRoot, Internable};

use super::buffer::Buffer;
use super::id::RdId;

/// Read and write functions for one type.
pub trait Marshaller: Sized {
    fn read(ctx: &SerializationCtx, buffer: &mut Buffer) -> Result<Self, ProtocolError>;

    fn write(&self, ctx: &SerializationCtx, buffer: &mut Buffer) -> Result<(), ProtocolError>;
}

macro_rules! primitive_marshaller {
    ($($ty:ty => $write:ident, $read:ident;)*) => {
        $(
            impl Marshaller for $ty {
                fn read(_ctx: &SerializationCtx, buffer: &mut Buffer) -> Result<Self, ProtocolError> {
                    Ok(buffer.$read()?)
                }

                fn write(&self, _ctx: &SerializationCtx, buffer: &mut Buffer) -> Result<(), ProtocolError> {
                    buffer.$write(*self);
                    Ok(())
                }
            }
        )*
    };
}

primitive_marshaller! {
    bool => write_bool, read_bool;
    u8 => write_u8, read_u8;
    i16 => write_i16, read_i16;
    u16 => write_u16, read_u16;
    i32 => write_i32, read_i32;
    u32 => write_u32, read_u32;
    i64 => write_i64, read_i64;
    u64 => write_u64, read_u64;
    f32 => write_f32, read_f32;
    f64 => write_f64, read_f64;
    RdId => write_rd_id, read_rd_id;
}

impl Marshaller for () {
    fn read(_ctx: &SerializationCtx, _buffer: &mut Buffer) -> Result<Self, ProtocolError> {
        Ok(())
    }

    fn write(&self, _ctx: &SerializationCtx, _buffer: &mut Buffer) -> Result<(), ProtocolError> {
        Ok(())
    }
}

impl Marshaller for String {
    fn read(_ctx: &SerializationCtx, buffer: &mut Buffer) -> Result<Self, ProtocolError> {
        Ok(buffer.read_string()?)
    }

    fn write(&self, _ctx: &SerializationCtx, buffer: &mut Buffer) -> Result<(), ProtocolError> {
        buffer.write_string(self);
        Ok(())
    }
}

impl<T: Marshaller> Marshaller for Option<T> {
    fn read(ctx: &SerializationCtx, buffer: &mut Buffer) -> Result<Self, ProtocolError> {
        if buffer.read_bool()? {
            T::read(ctx, buffer).map(Some)
        } else {
            Ok(None)
        }
    }

    fn write(&self, ctx: &SerializationCtx, buffer: &mut Buffer) -> Result<(), ProtocolError> {
        buffer.write_bool(self.is_some());
        match self {
            Some(value) => value.write(ctx, buffer),
            None => Ok(()),
        }
    }
}

impl<T: Marshaller> Marshaller for Vec<T> {
    fn read(ctx: &SerializationCtx, buffer: &mut Buffer) -> Result<Self, ProtocolError> {
        let len = buffer.read_u32()? as usize;
        // a corrupt length must not trigger a huge allocation up front
        let mut items = Vec::with_capacity(len.min(buffer.remaining()));
        for _ in 0..len {
            items.push(T::read(ctx, buffer)?);
        }
        Ok(items)
    }

    fn write(&self, ctx: &SerializationCtx, buffer: &mut Buffer) -> Result<(), ProtocolError> {
        buffer.write_u32(self.len() as u32);
        self.iter().try_for_each(|item| item.write(ctx, buffer))
    }
}

impl<A: Marshaller, B: Marshaller> Marshaller for (A, B) {
    fn read(ctx: &SerializationCtx, buffer: &mut Buffer) -> Result<Self, ProtocolError> {
        Ok((A::read(ctx, buffer)?, B::read(ctx, buffer)?))
    }

    fn write(&self, ctx: &SerializationCtx, buffer: &mut Buffer) -> Result<(), ProtocolError> {
        self.0.write(ctx, buffer)?;
        self.1.write(ctx, buffer)
    }
}

/// Any serde type, encoded as a length-prefixed MessagePack blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct MsgPack<T>(pub T);

impl<T> MsgPack<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: Serialize + DeserializeOwned> Marshaller for MsgPack<T> {
    fn read(_ctx: &SerializationCtx, buffer: &mut Buffer) -> Result<Self, ProtocolError> {
        let bytes = buffer.read_byte_array()?;
        rmp_serde::from_slice(&bytes)
            .map(MsgPack)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    fn write(&self, _ctx: &SerializationCtx, buffer: &mut Buffer) -> Result<(), ProtocolError> {
        let bytes = rmp_serde::to_vec(&self.0).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        buffer.write_byte_array(&bytes);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Polymorphic registry
// ----------------------------------------------------------------------------

type AnyValue = Box<dyn Any + Send + Sync>;
type ReadFn = Arc<dyn Fn(&SerializationCtx, &mut Buffer) -> Result<AnyValue, ProtocolError> + Send + Sync>;
type WriteFn = Arc<dyn Fn(&SerializationCtx, &mut Buffer, &dyn Any) -> Result<(), ProtocolError> + Send + Sync>;

/// Registry of types that can be written polymorphically.
#[derive(Default)]
pub struct Serializers {
    writers: RwLock<HashMap<TypeId, (RdId, WriteFn)>>,
    readers: RwLock<HashMap<RdId, ReadFn>>,
}

impl Serializers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `RdId::NULL.mix(type_name)`.
    ///
    /// Both endpoints must register the same name for the same type.
    /// Registering a type twice replaces the previous entry.
    pub fn register<T>(&self, type_name: &str) -> RdId
    where
        T: Marshaller + Any + Send + Sync,
    {
        let id = RdId::NULL.mix(type_name);

        let write: WriteFn = Arc::new(|ctx: &SerializationCtx, buffer: &mut Buffer, value: &dyn Any| match value.downcast_ref::<T>() {
            Some(value) => value.write(ctx, buffer),
            None => Err(ProtocolError::Serialization("polymorphic writer type mismatch".into())),
        });
        let read: ReadFn = Arc::new(|ctx: &SerializationCtx, buffer: &mut Buffer| T::read(ctx, buffer).map(|v| Box::new(v) as AnyValue));

        self.writers.write().insert(TypeId::of::<T>(), (id, write));
        self.readers.write().insert(id, read);
        trace!(type_name, %id, "registered serializer");
        id
    }

    pub fn is_registered<T: Any>(&self) -> bool {
        self.writers.read().contains_key(&TypeId::of::<T>())
    }

    /// Write `[type id][u32 length][payload]`, or a null type id for `None`.
    pub fn write_polymorphic<T>(
        &self,
        ctx: &SerializationCtx,
        buffer: &mut Buffer,
        value: Option<&T>,
    ) -> Result<(), ProtocolError>
    where
        T: Any,
    {
        let Some(value) = value else {
            buffer.write_rd_id(RdId::NULL);
            return Ok(());
        };

        let (id, write) = self
            .writers
            .read()
            .get(&TypeId::of::<T>())
            .cloned()
            .ok_or_else(|| ProtocolError::Serialization(format!("{} is not registered", std::any::type_name::<T>())))?;

        buffer.write_rd_id(id);
        let length_at = buffer.len();
        buffer.write_u32(0);
        write(ctx, buffer, value)?;
        let length = buffer.len() - length_at - 4;
        buffer.patch_u32(length_at, length as u32);
        Ok(())
    }

    /// Read a value written by [`write_polymorphic`](Self::write_polymorphic).
    ///
    /// Unknown type ids are skipped over and reported as
    /// [`ProtocolError::UnknownType`], leaving the buffer after the value.
    pub fn read_polymorphic<T>(&self, ctx: &SerializationCtx, buffer: &mut Buffer) -> Result<Option<T>, ProtocolError>
    where
        T: Any,
    {
        let id = buffer.read_rd_id()?;
        if id.is_null() {
            return Ok(None);
        }

        let length = buffer.read_u32()? as usize;
        let Some(read) = self.readers.read().get(&id).cloned() else {
            let mut skipped = 0;
            while skipped < length {
                buffer.read_u8()?;
                skipped += 1;
            }
            return Err(ProtocolError::UnknownType { id });
        };

        let value = read(ctx, buffer)?;
        value
            .downcast::<T>()
            .map(|v| Some(*v))
            .map_err(|_| ProtocolError::Serialization(format!("type id {id} is not a {}", std::any::type_name::<T>())))
    }
}

// ----------------------------------------------------------------------------
// Serialization context
// ----------------------------------------------------------------------------

/// Per-protocol serialization state: the type registry and the intern roots
/// visible to values written through this context.
pub struct SerializationCtx {
    serializers: Arc<Serializers>,
    intern_roots: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl SerializationCtx {
    pub fn new(serializers: Arc<Serializers>) -> Self {
        Self { serializers, intern_roots: RwLock::new(HashMap::new()) }
    }

    pub fn serializers(&self) -> &Serializers {
        &self.serializers
    }

    /// Make `root` the intern root for values written under `scope`.
    pub fn register_intern_root<T: Internable>(&self, scope: &str, root: Arc<InternRoot<T>>) {
        self.intern_roots.write().insert(scope.to_string(), root);
    }

    pub fn intern_root<T: Internable>(&self, scope: &str) -> Option<Arc<InternRoot<T>>> {
        let root = self.intern_roots.read().get(scope).cloned()?;
        root.downcast::<InternRoot<T>>().ok()
    }

    /// Write `value` as an intern index, or as `-1` followed by the value
    /// itself when no root is registered for `scope`.
    pub fn write_interned<T: Internable>(&self, buffer: &mut Buffer, scope: &str, value: &T) -> Result<(), ProtocolError> {
        match self.intern_root::<T>(scope) {
            Some(root) => {
                let index = root.intern(value)?;
                buffer.write_i32(InternRoot::<T>::wire_index(index));
                Ok(())
            }
            None => {
                buffer.write_i32(-1);
                value.write(self, buffer)
            }
        }
    }

    pub fn read_interned<T: Internable>(&self, buffer: &mut Buffer, scope: &str) -> Result<T, ProtocolError> {
        let index = buffer.read_i32()?;
        if index == -1 {
            return T::read(self, buffer);
        }
        self.intern_root::<T>(scope)
            .ok_or(ProtocolError::UnknownInternId { index })?
            .un_intern(index)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
