//! Message model: an open tagged union of typed messages.
//!
//! Every payload that crosses the runtime implements [`MessageType`], which
//! gives it a stable type name (the dispatch and serialization discriminant)
//! and optionally a list of ancestor views. A message that *specialises*
//! another one embeds it and exposes it through [`MessageType::ancestors`];
//! handlers declared for the ancestor then receive that embedded view when no
//! handler for the concrete type exists.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A concrete message type.
///
/// ```
/// use weft_core::message::{Ancestor, MessageType};
///
/// #[derive(Clone, Debug, PartialEq)]
/// struct Base { text: String }
/// impl MessageType for Base { const TYPE_NAME: &'static str = "Base"; }
///
/// #[derive(Clone, Debug, PartialEq)]
/// struct Loud { base: Base, volume: u8 }
/// impl MessageType for Loud {
///     const TYPE_NAME: &'static str = "Loud";
///     fn ancestors(&self) -> Vec<Ancestor<'_>> {
///         vec![Ancestor::new(1, &self.base)]
///     }
/// }
/// ```
pub trait MessageType: Any + Clone + fmt::Debug + PartialEq + Send + Sync {
    /// Discriminant used for handler lookup and codec lookup.
    const TYPE_NAME: &'static str;

    /// Ancestor views of this value, each tagged with its distance from the
    /// concrete type (1 = direct parent).
    fn ancestors(&self) -> Vec<Ancestor<'_>> {
        Vec::new()
    }
}

/// A view of a message as one of its ancestor types.
#[derive(Clone, Copy)]
pub struct Ancestor<'a> {
    depth: usize,
    type_name: &'static str,
    view: &'a (dyn Any + Send + Sync),
}

impl<'a> Ancestor<'a> {
    /// Declares `view` as the ancestor `T` at `depth` (clamped to at least 1).
    pub fn new<T: MessageType>(depth: usize, view: &'a T) -> Self {
        Self {
            depth: depth.max(1),
            type_name: T::TYPE_NAME,
            view,
        }
    }

    fn own<T: MessageType>(value: &'a T) -> Self {
        Self {
            depth: 0,
            type_name: T::TYPE_NAME,
            view: value,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast<T: MessageType>(&self) -> Option<&'a T> {
        self.view.downcast_ref::<T>()
    }
}

impl fmt::Debug for Ancestor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ancestor")
            .field("depth", &self.depth)
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Object-safe face of [`MessageType`]; implemented for every message type.
pub trait Message: fmt::Debug + Send + Sync + 'static {
    fn type_name(&self) -> &'static str;

    /// The value itself at depth 0 followed by its declared ancestors.
    fn lineage(&self) -> Vec<Ancestor<'_>>;

    fn as_any(&self) -> &(dyn Any + Send + Sync);

    fn dyn_eq(&self, other: &dyn Message) -> bool;
}

impl<T: MessageType> Message for T {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn lineage(&self) -> Vec<Ancestor<'_>> {
        let mut lineage = vec![Ancestor::own(self)];
        lineage.extend(self.ancestors());
        lineage
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn dyn_eq(&self, other: &dyn Message) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .map_or(false, |other| other == self)
    }
}

/// Type-erased, cheaply cloneable message payload.
///
/// This is what travels inside envelopes and what replies come back as. It
/// is also the field type to use for polymorphic members of serializable
/// containers: serialization writes the runtime type name next to the data.
#[derive(Clone)]
pub struct AnyMessage(Arc<dyn Message>);

impl AnyMessage {
    pub fn new<T: MessageType>(message: T) -> Self {
        Self(Arc::new(message))
    }

    pub fn type_name(&self) -> &'static str {
        self.0.type_name()
    }

    pub fn is<T: MessageType>(&self) -> bool {
        self.0.as_any().is::<T>()
    }

    /// Borrow the payload as its exact runtime type.
    pub fn downcast_ref<T: MessageType>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    /// Clone the payload out as its exact runtime type.
    pub fn downcast<T: MessageType>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }

    /// Borrow the payload as `T`, either its own type or a declared ancestor.
    pub fn view<T: MessageType>(&self) -> Option<&T> {
        self.0
            .lineage()
            .into_iter()
            .find(|ancestor| ancestor.type_name() == T::TYPE_NAME)
            .and_then(|ancestor| ancestor.downcast::<T>())
    }

    pub fn lineage(&self) -> Vec<Ancestor<'_>> {
        self.0.lineage()
    }

    pub fn as_message(&self) -> &dyn Message {
        self.0.as_ref()
    }
}

impl<T: MessageType> From<T> for AnyMessage {
    fn from(message: T) -> Self {
        AnyMessage::new(message)
    }
}

impl fmt::Debug for AnyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl PartialEq for AnyMessage {
    fn eq(&self, other: &Self) -> bool {
        self.0.dyn_eq(other.as_message())
    }
}
