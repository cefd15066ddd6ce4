//! serde support for [`AnyMessage`].
//!
//! An `AnyMessage` field is written as `{"type": <type name>, "data": <json>}`
//! using the JSON codec registered for its runtime type. The codec is looked
//! up in the registry currently in scope on this thread: every
//! `SerializationRegistry::serialize`/`deserialize` call enters a scope, and
//! [`SerializationRegistry::in_scope`] opens one explicitly.

use std::cell::RefCell;
use std::marker::PhantomData;

use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{SerializationRegistry, JSON_CONTENT_TYPE};
use crate::error::SerializationError;
use crate::message::AnyMessage;

thread_local! {
    static ACTIVE: RefCell<Vec<SerializationRegistry>> = RefCell::new(Vec::new());
}

pub(super) struct Scope {
    _not_send: PhantomData<*const ()>,
}

pub(super) fn enter(registry: &SerializationRegistry) -> Scope {
    ACTIVE.with(|stack| stack.borrow_mut().push(registry.clone()));
    Scope {
        _not_send: PhantomData,
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        ACTIVE.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

fn active() -> Option<SerializationRegistry> {
    ACTIVE.with(|stack| stack.borrow().last().cloned())
}

#[derive(Serialize, Deserialize)]
struct Tagged {
    #[serde(rename = "type")]
    type_name: String,
    data: serde_json::Value,
}

impl Serialize for AnyMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let registry = active().ok_or_else(|| S::Error::custom(SerializationError::MissingContext))?;
        let bytes = registry
            .serialize(self, self.type_name(), JSON_CONTENT_TYPE)
            .map_err(S::Error::custom)?;
        let data: serde_json::Value = serde_json::from_slice(&bytes).map_err(S::Error::custom)?;
        Tagged {
            type_name: self.type_name().to_string(),
            data,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AnyMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tagged = Tagged::deserialize(deserializer)?;
        let registry = active().ok_or_else(|| D::Error::custom(SerializationError::MissingContext))?;
        let bytes = serde_json::to_vec(&tagged.data).map_err(D::Error::custom)?;
        registry
            .deserialize(&bytes, &tagged.type_name, JSON_CONTENT_TYPE)
            .map_err(D::Error::custom)
    }
}
