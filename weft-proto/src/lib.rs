//! Wire types exchanged between a Weft runtime and an external transport.
//!
//! The unit of exchange is [`v1::Payload`]: a `(data_type, data_content_type,
//! data)` triple produced by the core serialization registry.

pub mod v1 {
    include!(concat!(env!("OUT_DIR"), "/weft.v1.rs"));
}

pub use v1::*;
