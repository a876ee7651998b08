//! Runtime plumbing around the interpreter
//!
//! The serializer that keeps each chat's updates in order, and the
//! persistence seam used by extension functions.

mod serializer;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use serializer::{JobHandle, SerializerError, UpdateSerializer};
pub use traits::*;
