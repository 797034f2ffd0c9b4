//! `mbot-lcm` – the binary side of the bridge.
//!
//! Knows how bus payloads are laid out and how to move between raw bytes,
//! typed binary records and schema-agnostic structured values.
//!
//! # Modules
//!
//! - [`schema`] – field schemas ([`TypeSchema`]) for bus record types.
//! - [`record`] – [`LcmRecord`], a decoded, strongly typed binary record.
//! - [`codec`] – LCM fingerprints and big-endian wire encoding.
//! - [`directory`] – the statically registered [`TypeDirectory`] and the
//!   [`TypeResolver`] that performs name resolution and trial-decode
//!   discovery.
//! - [`marshal`] – record ⇄ [`Value`][mbot_types::Value] conversion.
//! - [`builtin`] – the `mbot_lcm_msgs` namespace shipped with the bridge.

pub mod builtin;
pub mod codec;
pub mod directory;
pub mod marshal;
pub mod record;
pub mod schema;

pub use builtin::BUILTIN_NAMESPACE;
pub use directory::{Namespace, TypeDirectory, TypeEntry, TypeResolver};
pub use marshal::{from_structured, to_structured};
pub use record::{Field, LcmRecord};
pub use schema::{Dimension, FieldSchema, FieldType, Primitive, TypeSchema};
