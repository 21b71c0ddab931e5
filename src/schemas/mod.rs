//! Wire schemas: broker event payloads and the observation-metadata
//! registry.

pub mod events;
pub mod metadata;
