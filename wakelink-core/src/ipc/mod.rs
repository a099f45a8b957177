//! Event types broadcast by the engine.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them as JSON (log sinks, a local status socket, a companion app).

pub mod events;
