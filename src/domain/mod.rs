//! Domain layer: lending rules and the ports they persist through.

pub mod entities;
pub mod errors;
pub mod operation;
pub mod ports;
pub mod services;
pub mod value_objects;
