//! File operations over named connections
//!
//! The glue between the hosting platform and the connection layer: [`Connections`] pairs the
//! deployment's connection configuration with a [`pool::ConnectionRegistry`], and the
//! functions in [`ops`] run one file operation each against a connection, taking a
//! [`lease::LeaseLock`] around writes when the connection (or the call) asks for it.
//!
//! Failures come back as [`common::Error`]; [`Report`] turns them into the structured
//! outcome the `vfsop` binary prints.

mod connections;
pub mod ops;
mod report;

pub use connections::Connections;
pub use ops::{WriteSettings, delete, exists, read, write};
pub use report::{Operation, Report};
