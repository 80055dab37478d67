//! agedrop - drop files and keys, get them encrypted or decrypted with age
//!
//! The library is the engine behind a drop target: it classifies dropped
//! items, keeps track of the operating mode and the remembered recipient
//! key, runs age for every payload, and reports one [`outcome::SessionResult`]
//! per drop. Presentation is left to the caller; the `agedrop` binary is a
//! command-line one.

#![forbid(unsafe_code)]

pub mod classify;
pub mod config;
pub mod error;
pub mod exec;
pub mod invocation;
pub mod mode;
pub mod outcome;
pub mod session;
pub mod settings;
