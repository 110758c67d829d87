//! tgwatch - supervisor for the chat bridge bot.
//!
//! Keeps one bot process running while any terminal session is registered,
//! restarts it when it exits, and backs off with an alert when it crash-loops.

pub mod alert;
pub mod clock;
pub mod config;
pub mod launcher;
pub mod liveness;
pub mod lock;
pub mod policy;
pub mod registry;
pub mod shutdown;
pub mod supervisor;
