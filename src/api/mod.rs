//! HTTP handlers (§6). Each submodule owns one resource family and talks to
//! its service type on `AppState` directly — no handler touches `rusqlite`.

pub mod health;
pub mod hosts;
pub mod pcs;
pub mod queue;
pub mod relay_ws;
pub mod reservations;
pub mod sessions;
pub mod stream;
