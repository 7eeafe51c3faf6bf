//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own business logic and persistence concerns so route
//! handlers can stay focused on protocol translation. The combat timeline is
//! split across four services: `action` schedules, `execution` applies,
//! `expiry` prunes, `navigation` moves the round/event pointer and ties the
//! other three together.

pub mod action;
pub mod execution;
pub mod expiry;
pub mod map;
pub mod navigation;
pub mod object;
pub mod persistence;
