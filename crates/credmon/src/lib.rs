//! credmon: turns opaque per-user credential requests into installed,
//! privilege-restricted credentials for a batch scheduler.
//!
//! Each cycle lists `<user>.cred` files, decides per user whether the
//! derived `<user>.cc` needs renewal, produces a new one through the
//! selected backend, runs post-actions, installs it atomically, reaps
//! credentials of users without active jobs and finally raises the
//! completion flag.

pub mod config;
pub mod install;
pub mod layout;
pub mod monitor;
pub mod post_action;
pub mod privilege;
pub mod producer;
pub mod reaper;
pub mod renewal;
pub mod scheduler;
pub mod supervisor;
pub mod validate;
