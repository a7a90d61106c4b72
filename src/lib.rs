//! Time Tracker - a countdown / count-up work timer with a persistent
//! session log.
//!
//! [`engine::TimerEngine`] owns the timer state machine and its recovery
//! snapshot; [`log_store::SessionLog`] owns the list of completed sessions.
//! Both share one [`persistence::Database`].

pub mod audio;
pub mod clock;
pub mod config;
pub mod engine;
pub mod event;
pub mod idle;
pub mod log_store;
pub mod logging;
pub mod models;
pub mod notifications;
pub mod persistence;
pub mod report;
pub mod time_util;
pub mod timer;
