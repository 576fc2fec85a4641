//! `jobq-scheduler` — cron-driven recurring job submission with SQLite
//! persistence.
//!
//! # Overview
//!
//! Definitions live in a `schedules` table next to the job tables. The
//! [`engine::Scheduler`] keeps a min-heap of upcoming trigger times, sleeps
//! until the earliest one and enqueues a job through the
//! [`jobq_queue::QueueRegistry`] every time a definition comes due.
//!
//! # Delivery
//!
//! | Situation                     | Behaviour                                   |
//! |-------------------------------|---------------------------------------------|
//! | Tick reached                  | One job enqueued, cursor moved past now     |
//! | Several ticks missed          | Coalesced into a single job                 |
//! | Restart after a fired tick    | Cursor is persisted first, tick not repeated |
//! | Target queue rejects the job  | Logged, cursor still advances               |
//!
//! Expressions use the five-field form (`min hour dom month dow`, Sunday is
//! 0 or 7) and are evaluated in the definition's IANA timezone. As in
//! standard cron, restricting both `dom` and `dow` makes either one enough.

pub mod db;
pub mod engine;
pub mod error;
pub mod schedule;
pub mod types;

pub use engine::Scheduler;
pub use error::{Result, SchedulerError};
pub use schedule::CronSpec;
pub use types::{NewSchedule, ScheduledJobDefinition};
