//! # Proactive Behavior Scheduler
//!
//! Autonomous pacing that acts on a session without the user asking:
//!
//! - [`burst`]: extra follow-ups while the character's arousal stays high
//! - [`idle`]: conversation starters after a quiet stretch
//! - [`proactive`]: delayed messages after synchronous exchanges, one pending
//!   task per (character, user) pair

pub mod burst;
pub mod idle;
pub mod proactive;

pub use burst::{BurstPolicy, BurstTracker};
pub use idle::IdleRotation;
pub use proactive::{LockRegistry, ProactiveScheduler, ProactiveSettings};
