//! # autopilot-core
//!
//! Supervisor core for the autopilot watchdog: keeps headless AI coding
//! assistants in tmux windows moving across many projects.
//!
//! This crate provides:
//! - The supervisor tick loop with graceful shutdown and ack checks
//! - Window state classification from pane text and the process tree
//! - The rule engine with its guard stack (cooldowns, backoff, inertia)
//! - A verified terminal-injection channel with escalating strategies
//! - The incremental review pipeline (commit detection, triggers, consumer)
//! - Durable filesystem state with mkdir-based locks

pub mod classifier;
pub mod config;
pub mod exec;
pub mod git;
pub mod injector;
pub mod lockfile;
pub mod notify;
pub mod nudge;
pub mod paths;
pub mod patterns;
pub mod proc;
pub mod queue;
pub mod review;
pub mod rules;
pub mod state_store;
pub mod supervisor;
pub mod tmux;

pub use classifier::{classify_pane, Classifier, Observation, WindowStatus};
pub use config::{AutopilotConfig, ConfigError, Project, ProjectsSource, TelegramConfig};
pub use injector::{InjectError, Injector, Strategy};
pub use lockfile::{DirLock, GlobalLock, LockError};
pub use notify::{NoopNotifier, Notifier};
pub use nudge::{NudgeContext, PreCompactSnapshot};
pub use paths::{sanitize_window, StatePaths};
pub use patterns::{PatternOverrides, PatternSet};
pub use queue::TaskQueue;
pub use review::{ReviewConsumer, ReviewOutcome, ReviewTrigger};
pub use rules::{ActionKind, Decision, Guard, GuardCtx, Rule, RuleSet, RuleSpec, Verdict};
pub use state_store::WindowSnapshot;
pub use supervisor::{Supervisor, SupervisorError};
pub use tmux::{Tmux, TmuxError};
