//! # Path Watcher
//!
//! This crate watches a directory (optionally its whole subtree) and reports
//! created, modified and deleted paths to a listener from a managed
//! background task.
//!
//! ## Features
//!
//! - **Recursive Watching**: Newly created directories are picked up as they appear
//! - **Platform Recursion**: Native subtree watches where the backend offers them
//! - **Lifecycle Notifications**: Start, failure and stop of every watcher
//! - **Failure Isolation**: A failing listener stops only its own watcher
//! - **Single Path Watching**: Follow one file through its parent directory
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Path Watcher                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  WatcherFactory ──► WatcherTask ──► TaskScheduler               │
//! │       │                  │                                      │
//! │       ▼                  ▼                                      │
//! │  RegistrationStrategy  WatchEngine ──► PathChangeListener       │
//! │                          │     │                                │
//! │                          ▼     ▼                                │
//! │               WatchRegistry   WatchPrimitive (notify)           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod factory;
pub mod listener;
pub mod primitive;
pub mod registry;
pub mod scheduler;
pub mod strategy;
pub mod task;

pub use config::{Backend, WatcherConfig};
pub use engine::{EngineState, WatchEngine};
pub use error::{Result, WatcherError};
pub use event::{EventKind, PathEvent};
pub use factory::WatcherFactory;
pub use listener::{
    ChannelListener, LifecycleListener, NoopLifecycleListener, PathChangeListener, WatcherId,
};
pub use primitive::backend::NotifyProvider;
pub use primitive::{PrimitiveProvider, WatchPrimitive};
pub use registry::WatchRegistry;
pub use scheduler::{Job, ScheduledTask, TaskScheduler, ThreadScheduler, TokioScheduler};
pub use strategy::RegistrationStrategy;
pub use task::{TaskState, WatcherTask};
