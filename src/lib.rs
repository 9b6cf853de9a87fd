//! Foreman is a distributed task-execution platform.
//!
//! A central dispatch service accepts task invocations over gRPC, records
//! them in month-partitioned Postgres tables, and forwards each one to a
//! live worker discovered through lease-based registration in etcd. Workers
//! host registered task functions with per-invocation cancellation, timeout
//! enforcement, and panic containment, streaming logs and status updates
//! back to dispatch.
//!
//! The crate splits into:
//! - [`dispatch`]: the central service and its gRPC server
//! - [`worker`]: the worker runtime, task registry, and log pipe
//! - [`store`]: the partitioned result/log store (Postgres and in-memory)
//! - [`registry`]: lease-based service registration and discovery
//! - [`status`]: the invocation status state machine

pub mod config;
pub mod dispatch;
pub mod messages;
pub mod registry;
pub mod retry;
pub mod status;
pub mod store;
pub mod test_support;
pub mod worker;

pub use dispatch::{DispatchServerHandle, DispatchService};
pub use status::TaskStatus;
pub use worker::{TaskContext, TaskParam, Worker, WorkerConfig};
