// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Bounded-concurrency task scheduling and priority message queueing.
//!
//! [`Scheduler`] caps in-flight task payloads with a counting semaphore and
//! keeps a priority-ordered pending list; [`MessageQueue`] provides
//! multi-band FIFO fan-in with backpressure, batched drain and a retrying
//! background worker.

mod queue;
mod scheduler;

pub use queue::{MessageHandler, MessagePriority, MessageQueue, QueueMessage, QueueStats};
pub use scheduler::{
    CancelFlag, Scheduler, SchedulerError, SchedulerStats, TaskPriority, TaskSnapshot, TaskStatus,
};
