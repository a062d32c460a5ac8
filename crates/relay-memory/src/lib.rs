// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Layered memory for agent sessions: a bounded short-term message log,
//! mid-term structured compression with history, long-term project facts
//! persisted as Markdown, and a capacity-bounded file-context injector,
//! unified behind [`MemoryManager`].

mod injector;
mod long_term;
mod manager;
mod mid_term;
mod short_term;

pub use injector::{ContextInjector, FileContext, InjectorError, InjectorStats};
pub use long_term::{LongTermMemory, LongTermStats, ProjectFacts, MEMORY_FILE_NAME};
pub use manager::MemoryManager;
pub use mid_term::{MidTermMemory, MidTermStats};
pub use short_term::{ShortTermMemory, ShortTermStats};
