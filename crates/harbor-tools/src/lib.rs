// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
pub mod context;
pub mod registry;
pub mod tool;

pub use context::{
    PaymentSigner, ProgressKind, ProgressUpdate, SearchBackend, SearchHit, ToolContext,
};
pub use registry::{create_default, ToolDefinition, ToolRegistry};
pub use tool::{Tool, ToolCall, ToolError, ToolOutput, ToolWeight};

pub use builtin::bash::BashTool;
pub use builtin::canvas_render::CanvasRenderTool;
pub use builtin::fs::{
    FileAppendTool, FileEditTool, FileReadTool, FileWriteTool, ListDirTool, StatTool,
};
pub use builtin::grep::GrepTool;
pub use builtin::load_skill::LoadSkillTool;
pub use builtin::memory::{MemoryRecallTool, MemoryStoreTool};
pub use builtin::web_fetch::WebFetchTool;
pub use builtin::web_search::{HttpSearchBackend, WebSearchTool};
pub use builtin::x402::{HmacPaymentSigner, PaymentChallenge, PaymentRequirement};
