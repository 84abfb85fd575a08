//! Purpose: Shared-memory handoff channel between a DCC plugin process and its orchestrator.
//! Exports: `api` (stable surface), `core` (segment, codec, lock, session), `abi` (C entry points).
//! Role: Library backing the `altermesh` CLI, the C ABI, and Rust embedders.
//! Invariants: Prefer `api` for embedding; `core` paths may change between releases.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod abi;
pub mod api;
pub mod core;
pub(crate) mod json;
pub mod segment_paths;
