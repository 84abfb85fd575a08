//! Purpose: Internal JSON parsing boundary shared by the message layer and the CLI.
//! Exports: `parse` module with decode helpers and failure categories.
//! Role: Single seam for parser details so callsites avoid ad hoc decode logic.
//! Invariants: Message JSON decoding goes through this module.

pub(crate) mod parse;
