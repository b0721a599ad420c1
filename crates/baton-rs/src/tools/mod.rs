//! Function-calling tool abstractions.
//!
//! Host agents expose capabilities to the model as [`Tool`] implementors. The
//! delegation operation ships as one:
//! [`RunSubtaskTool`](crate::agent::sub_agent::RunSubtaskTool).
//!
//! - [`core`] — [`Tool`] trait, [`ToolFuture`], argument parsing and
//!   JSON-Schema validation helpers.

pub mod core;

pub use self::core::{Tool, ToolFuture, parse_tool_args, validate_tool_arguments};
