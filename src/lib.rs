//! linewatch — run a command, watch its output for a pattern, and exit on
//! the first decisive condition: a match, a timeout, or natural completion.
//!
//! The engine is a small concurrent state machine: one blocking-read thread
//! per monitored channel ([`reader`]), a single event loop that matches
//! lines ([`dispatch`]) and arbitrates four independent deadlines
//! ([`deadline`]), and an orchestrator that owns spawn and shutdown
//! ([`orchestrator`]). Every run produces exactly one immutable
//! [`outcome::ExecutionOutcome`].

pub mod cli;
pub mod config;
pub mod deadline;
pub mod dispatch;
pub mod history;
pub mod matcher;
pub mod orchestrator;
pub mod outcome;
pub mod reader;
pub mod request;
