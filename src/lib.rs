//! A BBC BASIC V interpreter: tokenised line store, typed evaluation
//! stack, assignment dispatch engine and an immediate-command processor,
//! all sharing one linear workspace.

pub mod assign;
pub mod commands;
pub mod errors;
pub mod eval;
pub mod host;
pub mod interp;
pub mod printfmt;
pub mod program;
pub mod pseudovars;
pub mod stack;
pub mod tokens;
pub mod values;
pub mod variables;
pub mod workspace;
