#![warn(clippy::pedantic)]
// Noisy doc/signature lints — would require annotating hundreds of pub functions
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
// Style preference — keeping format!("{}", x) over format!("{x}") for readability with complex exprs
#![allow(clippy::uninlined_format_args)]
// Intentional casts in token accounting and backoff math
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
// The conversation loop is naturally long; splitting would be artificial
#![allow(clippy::too_many_lines)]
#![allow(clippy::module_name_repetitions)]

pub mod agent;
pub mod broker;
pub mod cache;
pub mod cli;
pub mod config;
pub mod errors;
pub mod events;
pub mod federation;
pub mod llm;
pub mod mcp;
pub mod trace;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
