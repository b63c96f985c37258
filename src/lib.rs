#![warn(clippy::pedantic)]
// Noisy doc/signature lints — would require annotating hundreds of pub functions
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
// Style preference — keeping format!("{}", x) over format!("{x}") for readability with complex exprs
#![allow(clippy::uninlined_format_args)]
// Intentional casts in token-count and timing code
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
// Loop and dispatch functions are naturally long; splitting would be artificial
#![allow(clippy::too_many_lines)]
#![allow(clippy::module_name_repetitions)]

pub mod agent;
pub mod config;
pub mod errors;
pub mod providers;
pub mod trace;

pub use agent::{AgentLoop, Conversation, FinalResponse, LoopConfig, RunOptions};
pub use config::Config;
pub use errors::IronloomError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
