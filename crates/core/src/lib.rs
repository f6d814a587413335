//! Engine crate for the fincoach dashboard's AI-assisted features.
//!
//! Two loosely related mechanisms live here: assembling streamed model
//! output into a continuously growing text value (`assembler`, `chat_client`,
//! `insight`), and the investor-psychology questionnaire session machine
//! (`backend`, `question`, `profile`, `session`). Both talk to remote
//! services exclusively through injected trait objects.

pub mod assembler;
pub mod backend;
pub mod chat_client;
pub mod error;
pub mod insight;
pub mod profile;
pub mod question;
pub mod session;
pub mod throttle;

pub use error::{CoreError, CoreResult};
