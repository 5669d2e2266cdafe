//! Authentication strategies for SSH sessions.
//!
//! A trait-based strategy chain: agent, identity file, default
//! identities, password — assembled per session and tried in order, with
//! the first success ending the chain. A strategy that has no usable
//! material is skipped at build time, and an empty chain is surfaced as
//! `AuthPasswordRequired` before any network traffic: the runtime never
//! prompts.

mod agent;
mod chain;
mod key;
mod password;
mod traits;

pub(crate) use agent::AgentAuth;
pub(crate) use chain::{AuthChain, build_chain};
pub(crate) use key::KeyAuth;
pub(crate) use password::PasswordAuth;
