//! statespan reconstructs intervals of validity for entities whose state
//! changes sparsely over time, from time-ordered change-event streams in a
//! data warehouse.
//!
//! The core is a family of single-pass finite-state-machine transforms
//! ([`fsm`]) fed by an ordered row source ([`source`]) and drained into a
//! bulk sink ([`sink`]). The [`query`] module guarantees the stream ordering
//! the state machines depend on.

pub mod config;
pub mod event;
pub mod export;
pub mod fsm;
pub mod migrate;
pub mod pipeline;
pub mod query;
pub mod row;
pub mod sink;
pub mod source;
