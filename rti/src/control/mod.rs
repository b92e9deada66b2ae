//! Runtime control
//!
//! A [`RuntimeControlFsm`] turns `rti/control` messages into lifecycle
//! transitions of its client and calls back into [`RuntimeControlHooks`].

mod fsm;
mod hooks;

pub use fsm::RuntimeControlFsm;
pub use hooks::{LoadOutcome, NoHooks, RuntimeControlHooks};
