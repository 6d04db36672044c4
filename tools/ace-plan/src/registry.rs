//! Process-wide engine for this binary.
//!
//! Library code takes an `&Engine`; only the application decides that one
//! engine lives for the whole process.

use ace_numeric::{Engine, EngineConfig, EngineResult};
use once_cell::sync::OnceCell;

static ENGINE: OnceCell<Engine> = OnceCell::new();

/// Build the global engine from `config`, or return the one already built.
pub fn init(config: EngineConfig) -> EngineResult<&'static Engine> {
    ENGINE.get_or_try_init(|| Engine::new(config))
}

/// The global engine, if [`init`] has run.
pub fn global() -> Option<&'static Engine> {
    ENGINE.get()
}
