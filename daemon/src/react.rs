use std::path::PathBuf;

use crate::config::Config;
use crate::power::SemanticEvent;

/// A side effect the agent performs in response to a closing transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Launch the configured script, fire-and-forget.
    RunScript(PathBuf),
    /// Lock the interactive session. Failure is fatal for the process.
    LockSession,
}

/// Decides the effects for a classified event.
///
/// Only closing transitions (`LidClosed`, `MonitorOff`) produce effects.
/// The returned order is the execution order: a script launch must be
/// requested before the session lock, because locking may suspend further
/// processing until unlock.
///
/// An agent configured with neither a script nor `-lock` still locks on a
/// closing transition — the default-safe behavior.
pub fn react(event: SemanticEvent, config: &Config) -> Vec<Effect> {
    if !event.is_closing() {
        return Vec::new();
    }

    let mut effects = Vec::new();
    if let Some(path) = &config.run_script {
        effects.push(Effect::RunScript(path.clone()));
    }
    if config.lock_on_close || config.run_script.is_none() {
        effects.push(Effect::LockSession);
    }
    effects
}
