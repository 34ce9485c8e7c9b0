use crate::instance::ControlSignal;
use crate::power::RawBroadcast;

/// Input alphabet of the main dispatch loop.
pub enum AgentEvent {
    /// A power-setting broadcast arrived from the OS watcher thread.
    Power(RawBroadcast),
    /// A control signal was delivered by a secondary invocation.
    Control(ControlSignal),
    /// Ctrl+C received; the agent should exit cleanly.
    Shutdown,
}
