//! The session relay core: per-session multiplexers, the process-wide
//! registry, the replay buffer, startup phase tracking, and connect timers.

mod buffer;
mod registry;
mod relay;
mod startup;
mod timeout;

pub use buffer::{BufferedEntry, DEFAULT_CAPACITY, MessageBuffer};
pub use registry::RelayRegistry;
pub use relay::{
    AgentAttach, AgentDetach, AgentOutbound, AgentSender, BrowserOutbound, BrowserSender,
    PhaseExtras, RelayOptions, SessionRelay, agent_channel, browser_channel, next_conn_id,
};
pub use startup::StartupPhase;
pub use timeout::ConnectionTimeouts;
