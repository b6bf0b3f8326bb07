pub mod agent;
pub mod desktop;
pub mod memory;
pub mod model;
pub mod session;
pub mod translator;

pub use agent::{
    ActionRequest, ActionResult, Agent, AgentConfig, AgentError, Decision, ExecutionReport,
    LoopState, Mode, Screenshot, ShutdownMode, Target,
};
pub use desktop::{DesktopConfig, X11Desktop};
pub use memory::{ConversationMemory, ConversationTurn};
pub use model::{ModelClient, ModelConfig};
pub use session::Session;
