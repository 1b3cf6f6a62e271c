pub mod agent;
pub mod cancel;
pub mod config;
pub mod environment;
pub mod orchestrator;
pub mod process;
pub mod registry;
pub mod reporter;
pub mod selection;
pub mod state;

pub use agent::{AgentInvoker, AgentRequest, AgentRun, CommandAgent, ProgressSink};
pub use cancel::CancellationToken;
pub use config::{
    AgentConfig, CampaignConfig, EnvironmentConfig, NamingConfig, ProgressConfig,
};
pub use environment::{ComposeEnvironment, Endpoint, EnvironmentManager, StartReport, StopReport};
pub use orchestrator::{
    evaluate_flag, plan_campaign, CampaignPhase, CampaignPlan, CampaignReport, Orchestrator,
};
pub use process::{run_bounded, BoundedOutput, CommandSpec, ProcessError};
pub use registry::{Registry, RegistryError};
pub use reporter::Reporter;
pub use selection::{
    load_retry_plan, request_ids, FailedBenchmark, RetryPlan, RunSelection, SelectionError,
    SelectionRequest,
};
pub use state::StateStore;
