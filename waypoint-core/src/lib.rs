pub mod analyzer;
pub mod backoff;
pub mod context;
pub mod error;
pub mod gemini;
pub mod generator;
pub mod github;
pub mod http;
pub mod matcher;
pub mod mentor;
pub mod milestone;
pub mod model;
pub mod prompts;
pub mod recording;
pub mod verdict;

pub use analyzer::{Analysis, CommitAnalyzer, CommitSummary};
pub use backoff::{BackoffPolicy, FailureKind, ModelTiers, RetryDecision, Tier};
pub use context::{
    BatchDelays, ContextJob, ContextKind, ContextPayload, ContextPlan, ContextReport,
    ContextRequest, ContextSynthesizer, ContextTarget,
};
pub use error::{PipelineError, Upstream};
pub use gemini::GeminiClient;
pub use generator::{ContentGenerator, GenerationError, TextBackend};
pub use github::{GitHubClient, HostingError, HostingService};
pub use http::{base_http_client, create_http_client};
pub use matcher::{CommitMatcher, MatchOutcome};
pub use mentor::{ChatReply, GuidancePayload, Mentor};
pub use milestone::{MilestoneEvent, MilestoneStatus, TransitionResult};
pub use model::{
    CommitSha, Milestone, Project, ProjectId, RepoCoordinates, RepositoryConnection,
};
pub use prompts::PatchLimits;
pub use recording::{
    CorrelationId, Direction, EventType, RecordedEvent, Sanitizer, ServiceType,
    CORRELATION_ID_HEADER,
};
pub use verdict::{CommitVerdict, GoalAssessment, ParsedVerdict, VerdictMetrics};
