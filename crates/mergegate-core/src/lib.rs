pub mod adapter;
pub mod aggregator;
pub mod changeset;
pub mod config;
pub mod normalizer;
pub mod publish;
pub mod report;
pub mod resolver;
pub mod scheduler;

pub use adapter::{
    FuzzAdapter, InvocationOutcome, InvocationStatus, LlmReviewAdapter, LlmSettings, RawFinding,
    SemgrepAdapter, ToolAdapter, ToolInvocation,
};
pub use aggregator::{AggregationError, Aggregator, RunReport};
pub use changeset::{ChangeSet, ChangeStatus, FileChange};
pub use config::{
    CommandSpec, ConfigError, DedupConfig, ManualOverrides, RunConfig, ToolConfig, ToolKind,
};
pub use normalizer::{Finding, Location, Severity};
pub use publish::CommentPublisher;
pub use report::{render_report, OutputFormat};
pub use resolver::{resolve, ScanTarget};
pub use scheduler::Scheduler;
