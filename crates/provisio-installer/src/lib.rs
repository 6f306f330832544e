mod context;
mod fs_utils;
mod fsimage;
mod history;
mod journal;
mod layout;
mod metadata;
mod records;
mod sources;
mod types;

pub use context::ApplicationContext;
pub use fsimage::{CommitSummary, FsImage, FsTask, PathStatus};
pub use history::{Backward, HistoryChain, RecordId};
pub use journal::Journal;
pub use layout::EnvironmentLayout;
pub use metadata::{EnvironmentMetadata, UnitMetadata};
pub use records::{EnvironmentHistory, EnvironmentRecord, UnitHistory, UnitRecord};
pub use sources::{ContentSource, DirectoryContentSource, HistoryBackupSource};
pub use types::{ApplyReport, OperationKind, UnitOutcome, UnitOutcomeStatus};
