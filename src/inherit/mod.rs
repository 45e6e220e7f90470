pub mod store;
pub mod types;

pub use store::{InheritanceStore, LastSessionInfo};
pub use types::{
    InheritSource, InheritType, InheritanceConfig, InheritedContext, InheritedSummary,
    ProjectContext, SessionIndex, SessionIndexEntry, StoredSessionData, SummaryType,
};
