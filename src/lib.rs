pub mod compression;
pub mod config;
pub mod error;
pub mod investigation;
pub mod runtime;
pub mod session;
pub mod store;
pub mod testing;

pub mod prelude {
    pub use crate::compression::{
        MemoryCompressor, PersistentKind, TierBudgets, TurnRecord, TurnSummarizer,
    };
    pub use crate::config::StateConfig;
    pub use crate::error::{InvestigationError, Result};
    pub use crate::investigation::{Investigation, InvestigationState, Phase};
    pub use crate::runtime::StateServices;
    pub use crate::session::{ResumeOutcome, SessionLifecycleManager};
    pub use crate::store::{Deadline, FileStateStore, InMemoryStateStore, StoreBackend};
}
