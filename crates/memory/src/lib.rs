pub mod cache;
pub mod engine;
pub mod error;
pub mod parse;
pub mod range_filter;
pub mod resources;
pub mod schema;
pub mod storage;
pub mod tracker;

mod consolidate;
mod ingest;

pub use cache::ProfileCache;
pub use engine::{EngineSettings, ProfileMemory, SearchRequest};
pub use error::{MemoryError, Result};
pub use parse::{ConsolidationPlan, ProfileCommand, extract_response_json};
pub use range_filter::range_filter;
pub use resources::{Resource, ResourceDefinition, ResourceInitializer};
pub use schema::{
    HistoryMessage, IsolationValue, Isolations, NewProfileFeature, ProfileEntry, ProfileFact,
    ProfileView, canonical_isolations, isolations_match,
};
pub use storage::{ProfileStorage, redb_store::RedbProfileStore};
pub use tracker::UpdateTrackerManager;
