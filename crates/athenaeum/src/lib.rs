pub mod circulation;
pub mod cosine;
pub mod dedup;
pub mod error;
pub mod inverted_index;
pub mod learning;
pub mod librarian;
pub mod library;
pub mod magnitude_cache;
pub mod metadata_index;
pub mod preservation;
pub mod providers;
pub mod recommend;
pub mod rpc;
pub mod schema;
pub mod shelf;
pub mod stacks;
pub mod stacks_search;
pub mod storage;
pub mod text_cache;
pub mod topic_index;

pub use circulation::{CirculationDesk, Job};
pub use dedup::{Deduplication, DuplicateCheck};
pub use error::{AthenaeumError, Result};
pub use learning::{LearningConfig, LearningEngine, Weights};
pub use librarian::{create_default_librarian, DefaultLibrarian, DisposableConnection, Librarian, LibrarianRegistry};
pub use library::{CompendiumOptions, Library, PatronProfile};
pub use providers::{EmbeddingProvider, Event, EventSink, GenerateOptions, GenerateResult, TextGenerationProvider};
pub use rpc::{RpcClient, RpcError, RpcLibrarian};
pub use schema::Volume;
pub use shelf::Shelf;
pub use stacks::{LoadReport, Stacks};
pub use stacks_search::{parse_query, ParsedQuery, SearchOptions, SearchResult, StacksSearch};
pub use storage::{FileStorageBackend, StorageBackend};
