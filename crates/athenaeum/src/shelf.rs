use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::library::Library;
use crate::metadata_index::{FilterOp, MetadataFilter};
use crate::schema::Volume;
use crate::stacks_search::SearchOptions;

/// A named projection of a `Library` that transparently tags writes with
/// `metadata.shelf = <name>` and scopes reads to the same tag.
pub struct Shelf {
    name: String,
    library: Arc<Library>,
}

impl Shelf {
    pub fn new(name: impl Into<String>, library: Arc<Library>) -> Self {
        Self { name: name.into(), library }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn shelf_filter(&self) -> MetadataFilter {
        MetadataFilter {
            key: "shelf".into(),
            op: FilterOp::Eq,
            value: serde_json::json!(self.name),
        }
    }

    pub async fn add(&self, text: String, mut metadata: HashMap<String, String>) -> Result<String> {
        metadata.insert("shelf".to_string(), self.name.clone());
        self.library.add(text, metadata).await
    }

    /// Scoped to this shelf's tag.
    pub async fn search(&self, query: &str, max_results: usize) -> Result<Vec<Volume>> {
        let mut options = SearchOptions::with_defaults(max_results, 0.0, 0.6);
        options.metadata_filters.push(self.shelf_filter());
        self.library.search_with_options(query, options).await
    }

    /// Escapes the shelf filter, searching the whole Library.
    pub async fn search_global(&self, query: &str, max_results: usize) -> Result<Vec<Volume>> {
        let options = SearchOptions::with_defaults(max_results, 0.0, 0.6);
        self.library.search_with_options(query, options).await
    }

    pub async fn volumes(&self) -> Vec<Volume> {
        self.library
            .get_all()
            .await
            .into_iter()
            .filter(|v| v.shelf() == Some(self.name.as_str()))
            .collect()
    }
}
