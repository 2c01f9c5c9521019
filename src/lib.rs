//! doccat - catalogs of secondary indexes over a hierarchical object store.
//!
//! A [`Catalog`] holds named indexes (field, keyword, facet, text, path and
//! allowed-principal) and keeps them in step with the resources of an
//! [`objectmap::ObjectMap`]. Index changes raised inside a transaction are
//! applied immediately, at commit, or handed to a durable queue that a
//! [`BasicActionProcessor`] drains in the background.
//!
//! # Quick start
//!
//! ```
//! use std::sync::Arc;
//!
//! use doccat::{
//!     Catalog,
//!     discriminators::Discriminator,
//!     index::{Fragment, FieldIndex, IndexMeta},
//!     objectmap::MemoryObjectMap,
//!     resource::{Content, Resource},
//!     search::{Search, SearchOptions},
//! };
//!
//! let objectmap = Arc::new(MemoryObjectMap::new());
//! let mut catalog = Catalog::new("app", objectmap);
//! catalog.add_index(
//!     "title",
//!     Box::new(FieldIndex::new(
//!         Discriminator::attribute("title"),
//!         IndexMeta::default(),
//!     )),
//! );
//!
//! for (oid, title) in [(1, "alpha"), (2, "beta")] {
//!     let doc: Arc<dyn Resource> =
//!         Content::new(oid).with("title", title).into_arc();
//!     catalog.index_doc(oid, doc).unwrap();
//! }
//!
//! let result = Search::new(&catalog)
//!     .search(
//!         &[("title", Fragment::Eq("beta".into()))],
//!         &SearchOptions::default(),
//!     )
//!     .unwrap();
//! assert_eq!(result.ids, vec![2]);
//! ```

pub mod action;
pub mod catalog;
pub mod config;
pub mod data_dir;
pub mod discriminators;
pub mod doc_id;
pub mod error;
pub mod index;
pub mod objectmap;
pub mod processor;
pub mod queue_db;
pub mod resource;
pub mod search;
pub mod security;
pub mod txn;
pub mod value;

pub use action::{Action, ActionKind, IndexKey};
pub use catalog::{Catalog, Catalogs};
pub use config::CatalogConfig;
pub use data_dir::DataDir;
pub use doc_id::{DocId, DocSet};
pub use error::{Error, Result};
pub use processor::BasicActionProcessor;
pub use queue_db::QueueDb;
pub use value::Value;
