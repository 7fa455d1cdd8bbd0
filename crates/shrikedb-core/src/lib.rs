//! In-memory columnar store for aggregation queries over append-only data.
//!
//! Tables are collections of typed columns addressed by 1-based row
//! positions. Dict-encoded string columns keep an inverted index from each
//! distinct value to a roaring bitmap of its positions; filtering and
//! grouping are bitmap intersections over those indexes, so queries never
//! scan string data. Everything lives on the heap of the owning process,
//! nothing is persisted.
//!
//! The [`catalog::Catalog`] owns the tables; [`query::Query`] borrows one
//! table and runs the filter, group, order, limit pipeline against it.

pub mod catalog;
pub mod error;
pub mod field;
pub mod query;
pub mod table;
pub mod value;

pub use catalog::{validate_identifier, Catalog};
pub use error::CoreError;
pub use field::Field;
pub use query::{
    AggregationGroup, FilterExpr, GroupByExpr, OrderByExpr, Query, QueryOutput, QueryStats,
    SelectExpr,
};
pub use table::{FieldInfo, FieldSpec, FieldStats, Table, TableStats};
pub use value::{FieldEncoding, FieldType, Value};
