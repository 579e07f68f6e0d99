extern crate thiserror;

mod layout;
#[cfg(test)]
mod testutil;

pub mod apiset;
pub mod common;
pub mod context;
pub mod graph;
pub mod image;
pub mod lookup_path;
pub mod query;
pub mod system;
pub mod traverse;
pub mod view;

pub use apiset::ApiSetResolver;
pub use common::{path_to_string, WalkError};
pub use context::{Context, Function, Import, Module};
pub use graph::{DependencyGraph, DependencyNode, GraphBuilder, NodeId};
pub use image::{ImageParser, PeImageParser};
pub use lookup_path::LookupPath;
pub use query::LookupQuery;
pub use traverse::{BreadthFirst, DepthFirst, Direction, NodeRef, Traversal, Visitor};
pub use view::{show, Format, Output, ViewOptions};

/// Build the dependency graph of the executable described by `query`
pub fn walk(query: &LookupQuery) -> Result<DependencyGraph<Module>, WalkError> {
    let parser = PeImageParser::from_query(query);
    GraphBuilder::new(&parser)
        .max_depth(query.parameters.max_depth)
        .build(&path_to_string(&query.target.target_exe))
}
