pub mod b_plus_tree;
pub mod header_page;
pub mod internal_page;
pub mod iterator;
pub mod leaf_page;
pub mod tree_page;

pub use b_plus_tree::BPlusTree;
pub use header_page::HeaderPage;
pub use internal_page::{InternalPage, InternalPageRef, INTERNAL_CAPACITY};
pub use iterator::TreeIterator;
pub use leaf_page::{LeafPage, LeafPageRef, LEAF_CAPACITY};
pub use tree_page::TreePageType;
