//! Parsing, chunking and chunk enrichment

pub mod augment;
pub mod chunk_builder;
pub mod chunker;
pub mod metadata;
pub mod page_count;
pub mod parser;
pub mod text;

pub use augment::Augmenter;
pub use chunk_builder::ChunkBuilder;
pub use chunker::TextChunker;
pub use metadata::extract_doc_metadata;
pub use parser::{ChunkParser, ParseRequest, ParsedChunk, ParserRegistry, ProgressFn};
