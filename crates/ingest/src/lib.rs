pub mod chunk;
pub mod chunker;
pub mod reader;

pub use chunk::{Chunk, Document};
pub use chunker::{Chunker, ChunkerConfig};
pub use reader::FileReader;

use sha2::{Digest, Sha256};

/// Generate a stable document ID from its source identifier
pub fn generate_doc_id(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..16])
}

/// Rough token estimate: ~1.3 tokens per whitespace-separated word
pub fn estimate_tokens(text: &str) -> usize {
    let word_count = text.split_whitespace().count();
    (word_count as f64 * 1.3).ceil() as usize
}

/// Split every document with the same configuration.
pub fn chunk_documents(documents: &[Document], chunker: &Chunker) -> Vec<Chunk> {
    documents
        .iter()
        .flat_map(|doc| chunker.chunk_document(doc))
        .collect()
}
