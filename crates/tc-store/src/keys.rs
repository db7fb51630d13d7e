//! The storage key space.
//!
//! Every key is a pure function of the tensor name, the commit id, and the
//! kind of structure stored. Chunk blobs are the exception: chunk ids are
//! globally unique, so their keys do not need the commit.

/// Dataset-level registry of link credential keys.
pub const LINKED_CREDS_KEY: &str = "linked_creds.json";

fn commit_prefix(tensor: &str, commit_id: &str) -> String {
    format!("versions/{commit_id}/{tensor}")
}

pub fn tensor_meta_key(tensor: &str, commit_id: &str) -> String {
    format!("{}/tensor_meta.json", commit_prefix(tensor, commit_id))
}

pub fn chunk_id_encoder_key(tensor: &str, commit_id: &str) -> String {
    format!("{}/chunks_index/unsharded", commit_prefix(tensor, commit_id))
}

pub fn creds_encoder_key(tensor: &str, commit_id: &str) -> String {
    format!("{}/creds_index/creds", commit_prefix(tensor, commit_id))
}

/// Ids of the chunks created in this commit.
pub fn chunk_set_key(tensor: &str, commit_id: &str) -> String {
    format!("{}/chunk_set", commit_prefix(tensor, commit_id))
}

pub fn chunk_key(tensor: &str, chunk_name: &str) -> String {
    format!("{tensor}/chunks/{chunk_name}")
}
