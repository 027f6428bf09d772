//! Key types usable with [`crate::cache::StreamedCache`], grounded on the
//! key concept in `streamed_cache.h` and `TextureConversionTaskKey` in
//! `texture_converter.h`.

/// A key identifying a cache entry. Ordering must be a total order stable
/// across process runs, since it determines the on-disk index's BST shape.
pub trait StreamedCacheKey: Ord + Clone + Send + Sync {
    fn serialize(&self) -> Vec<u8>;
    fn deserialize(bytes: &[u8]) -> Self;

    /// Serialized size in bytes; must be constant for a given key type,
    /// matching `StreamedCacheIndexTreeEntry`'s fixed-size layout.
    fn serialized_size() -> usize;
}

/// A path-like key identifying a conversion artifact (texture, shader),
/// the Rust equivalent of `TextureConversionTaskKey`'s fixed `char[4096]`
/// buffer — represented here as an owned `String` rather than a bit-exact
/// byte buffer, since the on-disk length is already length-prefixed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathKey(String);

impl PathKey {
    pub fn new(path: impl Into<String>) -> Self {
        PathKey(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

const PATH_KEY_CAPACITY: usize = 4096;

impl StreamedCacheKey for PathKey {
    fn serialize(&self) -> Vec<u8> {
        let mut out = vec![0u8; PATH_KEY_CAPACITY];
        let bytes = self.0.as_bytes();
        let len = bytes.len().min(PATH_KEY_CAPACITY - 1);
        out[..len].copy_from_slice(&bytes[..len]);
        out
    }

    fn deserialize(bytes: &[u8]) -> Self {
        let nul = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        PathKey(String::from_utf8_lossy(&bytes[..nul]).into_owned())
    }

    fn serialized_size() -> usize {
        PATH_KEY_CAPACITY
    }
}

/// A key identifying a compiled shader permutation: its source path, the
/// shader model it was compiled against, and a content hash distinguishing
/// permutations compiled from the same path (macros, entry point, etc.).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShaderKey {
    path: String,
    shader_model: u16,
    hash: u64,
}

impl ShaderKey {
    pub fn new(path: impl Into<String>, shader_model: u16, hash: u64) -> Self {
        ShaderKey {
            path: path.into(),
            shader_model,
            hash,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn shader_model(&self) -> u16 {
        self.shader_model
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }
}

const SHADER_KEY_PATH_CAPACITY: usize = 260;

impl StreamedCacheKey for ShaderKey {
    fn serialize(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::serialized_size()];
        let bytes = self.path.as_bytes();
        let len = bytes.len().min(SHADER_KEY_PATH_CAPACITY - 1);
        out[..len].copy_from_slice(&bytes[..len]);
        out[SHADER_KEY_PATH_CAPACITY..SHADER_KEY_PATH_CAPACITY + 2]
            .copy_from_slice(&self.shader_model.to_le_bytes());
        out[SHADER_KEY_PATH_CAPACITY + 2..SHADER_KEY_PATH_CAPACITY + 10]
            .copy_from_slice(&self.hash.to_le_bytes());
        out
    }

    fn deserialize(bytes: &[u8]) -> Self {
        let path_bytes = &bytes[..SHADER_KEY_PATH_CAPACITY];
        let nul = path_bytes.iter().position(|&b| b == 0).unwrap_or(path_bytes.len());
        let path = String::from_utf8_lossy(&path_bytes[..nul]).into_owned();
        let mut model_bytes = [0u8; 2];
        model_bytes.copy_from_slice(&bytes[SHADER_KEY_PATH_CAPACITY..SHADER_KEY_PATH_CAPACITY + 2]);
        let mut hash_bytes = [0u8; 8];
        hash_bytes.copy_from_slice(
            &bytes[SHADER_KEY_PATH_CAPACITY + 2..SHADER_KEY_PATH_CAPACITY + 10],
        );
        ShaderKey {
            path,
            shader_model: u16::from_le_bytes(model_bytes),
            hash: u64::from_le_bytes(hash_bytes),
        }
    }

    fn serialized_size() -> usize {
        SHADER_KEY_PATH_CAPACITY + 2 + 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shader_key_round_trips_through_serialize() {
        let key = ShaderKey::new("shaders/lit.hlsl", 65, 0xdead_beef_cafe_babe);
        let bytes = key.serialize();
        assert_eq!(bytes.len(), ShaderKey::serialized_size());
        assert_eq!(ShaderKey::deserialize(&bytes), key);
    }

    #[test]
    fn path_key_round_trips_through_serialize() {
        let key = PathKey::new("tex/grass.dds");
        let bytes = key.serialize();
        assert_eq!(bytes.len(), PathKey::serialized_size());
        assert_eq!(PathKey::deserialize(&bytes), key);
    }
}
