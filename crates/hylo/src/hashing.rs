use serde::Serialize;

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

pub fn fnv1a_init() -> u64 {
    FNV1A_OFFSET
}

pub fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    fnv1a_bytes(fnv1a_init(), bytes)
}

/// Incremental fingerprint over bincode encodings of serializable values.
pub struct Fingerprint {
    hash: u64,
}

impl Fingerprint {
    pub fn new() -> Self {
        Self {
            hash: fnv1a_init(),
        }
    }

    pub fn write<T: Serialize + ?Sized>(&mut self, value: &T) {
        let bytes = bincode::serialize(value).unwrap_or_default();
        self.write_bytes(&bytes);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.hash = fnv1a_bytes(self.hash, &(bytes.len() as u64).to_le_bytes());
        self.hash = fnv1a_bytes(self.hash, bytes);
    }

    pub fn finish(self) -> u64 {
        self.hash
    }
}

impl Default for Fingerprint {
    fn default() -> Self {
        Self::new()
    }
}

pub fn digest<T: Serialize + ?Sized>(value: &T) -> u64 {
    let mut fingerprint = Fingerprint::new();
    fingerprint.write(value);
    fingerprint.finish()
}
