use serde::{Deserialize, Serialize};

use relaydrop_protocol::FileInfo;

/// Bitmap of confirmed chunk indices in `[0, total)`.
///
/// Serialized as `{ "total": n, "bitmap": "<hex>" }` so resume records
/// stay compact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSet {
    total: u32,
    #[serde(with = "hex_bits")]
    bitmap: Vec<u8>,
    #[serde(skip)]
    count: u32,
}

impl ChunkSet {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            bitmap: vec![0; total.div_ceil(8) as usize],
            count: 0,
        }
    }

    /// A set with every index below `watermark` confirmed.
    pub fn with_prefix(total: u32, watermark: u32) -> Self {
        let mut set = Self::new(total);
        for i in 0..watermark.min(total) {
            set.insert(i);
        }
        set
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Number of confirmed indices.
    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.total
    }

    pub fn contains(&self, index: u32) -> bool {
        index < self.total && self.bitmap[(index / 8) as usize] & (1 << (index % 8)) != 0
    }

    /// Marks `index` confirmed. Returns `false` if it was out of range or
    /// already present.
    pub fn insert(&mut self, index: u32) -> bool {
        if index >= self.total || self.contains(index) {
            return false;
        }
        self.bitmap[(index / 8) as usize] |= 1 << (index % 8);
        self.count += 1;
        true
    }

    /// Length of the contiguous confirmed prefix, i.e. the first missing
    /// index (or `total` when complete).
    pub fn watermark(&self) -> u32 {
        let full = self.bitmap.iter().take_while(|b| **b == 0xFF).count() as u32;
        let mut index = full * 8;
        while index < self.total && self.contains(index) {
            index += 1;
        }
        index.min(self.total)
    }

    /// Indices not yet confirmed, ascending.
    pub fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.total).filter(|i| !self.contains(*i))
    }

    /// Sum of the sizes of confirmed chunks for `info`.
    pub fn confirmed_bytes(&self, info: &FileInfo) -> u64 {
        (0..self.total)
            .filter(|i| self.contains(*i))
            .map(|i| info.chunk_len(i) as u64)
            .sum()
    }

    fn recount(&mut self) {
        let mut count: u32 = self.bitmap.iter().map(|b| b.count_ones()).sum();
        // Bits past `total` in the last byte never count.
        let tail = self.total % 8;
        if tail != 0
            && let Some(last) = self.bitmap.last_mut()
        {
            let stray = *last & !((1u8 << tail) - 1);
            count -= stray.count_ones();
            *last &= (1u8 << tail) - 1;
        }
        self.count = count;
    }
}

mod hex_bits {
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(bits: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bits))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(de::Error::custom)
    }
}

impl ChunkSet {
    /// Restores the cached count after deserialization and checks the
    /// bitmap length against `total`.
    pub fn validated(mut self) -> Option<Self> {
        if self.bitmap.len() != self.total.div_ceil(8) as usize {
            return None;
        }
        self.recount();
        Some(self)
    }
}
