//! Pattern-offset allocator: deterministic hashing of generation
//! parameters and atomic reservation of offset ranges.
//!
//! Campaigns sharing a parameter hash draw from one monotonic offset
//! stream, so they never regenerate the same domain. The hash is
//! content-addressed over the normalized parameter tuple only; nothing
//! timestamp- or campaign-sensitive goes in.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::CoreError;
use crate::store::DbHandle;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Prefix,
    Suffix,
    Both,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prefix => "prefix",
            Self::Suffix => "suffix",
            Self::Both => "both",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "prefix" => Ok(Self::Prefix),
            "suffix" => Ok(Self::Suffix),
            "both" => Ok(Self::Both),
            _ => Err(format!("Invalid pattern type: {}", s)),
        }
    }
}

/// Normalized domain-generation parameters. Built by the generation-config
/// validator, so `character_set` is deduped, the tld carries no leading dot,
/// and the variable lengths are resolved per pattern type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatternParams {
    pub pattern_type: PatternType,
    pub prefix_variable_length: i64,
    pub suffix_variable_length: i64,
    pub character_set: String,
    pub constant_string: String,
    pub tld: String,
}

impl PatternParams {
    /// Stable hex hash over the normalized parameter tuple.
    pub fn config_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.pattern_type.as_str(),
            &self.prefix_variable_length.to_string(),
            &self.suffix_variable_length.to_string(),
            &self.character_set,
            &self.constant_string,
            &self.tld,
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]); // field separator, keeps "ab"+"c" != "a"+"bc"
        }
        format!("{:x}", hasher.finalize())
    }

    /// Domain name at a given position of this parameter stream.
    pub fn domain_at(&self, offset: i64) -> String {
        let label = match self.pattern_type {
            PatternType::Prefix => format!(
                "{}{}",
                variable_part(&self.character_set, self.prefix_variable_length, offset),
                self.constant_string
            ),
            PatternType::Suffix => format!(
                "{}{}",
                self.constant_string,
                variable_part(&self.character_set, self.suffix_variable_length, offset)
            ),
            PatternType::Both => {
                let n = self.character_set.chars().count() as i64;
                let suffix_capacity = n.pow(self.suffix_variable_length as u32).max(1);
                format!(
                    "{}{}{}",
                    variable_part(
                        &self.character_set,
                        self.prefix_variable_length,
                        offset / suffix_capacity
                    ),
                    self.constant_string,
                    variable_part(
                        &self.character_set,
                        self.suffix_variable_length,
                        offset % suffix_capacity
                    )
                )
            }
        };
        format!("{}.{}", label, self.tld)
    }
}

/// Render the variable part at `index`: all strings of the base length in
/// charset order first, then the stream continues one character longer per
/// exhausted tier.
fn variable_part(character_set: &str, base_length: i64, index: i64) -> String {
    let chars: Vec<char> = character_set.chars().collect();
    let n = chars.len() as i64;
    debug_assert!(n > 0 && base_length > 0);

    let mut length = base_length.max(1) as u32;
    let mut remaining = index.max(0);
    let mut capacity = n.pow(length);
    while remaining >= capacity {
        remaining -= capacity;
        length += 1;
        capacity = n.pow(length);
    }

    let mut out = vec!['\0'; length as usize];
    for slot in out.iter_mut().rev() {
        *slot = chars[(remaining % n) as usize];
        remaining /= n;
    }
    out.into_iter().collect()
}

/// Async facade over the offset table.
#[derive(Clone)]
pub struct OffsetAllocator {
    db: DbHandle,
}

impl OffsetAllocator {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Read-only: the current offset for a hash (0 if never used).
    pub async fn peek(&self, config_hash: &str) -> Result<i64, CoreError> {
        let hash = config_hash.to_string();
        self.db
            .call(move |store| store.peek_offset(&hash))
            .await
            .map_err(|e| CoreError::from_store(e, "pattern offset"))
    }

    /// Reserve `count` offsets; returns the starting offset of the range.
    pub async fn reserve(&self, config_hash: &str, count: i64) -> Result<i64, CoreError> {
        if count <= 0 {
            return Err(CoreError::InvalidArgument(
                "reservation count must be positive".into(),
            ));
        }
        let hash = config_hash.to_string();
        self.db
            .call(move |store| store.reserve_offsets(&hash, count))
            .await
            .map_err(|e| CoreError::from_store(e, "pattern offset"))
    }
}
