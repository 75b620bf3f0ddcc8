use crate::error::PoolError;

use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

use rand::rngs::OsRng;
use rand::TryRngCore;

lazy_static::lazy_static! {
  static ref GLOBAL_POOL_ID_ALLOCATOR: PoolIdAllocator = PoolIdAllocator::new();
}

/// Number of random bytes in an instance token.
pub const INSTANCE_TOKEN_BYTES: usize = 20;

/// Numeric pool identity, assigned once at construction.
pub type PoolId = u32;

/// Hands out monotonically increasing pool IDs starting at 1.
///
/// Applications that want isolated numbering own their allocator and pass it
/// to `Pool::with_identity`; everything else shares `PoolIdAllocator::global()`.
#[derive(Debug, Default)]
pub struct PoolIdAllocator {
  last: AtomicU32,
}

impl PoolIdAllocator {
  pub const fn new() -> Self {
    Self {
      last: AtomicU32::new(0),
    }
  }

  pub fn global() -> &'static PoolIdAllocator {
    &GLOBAL_POOL_ID_ALLOCATOR
  }

  pub fn next_id(&self) -> PoolId {
    self.last.fetch_add(1, AtomicOrdering::Relaxed) + 1
  }

  /// The most recently issued ID, 0 if none.
  pub fn last_issued(&self) -> PoolId {
    self.last.load(AtomicOrdering::Relaxed)
  }

  pub fn reset(&self) {
    self.last.store(0, AtomicOrdering::Relaxed);
  }
}

/// Opaque, collision-resistant identity of one pool instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceToken(String);

impl InstanceToken {
  /// Renders raw entropy as lowercase hex. Fails on an empty buffer.
  pub fn from_bytes(bytes: &[u8]) -> Result<Self, PoolError> {
    if bytes.is_empty() {
      return Err(PoolError::TokenGeneration("entropy source produced an empty buffer".to_string()));
    }
    let mut hex = String::with_capacity(bytes.len() * 2);
    for b in bytes {
      let _ = write!(hex, "{:02x}", b);
    }
    Ok(Self(hex))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for InstanceToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Source of instance tokens.
pub trait InstanceTokenGenerator: Send + Sync {
  fn generate(&self) -> Result<InstanceToken, PoolError>;
}

/// Draws `INSTANCE_TOKEN_BYTES` bytes from the operating system's CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsTokenGenerator;

impl InstanceTokenGenerator for OsTokenGenerator {
  fn generate(&self) -> Result<InstanceToken, PoolError> {
    let mut buf = [0u8; INSTANCE_TOKEN_BYTES];
    OsRng
      .try_fill_bytes(&mut buf)
      .map_err(|e| PoolError::TokenGeneration(e.to_string()))?;
    InstanceToken::from_bytes(&buf)
  }
}
