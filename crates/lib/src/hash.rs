//! Checksum and fingerprint helpers.
//!
//! File checksums detect external modification independent of timestamps;
//! command fingerprints detect build-recipe changes. Both are lowercase
//! SHA-256 hex digests.

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Compute the content checksum of a file.
///
/// Returns an empty string if the file cannot be read. An empty checksum
/// never matches a previously recorded non-empty one, so a vanished
/// dependency forces a rebuild instead of raising an error.
pub fn file_checksum(path: &Path) -> String {
  let Ok(mut file) = fs::File::open(path) else {
    return String::new();
  };

  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];
  loop {
    match file.read(&mut buffer) {
      Ok(0) => break,
      Ok(n) => hasher.update(&buffer[..n]),
      Err(_) => return String::new(),
    }
  }

  format!("{:x}", hasher.finalize())
}

/// Compute the fingerprint of a build command.
///
/// The fingerprint is a hash of the command's JSON serialization, so any
/// difference in value or order produces a different fingerprint. The
/// command may be any serializable structure and can carry information
/// beyond the literal argv.
pub fn command_fingerprint<C: Serialize>(command: &C) -> String {
  let serialized = serde_json::to_string(command).unwrap_or_default();
  let mut hasher = Sha256::new();
  hasher.update(serialized.as_bytes());
  format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn file_checksum_is_content_based() {
    let temp = TempDir::new().unwrap();
    let a = temp.path().join("a.txt");
    let b = temp.path().join("b.txt");
    fs::write(&a, "hello").unwrap();
    fs::write(&b, "hello").unwrap();

    assert_eq!(file_checksum(&a), file_checksum(&b));
    assert_eq!(file_checksum(&a).len(), 64);

    fs::write(&b, "changed").unwrap();
    assert_ne!(file_checksum(&a), file_checksum(&b));
  }

  #[test]
  fn missing_file_checksum_is_empty() {
    let temp = TempDir::new().unwrap();
    assert_eq!(file_checksum(&temp.path().join("nope")), "");
  }

  #[test]
  fn fingerprint_is_order_sensitive() {
    let one = vec!["cc", "-o", "out", "in.c"];
    let two = vec!["cc", "-o", "in.c", "out"];
    assert_ne!(command_fingerprint(&one), command_fingerprint(&two));
    assert_eq!(command_fingerprint(&one), command_fingerprint(&one));
  }

  #[test]
  fn fingerprint_is_value_sensitive() {
    let base = vec!["cc", "-o", "out", "in.c"];
    let flagged = vec!["cc", "-O2", "-o", "out", "in.c"];
    assert_ne!(command_fingerprint(&base), command_fingerprint(&flagged));
  }
}
