//! Purpose: Segment-directory resolution shared by the CLI, the C ABI and sessions.
//! Exports: `default_segment_dir`, `resolve_segment_dir`.
//! Role: Keep every entry point agreeing on where "{tokenA}-{tokenB}" lives.
//! Invariants: `ALTERMESH_SEGMENT_DIR` wins over the platform default.

use std::path::{Path, PathBuf};

pub const SEGMENT_DIR_ENV: &str = "ALTERMESH_SEGMENT_DIR";

/// `ALTERMESH_SEGMENT_DIR`, else `/dev/shm` when present, else `<tmp>/altermesh`.
pub fn default_segment_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(SEGMENT_DIR_ENV).filter(|value| !value.is_empty()) {
        return PathBuf::from(dir);
    }
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        return shm.to_path_buf();
    }
    std::env::temp_dir().join("altermesh")
}

pub fn resolve_segment_dir(explicit: Option<&Path>) -> PathBuf {
    explicit.map_or_else(default_segment_dir, Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::resolve_segment_dir;
    use std::path::Path;

    #[test]
    fn explicit_dir_wins() {
        assert_eq!(
            resolve_segment_dir(Some(Path::new("/tmp/custom"))),
            Path::new("/tmp/custom")
        );
    }

    #[test]
    fn default_dir_is_absolute() {
        assert!(resolve_segment_dir(None).is_absolute());
    }
}
