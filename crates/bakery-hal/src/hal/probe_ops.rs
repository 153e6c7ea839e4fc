//! Filesystem probing.

use std::path::Path;

pub trait ProbeOps {
    /// True when `path` names a file that can currently be read.
    fn file_readable(&self, path: &Path) -> bool;
}
