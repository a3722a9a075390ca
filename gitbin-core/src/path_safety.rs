use anyhow::{bail, Result};
use std::path::{Component, Path};

/// Ensure `name` is a single plain path component: not empty, not absolute,
/// no `.`/`..`, no separators. Names read back from a manifest or a segment
/// header are joined onto bin, scratch and restore directories, so anything
/// else could write outside them.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("empty name is not allowed");
    }
    if name.contains('/') || name.contains('\\') {
        bail!("path separators are not allowed: {:?}", name);
    }
    let mut comps = Path::new(name).components();
    match (comps.next(), comps.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => bail!("not a plain file name: {:?}", name),
    }
}
