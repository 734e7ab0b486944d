use std::path::PathBuf;

/// A random, not yet existing path in the system temp directory.
pub fn in_temp_dir(prefix: &str, ext: &str) -> PathBuf {
    use rand::distributions::{Alphanumeric, DistString};

    const LEN: usize = 16;

    let mut name = String::with_capacity(prefix.len() + LEN + ext.len());
    name.push_str(prefix);
    Alphanumeric.append_string(&mut rand::thread_rng(), &mut name, LEN);
    name.push_str(ext);
    std::env::temp_dir().join(name)
}
