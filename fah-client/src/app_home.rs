//! Resolution of the client's on-disk home directory.
//!
//! Resolution order:
//! 1. `FAH_CLIENT_HOME` environment variable (explicit override)
//! 2. `XDG_CONFIG_HOME/fah-client` (XDG compliance)
//! 3. `~/.fah-client` (default)
//!
//! Directory structure under the home:
//! ```text
//! ~/.fah-client/
//! ├── db/                 # sled KV-store files
//! ├── work/<unit-id>/     # per-WU working directories (wudata_01.dat, core binary, ...)
//! └── cores/<hash>/       # unpacked, verified compute kernels
//! ```

use std::path::PathBuf;

pub fn get_app_home() -> PathBuf {
    if let Ok(home) = std::env::var("FAH_CLIENT_HOME") {
        return PathBuf::from(home);
    }

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("fah-client");
    }

    dirs::home_dir()
        .expect("could not determine home directory")
        .join(".fah-client")
}

/// Ensure the app home and its standard subdirectories exist.
pub fn ensure_app_home() -> std::io::Result<PathBuf> {
    let home = get_app_home();

    std::fs::create_dir_all(&home)?;
    std::fs::create_dir_all(home.join("db"))?;
    std::fs::create_dir_all(home.join("work"))?;
    std::fs::create_dir_all(home.join("cores"))?;

    Ok(home)
}

pub fn get_db_dir() -> PathBuf {
    get_app_home().join("db")
}

pub fn get_work_dir(unit_id: &str) -> PathBuf {
    get_app_home().join("work").join(unit_id)
}

pub fn get_core_dir(core_hash: &str) -> PathBuf {
    get_app_home().join("cores").join(core_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_wins() {
        std::env::set_var("FAH_CLIENT_HOME", "/tmp/fah-client-test-home");
        assert_eq!(get_app_home(), PathBuf::from("/tmp/fah-client-test-home"));
        std::env::remove_var("FAH_CLIENT_HOME");
    }

    #[test]
    fn work_dir_is_nested_under_home() {
        std::env::set_var("FAH_CLIENT_HOME", "/tmp/fah-client-test-home2");
        assert_eq!(
            get_work_dir("abc123"),
            PathBuf::from("/tmp/fah-client-test-home2/work/abc123")
        );
        std::env::remove_var("FAH_CLIENT_HOME");
    }
}
