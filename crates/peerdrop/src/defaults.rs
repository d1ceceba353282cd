use camino::Utf8PathBuf;

pub const DEFAULT_PORT: u16 = 44_044;

/// Where config and identity live unless `--home` says otherwise.
#[must_use]
pub fn default_home() -> Utf8PathBuf {
    dirs::config_dir()
        .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
        .map_or_else(|| Utf8PathBuf::from(".peerdrop"), |dir| dir.join("peerdrop"))
}
