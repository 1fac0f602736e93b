use camino::{Utf8Path, Utf8PathBuf};
use dirs::home_dir;

pub const DEFAULT_STRATA_HOME: &str = ".strata";

pub const DEFAULT_IDENTITY: &str = "member-1";

pub fn default_home() -> Utf8PathBuf {
    if let Some(home) = home_dir() {
        if let Some(home) = Utf8Path::from_path(&home) {
            return home.join(DEFAULT_STRATA_HOME);
        }
    }

    Utf8PathBuf::from(DEFAULT_STRATA_HOME)
}
