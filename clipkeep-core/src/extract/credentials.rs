use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;
use url::Url;

use crate::config::CredentialsSection;

/// Host suffix to cookie file used when the configuration names none.
pub const DEFAULT_PLATFORMS: &[(&str, &str)] = &[
    ("instagram.com", "instagram.txt"),
    ("facebook.com", "facebook.txt"),
    ("twitter.com", "twitter.txt"),
    ("x.com", "twitter.txt"),
    ("tiktok.com", "tiktok.txt"),
];

/// Per-platform cookie files handed to the extractor for gated sources.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    dir: Option<PathBuf>,
    platforms: BTreeMap<String, String>,
}

impl CredentialStore {
    pub fn new(dir: impl AsRef<Path>, platforms: BTreeMap<String, String>) -> Self {
        let platforms = if platforms.is_empty() {
            default_platforms()
        } else {
            platforms
        };
        Self {
            dir: Some(dir.as_ref().to_path_buf()),
            platforms,
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn from_config(section: &CredentialsSection) -> Self {
        match &section.cookies_dir {
            Some(dir) => Self::new(dir, section.platforms.clone()),
            None => Self::disabled(),
        }
    }

    /// Platform key (a host suffix) matching the URL's host.
    pub fn platform_for(&self, url: &str) -> Option<&str> {
        let host = Url::parse(url).ok()?.host_str()?.to_ascii_lowercase();
        self.platforms
            .keys()
            .find(|domain| host == **domain || host.ends_with(&format!(".{domain}")))
            .map(String::as_str)
    }

    /// Cookie file for the URL's platform, only when it exists on disk.
    pub fn lookup(&self, url: &str) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        let platform = self.platform_for(url)?;
        let file = self.platforms.get(platform)?;
        let path = dir.join(file);
        if path.is_file() {
            debug!(platform, path = %path.display(), "using cookie file");
            Some(path)
        } else {
            debug!(platform, path = %path.display(), "cookie file not present");
            None
        }
    }
}

fn default_platforms() -> BTreeMap<String, String> {
    DEFAULT_PLATFORMS
        .iter()
        .map(|(domain, file)| (domain.to_string(), file.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn maps_hosts_to_platform_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("twitter.txt"), "# Netscape HTTP Cookie File\n").unwrap();
        let store = CredentialStore::new(dir.path(), BTreeMap::new());

        assert_eq!(
            store.lookup("https://x.com/someone/status/1"),
            Some(dir.path().join("twitter.txt"))
        );
        assert_eq!(
            store.lookup("https://mobile.twitter.com/someone/status/1"),
            Some(dir.path().join("twitter.txt"))
        );
        assert_eq!(store.platform_for("https://www.instagram.com/p/abc/"), Some("instagram.com"));
        assert_eq!(store.lookup("https://www.instagram.com/p/abc/"), None);
        assert_eq!(store.platform_for("https://notx.com/video"), None);
        assert_eq!(store.lookup("not a url"), None);
    }

    #[test]
    fn disabled_store_never_returns_credentials() {
        let store = CredentialStore::disabled();
        assert_eq!(store.lookup("https://x.com/a/status/1"), None);
    }
}
