use std::collections::HashSet;
use std::path::Path;

/// Host blocklist, one host per line. Reloaded from disk on every upstream
/// connect so edits take effect without a restart; a missing file is an
/// empty list.
#[derive(Debug, Default)]
pub struct Blocklist {
    hosts: HashSet<String>,
}

impl Blocklist {
    pub async fn load(path: &Path) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Self {
                hosts: text
                    .lines()
                    .map(|line| line.trim().to_ascii_lowercase())
                    .filter(|line| !line.is_empty())
                    .collect(),
            },
            Err(_) => Self::default(),
        }
    }

    /// Case-insensitive exact match on the host portion; no wildcards.
    pub fn contains(&self, host: &str) -> bool {
        self.hosts.contains(&host.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let list = Blocklist::load(Path::new("/nonexistent/blocklist")).await;
        assert!(list.is_empty());
        assert!(!list.contains("example.test"));
    }

    #[tokio::test]
    async fn test_match_is_case_insensitive_and_exact() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Example.Test").unwrap();
        writeln!(file, "blocked.org").unwrap();
        writeln!(file).unwrap();
        file.flush().unwrap();

        let list = Blocklist::load(file.path()).await;
        assert!(list.contains("example.test"));
        assert!(list.contains("EXAMPLE.TEST"));
        assert!(list.contains("blocked.org"));
        assert!(!list.contains("sub.blocked.org"));
        assert!(!list.contains("other.test"));
    }
}
