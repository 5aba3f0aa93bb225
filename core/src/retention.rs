use crate::config::RetentionPolicy;
use crate::types::{BackupFilter, RemoteFileEntry};
use crate::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// The listing/deletion surface a backend exposes for one category folder.
#[async_trait]
pub trait RemoteDirectory: Send {
    /// Entries directly inside the category folder.
    async fn list_entries(&mut self, category: &str) -> Result<Vec<RemoteFileEntry>>;

    async fn delete_entry(&mut self, category: &str, name: &str) -> Result<()>;
}

/// Result of one prune pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PruneReport {
    pub considered: usize,
    pub deleted: Vec<String>,
}

pub struct RetentionPruner {
    policy: RetentionPolicy,
    filter: BackupFilter,
}

impl RetentionPruner {
    pub fn new(policy: RetentionPolicy, filter: BackupFilter) -> Self {
        Self { policy, filter }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Entries to delete, oldest first, so that at most `keep` recognised backups remain.
    ///
    /// Backups without a timestamp are never selected and do not count toward `keep`.
    pub fn select_for_deletion(&self, entries: &[RemoteFileEntry], keep: usize) -> Vec<RemoteFileEntry> {
        let mut backups: Vec<RemoteFileEntry> = entries
            .iter()
            .filter(|e| !e.is_dir && self.filter.matches(&e.name))
            .filter(|e| {
                if e.modified.is_none() {
                    warn!(name = %e.name, "Backup has no modification time, leaving it alone");
                }
                e.modified.is_some()
            })
            .cloned()
            .collect();
        backups.sort_by(|a, b| a.age_order(b));

        let excess = backups.len().saturating_sub(keep);
        backups.truncate(excess);
        backups
    }

    /// Deletes the oldest backups in `category` beyond the configured count.
    ///
    /// Deletions happen one at a time. A failed deletion stops the pass; earlier
    /// deletions are not undone.
    pub async fn prune<D>(&self, dir: &mut D, category: &str, backend: &str) -> Result<PruneReport>
    where
        D: RemoteDirectory + ?Sized,
    {
        let keep = match self.policy {
            RetentionPolicy::KeepAll => return Ok(PruneReport::default()),
            RetentionPolicy::KeepLatest(keep) => keep,
        };

        let entries = dir.list_entries(category).await?;
        let doomed = self.select_for_deletion(&entries, keep);
        let considered = entries
            .iter()
            .filter(|e| !e.is_dir && self.filter.matches(&e.name))
            .count();

        let mut report = PruneReport {
            considered,
            deleted: Vec::with_capacity(doomed.len()),
        };

        if doomed.is_empty() {
            debug!(backend, category, file_count = considered, "Nothing to prune");
            return Ok(report);
        }

        info!(
            backend,
            category,
            file_count = considered,
            file_limit = keep,
            "Backup limit reached, deleting oldest backups"
        );

        for entry in doomed {
            dir.delete_entry(category, &entry.name).await?;
            debug!(backend, category, file = %entry.name, "Deleted old backup");
            report.deleted.push(entry.name);
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use chrono::{DateTime, Utc};

    struct MemoryDirectory {
        entries: Vec<RemoteFileEntry>,
        list_calls: usize,
        deletes: Vec<String>,
        fail_on_delete: Option<usize>,
    }

    impl MemoryDirectory {
        fn with_files(names: &[(&str, i64)]) -> Self {
            Self {
                entries: names
                    .iter()
                    .map(|(name, ts)| RemoteFileEntry::file(*name, at(*ts)))
                    .collect(),
                list_calls: 0,
                deletes: Vec::new(),
                fail_on_delete: None,
            }
        }
    }

    #[async_trait]
    impl RemoteDirectory for MemoryDirectory {
        async fn list_entries(&mut self, _category: &str) -> Result<Vec<RemoteFileEntry>> {
            self.list_calls += 1;
            Ok(self.entries.clone())
        }

        async fn delete_entry(&mut self, _category: &str, name: &str) -> Result<()> {
            if self.fail_on_delete == Some(self.deletes.len()) {
                return Err(Error::http(500, "delete failed"));
            }
            self.deletes.push(name.to_string());
            self.entries.retain(|e| e.name != name);
            Ok(())
        }
    }

    fn at(ts: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(ts, 0).unwrap()
    }

    fn pruner(policy: RetentionPolicy) -> RetentionPruner {
        RetentionPruner::new(policy, BackupFilter::default())
    }

    #[tokio::test]
    async fn test_keep_all_never_touches_remote() {
        let mut dir = MemoryDirectory::with_files(&[("a.zip", 1), ("b.zip", 2), ("c.zip", 3)]);
        let report = pruner(RetentionPolicy::KeepAll)
            .prune(&mut dir, "world", "Test")
            .await
            .unwrap();

        assert!(report.deleted.is_empty());
        assert_eq!(dir.list_calls, 0);
        assert!(dir.deletes.is_empty());
    }

    #[tokio::test]
    async fn test_prunes_oldest_down_to_keep_count() {
        let mut dir = MemoryDirectory::with_files(&[
            ("newest.zip", 500),
            ("oldest.zip", 100),
            ("middle.zip", 300),
            ("old.zip", 200),
            ("notes.txt", 1),
        ]);

        let report = pruner(RetentionPolicy::KeepLatest(2))
            .prune(&mut dir, "world", "Test")
            .await
            .unwrap();

        assert_eq!(report.considered, 4);
        assert_eq!(dir.deletes, vec!["oldest.zip", "old.zip"]);
        let remaining: Vec<_> = dir.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(remaining, vec!["newest.zip", "middle.zip", "notes.txt"]);
    }

    #[tokio::test]
    async fn test_keep_zero_deletes_every_backup() {
        let mut dir = MemoryDirectory::with_files(&[("a.zip", 1), ("b.zip", 2)]);
        pruner(RetentionPolicy::KeepLatest(0))
            .prune(&mut dir, "world", "Test")
            .await
            .unwrap();
        assert_eq!(dir.deletes.len(), 2);
    }

    #[tokio::test]
    async fn test_under_limit_deletes_nothing() {
        let mut dir = MemoryDirectory::with_files(&[("a.zip", 1)]);
        let report = pruner(RetentionPolicy::KeepLatest(5))
            .prune(&mut dir, "world", "Test")
            .await
            .unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(dir.list_calls, 1);
    }

    #[tokio::test]
    async fn test_failed_delete_stops_without_undoing() {
        let mut dir = MemoryDirectory::with_files(&[("a.zip", 1), ("b.zip", 2), ("c.zip", 3), ("d.zip", 4)]);
        dir.fail_on_delete = Some(1);

        let result = pruner(RetentionPolicy::KeepLatest(1))
            .prune(&mut dir, "world", "Test")
            .await;

        assert!(result.is_err());
        assert_eq!(dir.deletes, vec!["a.zip"]);
        assert_eq!(dir.entries.len(), 3);
    }

    #[tokio::test]
    async fn test_undated_backups_are_left_alone() {
        let mut dir = MemoryDirectory::with_files(&[("b.zip", 200), ("c.zip", 300)]);
        dir.entries.push(RemoteFileEntry {
            name: "a.zip".to_string(),
            modified: None,
            is_dir: false,
        });

        let report = pruner(RetentionPolicy::KeepLatest(1))
            .prune(&mut dir, "world", "Test")
            .await
            .unwrap();

        assert_eq!(report.deleted, vec!["b.zip"]);
        assert_eq!(dir.deletes, vec!["b.zip"]);
    }

    #[test]
    fn test_selection_matches_max_n_minus_k() {
        let p = pruner(RetentionPolicy::KeepAll);
        for n in 0..8i64 {
            let entries: Vec<_> = (0..n)
                .map(|i| RemoteFileEntry::file(format!("{}.zip", i), at(1000 - i)))
                .collect();
            for k in 0..10usize {
                let doomed = p.select_for_deletion(&entries, k);
                assert_eq!(doomed.len(), (n as usize).saturating_sub(k));
                // newest survive: timestamps decrease with i, so doomed are the highest i
                for d in &doomed {
                    let i: i64 = d.name.trim_end_matches(".zip").parse().unwrap();
                    assert!(i >= k as i64);
                }
            }
        }
    }
}
