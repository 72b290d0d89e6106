//! Published diagnostics, per file, as last reported by the server.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::types::{Diagnostic, DiagnosticsSnapshot};

#[derive(Debug, Default)]
pub(crate) struct DiagnosticsStore {
    data: HashMap<PathBuf, Vec<Diagnostic>>,
}

impl DiagnosticsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the diagnostics for `path`. An empty list clears the file.
    pub fn update(&mut self, path: PathBuf, items: Vec<Diagnostic>) {
        if items.is_empty() {
            self.data.remove(&path);
        } else {
            self.data.insert(path, items);
        }
    }

    /// Forget `path`. Returns whether it had diagnostics.
    pub fn remove(&mut self, path: &Path) -> bool {
        self.data.remove(path).is_some()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Files with errors first, then by path.
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let mut files: Vec<(PathBuf, Vec<Diagnostic>)> = self
            .data
            .iter()
            .map(|(path, items)| (path.clone(), items.clone()))
            .collect();

        files.sort_by(|a, b| {
            let a_has_errors = a.1.iter().any(|d| d.severity().is_error());
            let b_has_errors = b.1.iter().any(|d| d.severity().is_error());
            b_has_errors.cmp(&a_has_errors).then_with(|| a.0.cmp(&b.0))
        });

        DiagnosticsSnapshot::new(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Position;
    use crate::types::DiagnosticSeverity;

    fn diag(severity: DiagnosticSeverity, msg: &str, line: u32) -> Diagnostic {
        Diagnostic::new(severity, msg.to_string(), Position::new(line, 0), "test".to_string())
    }

    #[test]
    fn empty_snapshot() {
        let store = DiagnosticsStore::new();
        let snap = store.snapshot();
        assert!(snap.is_empty());
        assert_eq!(snap.error_count(), 0);
    }

    #[test]
    fn update_replaces_and_empty_clears() {
        let mut store = DiagnosticsStore::new();
        let path = PathBuf::from("/w/main.rs");
        store.update(
            path.clone(),
            vec![
                diag(DiagnosticSeverity::Error, "err1", 1),
                diag(DiagnosticSeverity::Error, "err2", 2),
            ],
        );
        assert_eq!(store.snapshot().error_count(), 2);

        store.update(path.clone(), vec![diag(DiagnosticSeverity::Error, "err1", 1)]);
        assert_eq!(store.snapshot().total_count(), 1);

        store.update(path, vec![]);
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn files_with_errors_sort_first() {
        let mut store = DiagnosticsStore::new();
        store.update(PathBuf::from("b.rs"), vec![diag(DiagnosticSeverity::Error, "err", 1)]);
        store.update(PathBuf::from("a.rs"), vec![diag(DiagnosticSeverity::Warning, "warn", 1)]);
        store.update(PathBuf::from("c.rs"), vec![diag(DiagnosticSeverity::Error, "err", 1)]);

        let snap = store.snapshot();
        let order: Vec<&Path> = snap.files().iter().map(|(p, _)| p.as_path()).collect();
        assert_eq!(order, [Path::new("b.rs"), Path::new("c.rs"), Path::new("a.rs")]);
    }

    #[test]
    fn clear_and_remove() {
        let mut store = DiagnosticsStore::new();
        store.update(PathBuf::from("a.rs"), vec![diag(DiagnosticSeverity::Hint, "h", 1)]);
        store.update(PathBuf::from("b.rs"), vec![diag(DiagnosticSeverity::Hint, "h", 1)]);
        assert!(store.remove(Path::new("a.rs")));
        assert!(!store.remove(Path::new("a.rs")));
        assert_eq!(store.snapshot().files().len(), 1);
        store.clear();
        assert!(store.snapshot().is_empty());
    }
}
