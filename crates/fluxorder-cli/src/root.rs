use std::path::{Path, PathBuf};

/// Resolve the repository root.
///
/// Priority:
/// 1. `--root` flag / `FLUXORDER_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `.fluxorder/`
/// 3. Walk upward from `cwd` looking for `.git/`
/// 4. Fall back to `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_upward(&cwd, ".fluxorder")
        .or_else(|| find_upward(&cwd, ".git"))
        .unwrap_or(cwd)
}

fn find_upward(start: &Path, marker: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(marker).is_dir())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_root_wins() {
        let dir = TempDir::new().unwrap();
        let result = resolve_root(Some(dir.path()));
        assert_eq!(result, dir.path());
    }

    #[test]
    fn finds_fluxorder_dir_from_subdirectory() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".fluxorder")).unwrap();
        let subdir = dir.path().join("apps/production");
        std::fs::create_dir_all(&subdir).unwrap();

        assert_eq!(find_upward(&subdir, ".fluxorder").as_deref(), Some(dir.path()));
    }

    #[test]
    fn fluxorder_dir_takes_precedence_over_git() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        let nested = dir.path().join("clusters/staging");
        std::fs::create_dir_all(nested.join(".fluxorder")).unwrap();
        let deeper = nested.join("infrastructure");
        std::fs::create_dir_all(&deeper).unwrap();

        assert_eq!(find_upward(&deeper, ".fluxorder").as_deref(), Some(nested.as_path()));
        assert_eq!(find_upward(&deeper, ".git").as_deref(), Some(dir.path()));
    }

    #[test]
    fn missing_marker_finds_nothing() {
        let dir = TempDir::new().unwrap();
        assert!(find_upward(dir.path(), ".fluxorder-marker-that-does-not-exist").is_none());
    }
}
