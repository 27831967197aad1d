//! Directory enumeration feeding the source queue

use anyhow::{bail, Context, Result};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::protocol::identifier_for;

/// A regular file found under the transfer root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    /// '/'-separated path relative to the root, as sent on the wire
    pub id: String,
    pub size: u64,
}

/// Include/exclude/prune filtering (shell-style `*` and `?` wildcards)
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    /// If non-empty, only file names matching one of these are sent
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Directories whose name matches are not descended into
    pub prune_dirs: Vec<String>,
}

impl FileFilter {
    fn should_include_file(&self, path: &Path) -> bool {
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        if self.exclude.iter().any(|p| glob_match(p, &name)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| glob_match(p, &name))
    }

    fn should_descend(&self, path: &Path) -> bool {
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        !self.prune_dirs.iter().any(|p| glob_match(p, &name))
    }
}

/// Wildcard match: `*` matches any run, `?` matches one character
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Walk `root`, calling `on_entry` for every regular file that passes the
/// filter. Unreadable entries are logged and skipped.
pub fn walk_directory<F>(
    root: &Path,
    filter: &FileFilter,
    follow_symlinks: bool,
    mut on_entry: F,
) -> Result<u64>
where
    F: FnMut(FileEntry),
{
    use walkdir::WalkDir;

    if !root.is_dir() {
        bail!("source directory does not exist: {}", root.display());
    }

    let mut count = 0u64;
    let walker = WalkDir::new(root)
        .follow_links(follow_symlinks)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0 || !e.file_type().is_dir() || filter.should_descend(e.path())
        });
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !filter.should_include_file(path) {
            debug!(path = %path.display(), "filtered out");
            continue;
        }
        match entry.metadata() {
            Ok(md) => {
                on_entry(FileEntry {
                    path: path.to_path_buf(),
                    id: identifier_for(root, path),
                    size: md.len(),
                });
                count += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "cannot stat, skipping"),
        }
    }
    Ok(count)
}

/// Parse an explicit file list: one `path[\tsize]` per line, relative to
/// `root`. Missing sizes are filled in from the filesystem.
pub fn read_file_list<R: BufRead>(reader: R, root: &Path) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.context("reading file list")?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').filter(|f| !f.is_empty()).collect();
        if fields.is_empty() || fields.len() > 2 {
            bail!("invalid file list line {}: {:?}", lineno + 1, line);
        }
        let rel = fields[0];
        let path = root.join(rel);
        let size = match fields.get(1) {
            Some(s) => s
                .trim()
                .parse::<u64>()
                .with_context(|| format!("invalid size on line {}: {:?}", lineno + 1, s))?,
            None => std::fs::metadata(&path)
                .with_context(|| format!("stat {}", path.display()))?
                .len(),
        };
        entries.push(FileEntry {
            id: identifier_for(root, &path),
            path,
            size,
        });
    }
    Ok(entries)
}
