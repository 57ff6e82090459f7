//! Static site tree: canonical root plus the set of extension-less `.html`
//! paths used for URL rewriting (`/about` → `/about.html`).

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Site {
    root: PathBuf,
    html_paths: HashSet<String>,
}

impl Site {
    /// Canonicalizes `path` and enumerates every `.html` file below it.
    pub fn load(path: &Path) -> Result<Self> {
        let root = path
            .canonicalize()
            .map_err(|err| Error::Site(format!("{}: {err}", path.display())))?;
        if !root.is_dir() {
            return Err(Error::Site(format!("{} is not a directory", root.display())));
        }
        let mut html_paths = HashSet::new();
        collect_html(&root, &root, &mut html_paths)?;
        info!(
            "site root {} with {} html pages",
            root.display(),
            html_paths.len()
        );
        Ok(Self { root, html_paths })
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True when `path` (no extension, leading slash) names a known page.
    #[inline]
    pub fn has_page(&self, path: &str) -> bool {
        self.html_paths.contains(path)
    }

    #[cfg(test)]
    pub fn pages(&self) -> &HashSet<String> {
        &self.html_paths
    }
}

fn collect_html(root: &Path, dir: &Path, out: &mut HashSet<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_html(root, &path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "html") {
            let relative = path
                .with_extension("")
                .strip_prefix(root)
                .map_err(|err| Error::Site(err.to_string()))?
                .to_string_lossy()
                .into_owned();
            out.insert(format!("/{relative}"));
        }
    }
    Ok(())
}
