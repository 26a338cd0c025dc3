use anyhow::{Context, Result, anyhow};
use std::{
    fs,
    io::Write,
    path::Path,
};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Heap ceiling directive; existing occurrences are left alone unless a size is configured.
pub const HEAP_PREFIX: &str = "-Xmx";

/// Lets the JVM size its heap from the container's cgroup memory limit.
pub const CONTAINER_MEMORY_BLOCK: [&str; 4] = [
    "-XX:+UnlockExperimentalVMOptions",
    "-XX:+UseCGroupMemoryLimitForHeap",
    "-XX:InitialRAMFraction=4",
    "-XX:MaxRAMFraction=2",
];

/// Which directives the patch owns and what it writes.
#[derive(Debug, Clone)]
pub struct OptionsPatch<'a> {
    pub owned_prefixes: &'a [&'a str],
    pub block: &'a [&'a str],
    pub heap_size: Option<&'a str>,
}

impl<'a> OptionsPatch<'a> {
    pub fn container_memory(heap_size: Option<&'a str>) -> Self {
        Self {
            owned_prefixes: &[HEAP_PREFIX],
            block: &CONTAINER_MEMORY_BLOCK,
            heap_size,
        }
    }

    /// Applies the patch to `lines`. Applying it again to the output yields the same lines.
    pub fn apply<S: AsRef<str>>(&self, lines: &[S]) -> Vec<String> {
        let mut patched = Vec::with_capacity(lines.len() + self.block.len());
        let mut heap_written = false;

        for line in lines.iter().map(AsRef::as_ref) {
            if self.block.contains(&line.trim()) {
                continue;
            }

            if let Some(size) = self.heap_size {
                if self.is_owned(line) {
                    if !heap_written {
                        patched.push(format!("{HEAP_PREFIX}{size}"));
                        heap_written = true;
                    }
                    continue;
                }
            }

            patched.push(line.to_string());
        }

        if let (Some(size), false) = (self.heap_size, heap_written) {
            patched.push(format!("{HEAP_PREFIX}{size}"));
        }

        patched.extend(self.block.iter().map(|line| line.to_string()));
        patched
    }

    fn is_owned(&self, line: &str) -> bool {
        self.owned_prefixes
            .iter()
            .any(|prefix| line.starts_with(prefix))
    }
}

/// Rewrites the options file at `path` in place.
///
/// The new content is written to a sibling temporary file which then replaces
/// the original, so readers never observe a half-written file.
pub fn patch_options(path: &Path, patch: &OptionsPatch<'_>) -> Result<()> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read options file {}", path.display()))?;
    let lines: Vec<&str> = content.lines().collect();
    debug!("Current options: {lines:?}");

    let patched = patch.apply(&lines);

    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", path.display()))?;
    let permissions = fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .permissions();

    let mut staged = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;

    for line in &patched {
        writeln!(staged, "{line}")?;
    }
    staged.as_file().sync_all()?;
    fs::set_permissions(staged.path(), permissions)?;

    staged
        .persist(path)
        .map_err(|error| error.error)
        .with_context(|| format!("Failed to replace {}", path.display()))?;

    info!("Patched {} ({} directives)", path.display(), patched.len());
    Ok(())
}
