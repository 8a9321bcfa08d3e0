use log::debug;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Where and how to look for external debug-info files when an input
/// carries no embedded DWARF.
#[derive(Debug, Clone)]
pub struct LookupPolicy {
    /// Filesystem prefix for every local candidate path.
    pub root: PathBuf,
    /// Probe the local candidate paths.
    pub local: bool,
    /// Ask a debuginfod service, keyed by build ID.
    pub debuginfod: bool,
}

impl LookupPolicy {
    pub fn disabled() -> Self {
        Self {
            root: PathBuf::from("/"),
            local: false,
            debuginfod: false,
        }
    }

    /// Search for a debug-info file belonging to `elf_path`, in the fixed
    /// candidate order, then via debuginfod.
    pub fn find(&self, elf_path: &Path, build_id: Option<&[u8]>) -> Option<PathBuf> {
        if self.local {
            for candidate in self.candidates(elf_path, build_id) {
                debug!(target: "elflayout", "probe debug file candidate {candidate:?}");
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }

        if self.debuginfod {
            if let Some(id) = build_id {
                return debuginfod_fetch(&hex(id));
            }
        }

        None
    }

    fn candidates(&self, elf_path: &Path, build_id: Option<&[u8]>) -> Vec<PathBuf> {
        let mut candidates = vec![];

        if let Some(id) = build_id {
            if id.len() > 1 {
                candidates.push(self.under_root(&PathBuf::from(format!(
                    "/usr/lib/debug/.build-id/{:02x}/{}.debug",
                    id[0],
                    hex(&id[1..])
                ))));
            }
        }

        let debug_name = match elf_path.file_name() {
            Some(name) => format!("{}.debug", name.to_string_lossy()),
            None => return candidates,
        };

        let sibling = elf_path.with_file_name(&debug_name);
        candidates.push(self.under_root(&sibling));
        if let Some(dir) = elf_path.parent() {
            candidates.push(self.under_root(&dir.join(".debug").join(&debug_name)));
        }
        candidates.push(
            self.root
                .join("usr/lib/debug")
                .join(sibling.strip_prefix("/").unwrap_or(&sibling)),
        );

        candidates
    }

    fn under_root(&self, path: &Path) -> PathBuf {
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Ask the debuginfod client for a debug file. The client honors
/// `DEBUGINFOD_URLS` and caches downloads locally, printing the cache path
/// on success.
fn debuginfod_fetch(build_id: &str) -> Option<PathBuf> {
    debug!(target: "elflayout", "query debuginfod for build id {build_id}");
    let output = Command::new("debuginfod-find")
        .arg("debuginfo")
        .arg(build_id)
        .output();
    match output {
        Ok(output) if output.status.success() => {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            (!path.is_empty()).then(|| PathBuf::from(path))
        }
        Ok(output) => {
            debug!(
                target: "elflayout",
                "debuginfod lookup failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            None
        }
        Err(e) => {
            debug!(target: "elflayout", "debuginfod client unavailable: {e}");
            None
        }
    }
}
