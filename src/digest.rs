use crate::dwarf::resolve::ResolvedType;
use crate::elf::Category;
use crate::merge::MergedRecord;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use xxhash_rust::xxh64::Xxh64;

/// What the per-category digests are computed over.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComposeOptions {
    /// Mix variable names into the digests.
    pub names: bool,
    /// Restrict to the writable+TLS categories for a tighter ABI view.
    pub writable_only: bool,
}

/// The comparable essence of one input file: its per-category digests and,
/// optionally, the digest of its declared type set. `path`, `build_id` and
/// `dbgsym_path` identify the file for reporting but take no part in
/// equivalence.
#[derive(Debug, Clone, Serialize)]
pub struct FileDescriptor {
    pub path: PathBuf,
    pub build_id: Option<String>,
    pub dbgsym_path: Option<PathBuf>,
    pub digests: BTreeMap<Category, u64>,
    pub type_set_digest: Option<u64>,
}

impl FileDescriptor {
    pub fn equivalence_key(&self) -> (Vec<(Category, u64)>, Option<u64>) {
        (
            self.digests.iter().map(|(&c, &d)| (c, d)).collect(),
            self.type_set_digest,
        )
    }
}

/// Fold the merged records into one digest per retained category.
///
/// Every category present in the object gets a digest, even an empty one:
/// a category losing its last variable must change the descriptor, not
/// erase the evidence.
pub fn category_digests(
    records: &[MergedRecord],
    present: &[Category],
    opts: ComposeOptions,
) -> BTreeMap<Category, u64> {
    let mut retained: Vec<Category> = present
        .iter()
        .copied()
        .chain(records.iter().map(|r| r.category))
        .filter(|category| !opts.writable_only || category.is_writable_view())
        .collect();
    retained.sort_unstable();
    retained.dedup();

    retained
        .into_iter()
        .map(|category| {
            let mut hasher = Xxh64::new(0);
            for record in records.iter().filter(|r| r.category == category) {
                if opts.names {
                    hasher.update(record.name.as_bytes());
                }
                if let Some(hash) = record.type_hash {
                    hasher.update(format!("#{hash:016x}").as_bytes());
                }
                hasher.update(
                    format!(
                        "@{}/{}:{}",
                        record.relative_value, record.page_alignment, record.size
                    )
                    .as_bytes(),
                );
            }
            (category, hasher.digest())
        })
        .collect()
}

/// Digest of the declared type schema: every aggregate type seen, sorted
/// by identifier, independent of which variables instantiate it.
pub fn type_set_digest(types: &[ResolvedType]) -> u64 {
    let mut hasher = Xxh64::new(0);
    for resolved in types {
        hasher.update(format!("{:016x}", resolved.hash).as_bytes());
    }
    hasher.digest()
}
