use crate::digest::{self, ComposeOptions, FileDescriptor};
use crate::dwarf::lookup::LookupPolicy;
use crate::dwarf::resolve::{aggregate_types, FingerprintOptions, ResolvedType};
use crate::dwarf::variable::extract_variables;
use crate::dwarf::DebugInfo;
use crate::elf::{self, ElfLayout};
use crate::error::Error;
use crate::merge::{self, MergedRecord, VariableRecord};
use memmap2::Mmap;
use object::File;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    pub fingerprint: FingerprintOptions,
    /// Restrict digests to the writable+TLS categories.
    pub writable_only: bool,
    /// Also compose the type-set digest into the descriptor.
    pub type_set: bool,
    pub lookup: LookupPolicy,
}

/// Everything one input file folds into: the comparable descriptor plus
/// the record lists behind it.
pub struct FileAnalysis {
    pub descriptor: FileDescriptor,
    /// Symbol table left-joined with debug info, in digest order.
    pub records: Vec<MergedRecord>,
    /// Debug-info variables alone, categorized.
    pub variables: Vec<VariableRecord>,
    /// Deduplicated aggregate types, sorted by identifier.
    pub types: Vec<ResolvedType>,
}

/// Run the full pipeline over one input file. The file is opened, mapped,
/// fully processed and closed before the function returns, nothing is
/// shared across inputs.
pub fn analyze(path: &Path, opts: &AnalysisOptions) -> Result<FileAnalysis, Error> {
    let file = fs::File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    let data = &*mmap;

    let layout = ElfLayout::parse(data)?;
    let obj = File::parse(data)?;

    let debug_info = DebugInfo::load(path, &obj, layout.build_id.as_deref(), &opts.lookup)?;

    let raw = extract_variables(&debug_info.store, opts.fingerprint)?;
    let variables: Vec<VariableRecord> = raw
        .into_iter()
        .filter_map(|raw| VariableRecord::classify(raw, &layout))
        .collect();

    let symbols = elf::symbol_records(&obj, &layout);
    let records = merge::merge(symbols, variables.clone())?;

    let digests = digest::category_digests(
        &records,
        &layout.categories(),
        ComposeOptions {
            names: opts.fingerprint.names,
            writable_only: opts.writable_only,
        },
    );

    let types = aggregate_types(&debug_info.store, opts.fingerprint)?;
    let type_set_digest = opts.type_set.then(|| digest::type_set_digest(&types));

    Ok(FileAnalysis {
        descriptor: FileDescriptor {
            path: path.to_path_buf(),
            build_id: layout.build_id_hex(),
            dbgsym_path: debug_info.dbgsym_path,
            digests,
            type_set_digest,
        },
        records,
        variables,
        types,
    })
}
