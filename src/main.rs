//! Static data layout fingerprinting tool entry point.

use anyhow::bail;
use clap::{Parser, Subcommand};
use elflayout::analyze::{analyze, AnalysisOptions, FileAnalysis};
use elflayout::diff;
use elflayout::digest::FileDescriptor;
use elflayout::dwarf::lookup::LookupPolicy;
use elflayout::dwarf::resolve::FingerprintOptions;
use elflayout::elf::Category;
use elflayout::merge::{MergedRecord, VariableRecord};
use std::collections::HashMap;
use std::fmt::Write;
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Args {
    /// Keep aliases (typedefs and const qualifiers) visible in type identity
    #[arg(short, long, global = true)]
    aliases: bool,

    /// Mix names of variables, complex types and members into fingerprints
    #[arg(short, long, global = true)]
    names: bool,

    /// Filesystem root for external debug file lookup
    #[arg(long, default_value = "/", global = true)]
    root: PathBuf,

    /// Search external debug symbol files when a binary has no embedded DWARF
    #[arg(long, global = true)]
    dbgsym: bool,

    /// Additionally query debuginfod for external debug symbol files
    #[arg(long, global = true)]
    dbgsym_extern: bool,

    #[command(subcommand)]
    command: Option<Command>,

    /// ELF files with debug information to fingerprint and compare
    files: Vec<PathBuf>,

    /// Print the records behind every category digest
    #[arg(short, long)]
    verbose: bool,

    /// Restrict digests to writable and TLS categories
    #[arg(short, long)]
    writable: bool,

    /// Report nothing, exit nonzero when the files differ
    #[arg(short, long)]
    identical: bool,

    /// Include the data type set digest in the comparison
    #[arg(long)]
    datatypes: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enumerate all static variables
    Variables {
        /// ELF file with debug information
        file: PathBuf,

        /// Include a source code reference comment
        #[arg(short, long)]
        source: bool,

        /// Show TLS variables instead of static ones
        #[arg(short, long)]
        tls: bool,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },
    /// Enumerate all aggregate data types (struct, class, union, enum)
    Datatypes {
        /// ELF file with debug information
        file: PathBuf,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },
    /// Emit equivalent declarations of the static variables
    Globals {
        /// ELF file with debug information
        file: PathBuf,
    },
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    match run(args) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{e:#}");
            process::exit(2);
        }
    }
}

fn run(args: Args) -> anyhow::Result<i32> {
    let fingerprint = FingerprintOptions {
        aliases: args.aliases,
        names: args.names,
    };
    let lookup = LookupPolicy {
        root: args.root.clone(),
        local: args.dbgsym || args.dbgsym_extern,
        debuginfod: args.dbgsym_extern,
    };

    match args.command {
        Some(Command::Variables {
            file,
            source,
            tls,
            json,
        }) => {
            let opts = AnalysisOptions {
                fingerprint,
                writable_only: false,
                type_set: false,
                lookup,
            };
            let analysis = analyze(&file, &opts)?;
            let mut variables: Vec<VariableRecord> = analysis
                .variables
                .into_iter()
                .filter(|var| (var.category == Category::Tls) == tls)
                .collect();
            variables.sort_by(|a, b| (a.value, a.name.as_str()).cmp(&(b.value, b.name.as_str())));

            if json {
                println!("{}", serde_json::to_string_pretty(&variables)?);
            } else {
                for var in &variables {
                    println!("{}", render_variable(var, source));
                }
            }
            Ok(0)
        }
        Some(Command::Datatypes { file, json }) => {
            let opts = AnalysisOptions {
                fingerprint,
                writable_only: false,
                type_set: true,
                lookup,
            };
            let analysis = analyze(&file, &opts)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&analysis.types)?);
            } else {
                for datatype in &analysis.types {
                    println!(
                        "{} {} bytes # {:016x}",
                        datatype.identifier, datatype.total_size, datatype.hash
                    );
                }
                if let Some(digest) = analysis.descriptor.type_set_digest {
                    println!("{digest:016x}");
                }
            }
            Ok(0)
        }
        Some(Command::Globals { file }) => {
            let opts = AnalysisOptions {
                fingerprint,
                writable_only: false,
                type_set: false,
                lookup,
            };
            let analysis = analyze(&file, &opts)?;
            for record in &analysis.records {
                let Some(identifier) = &record.type_identifier else {
                    continue;
                };
                let linkage = if record.external { "extern " } else { "static " };
                println!(
                    "{linkage}{identifier} {}; /* {} byte @ {:#x} */",
                    record.name, record.size, record.value
                );
            }
            Ok(0)
        }
        None => run_diff(args, fingerprint, lookup),
    }
}

fn run_diff(
    args: Args,
    fingerprint: FingerprintOptions,
    lookup: LookupPolicy,
) -> anyhow::Result<i32> {
    if args.files.is_empty() {
        bail!("no input files");
    }

    let opts = AnalysisOptions {
        fingerprint,
        writable_only: args.writable,
        type_set: args.datatypes,
        lookup,
    };

    // a broken input never turns into success, but it also does not stop
    // the remaining files from being compared
    let mut failed = false;
    let mut analyses: Vec<FileAnalysis> = vec![];
    for path in &args.files {
        match analyze(path, &opts) {
            Ok(analysis) => analyses.push(analysis),
            Err(e) => {
                failed = true;
                eprintln!("{}: {e:#}", path.display());
            }
        }
    }
    if analyses.is_empty() {
        bail!("no readable input files");
    }

    let records_by_path: HashMap<PathBuf, &[MergedRecord]> = analyses
        .iter()
        .map(|a| (a.descriptor.path.clone(), a.records.as_slice()))
        .collect();

    let classes = diff::partition(analyses.iter().map(|a| a.descriptor.clone()).collect());
    let all_identical = diff::identical(&classes);

    if !args.identical {
        for class in &classes {
            for descriptor in class {
                println!("{}", render_header(descriptor));
            }
            let exemplar = &class[0];
            let records = records_by_path
                .get(&exemplar.path)
                .copied()
                .unwrap_or_default();
            for (category, digest) in &exemplar.digests {
                let mut line = format!("{digest:016x} {category}");
                if args.verbose {
                    line.push_str(&render_category_body(records, *category));
                }
                println!("{line}");
            }
            if let Some(digest) = exemplar.type_set_digest {
                println!("{digest:016x} DATATYPES");
            }
            println!();
        }
    }

    if failed {
        return Ok(2);
    }
    Ok(if all_identical { 0 } else { 1 })
}

fn render_variable(var: &VariableRecord, source: bool) -> String {
    let linkage = if var.external { "extern " } else { "" };
    let mut line = format!(
        "{linkage}{}({}) {} byte @ {:016x} # {:016x}",
        var.name, var.type_identifier, var.size, var.value, var.type_hash
    );
    if source {
        if let Some(decl) = &var.decl {
            let _ = write!(line, " /* {decl} */");
        }
    }
    line
}

fn render_header(descriptor: &FileDescriptor) -> String {
    let mut line = format!("# {}", descriptor.path.display());
    if let Some(build_id) = &descriptor.build_id {
        let _ = write!(line, " [{build_id}]");
    }
    if let Some(dbgsym) = &descriptor.dbgsym_path {
        let _ = write!(line, " ({})", dbgsym.display());
    }
    line
}

fn render_category_body(records: &[MergedRecord], category: Category) -> String {
    let mut body = String::from(" [");
    for record in records.iter().filter(|r| r.category == category) {
        let _ = write!(
            body,
            " {}@{}/{}:{}",
            record.name, record.relative_value, record.page_alignment, record.size
        );
        if let Some(hash) = record.type_hash {
            let _ = write!(body, "#{hash:016x}");
        }
    }
    body.push_str(" ]");
    body
}
