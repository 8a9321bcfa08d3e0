pub mod loader;
pub mod lookup;
pub mod resolve;
pub mod store;
pub mod variable;

pub use loader::EndianArcSlice;

use crate::dwarf::lookup::LookupPolicy;
use crate::dwarf::store::{DieAttributes, DieEvent, DieStore, DieTag, StaticLocation};
use crate::elf;
use crate::error::Error;
use fallible_iterator::FallibleIterator;
use gimli::{AttributeValue, DebuggingInformationEntry, DwAt, Expression, Operation, Reader};
use log::{debug, warn};
use memmap2::Mmap;
use object::File;
use std::fs;
use std::path::{Path, PathBuf};

type GimliUnit = gimli::Unit<EndianArcSlice>;

/// Debug information of one input file: the reconstructed DIE store and,
/// when the DWARF data came from a separate file, its path.
pub struct DebugInfo {
    pub store: DieStore,
    pub dbgsym_path: Option<PathBuf>,
}

impl DebugInfo {
    /// Load debug information for an ELF object: embedded DWARF when
    /// present, otherwise the first external debug file the lookup policy
    /// yields.
    pub fn load(
        path: &Path,
        obj: &File,
        build_id: Option<&[u8]>,
        policy: &LookupPolicy,
    ) -> Result<Self, Error> {
        if elf::has_embedded_dwarf(obj) {
            debug!(target: "elflayout", "load debug information from {path:?}");
            let dwarf = loader::load(obj)?;
            return Ok(Self {
                store: build_store(&dwarf)?,
                dbgsym_path: None,
            });
        }

        let Some(debug_path) = policy.find(path, build_id) else {
            return Err(Error::NoDebugInformation(path.to_path_buf()));
        };
        debug!(
            target: "elflayout",
            "{path:?} has no embedded debug information, load {debug_path:?}"
        );

        let file = fs::File::open(&debug_path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let debug_obj = File::parse(&*mmap)?;
        let dwarf = loader::load(&debug_obj)?;
        Ok(Self {
            store: build_store(&dwarf)?,
            dbgsym_path: Some(debug_path),
        })
    }
}

/// Rebuild the DIE store from the gimli unit forest, one event per DIE.
fn build_store(dwarf: &gimli::Dwarf<EndianArcSlice>) -> Result<DieStore, Error> {
    let mut store = DieStore::new();

    let headers = dwarf.units().collect::<Vec<_>>()?;
    for header in headers {
        let unit = dwarf.unit(header)?;
        let files = unit_files(dwarf, &unit)?;

        let mut depth = 0isize;
        let mut cursor = unit.entries();
        while let Some((delta, die)) = cursor.next_dfs()? {
            depth += delta;
            store.ingest(DieEvent {
                depth: depth as usize,
                offset: die.offset().0 as u64,
                tag: map_tag(die.tag()),
                attrs: decode_attrs(dwarf, &unit, die, &files)?,
            })?;
        }
    }

    Ok(store)
}

fn map_tag(tag: gimli::DwTag) -> DieTag {
    match tag {
        gimli::DW_TAG_compile_unit => DieTag::CompileUnit,
        gimli::DW_TAG_structure_type => DieTag::StructureType,
        gimli::DW_TAG_class_type => DieTag::ClassType,
        gimli::DW_TAG_union_type => DieTag::UnionType,
        gimli::DW_TAG_enumeration_type => DieTag::EnumerationType,
        gimli::DW_TAG_enumerator => DieTag::Enumerator,
        gimli::DW_TAG_typedef => DieTag::Typedef,
        gimli::DW_TAG_const_type => DieTag::ConstType,
        gimli::DW_TAG_pointer_type => DieTag::PointerType,
        gimli::DW_TAG_array_type => DieTag::ArrayType,
        gimli::DW_TAG_subrange_type => DieTag::SubrangeType,
        gimli::DW_TAG_base_type => DieTag::BaseType,
        gimli::DW_TAG_member => DieTag::Member,
        gimli::DW_TAG_variable => DieTag::Variable,
        _ => DieTag::Other,
    }
}

type GimliDie<'abbrev, 'unit> = DebuggingInformationEntry<'abbrev, 'unit, EndianArcSlice>;

fn decode_attrs(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit: &GimliUnit,
    die: &GimliDie,
    files: &[String],
) -> Result<DieAttributes, Error> {
    let mut attrs = DieAttributes {
        address_size: Some(unit.header.address_size()),
        ..Default::default()
    };

    attrs.name = attr_string(dwarf, unit, die, gimli::DW_AT_name)?;

    if let Some(attr) = die.attr(gimli::DW_AT_type)? {
        match attr.value() {
            AttributeValue::UnitRef(offset) => attrs.type_ref = Some(offset.0 as u64),
            _ => warn!(
                target: "elflayout",
                "non unit-local type reference at {:#x}, ignored",
                die.offset().0
            ),
        }
    }

    attrs.byte_size = unsigned_attr(die, gimli::DW_AT_byte_size, "byte_size")?;
    attrs.data_member_location =
        unsigned_attr(die, gimli::DW_AT_data_member_location, "data_member_location")?;
    attrs.const_value = signed_attr(die, gimli::DW_AT_const_value, "const_value")?;
    attrs.lower_bound = signed_attr(die, gimli::DW_AT_lower_bound, "lower_bound")?;
    attrs.upper_bound = signed_attr(die, gimli::DW_AT_upper_bound, "upper_bound")?;
    attrs.count = signed_attr(die, gimli::DW_AT_count, "count")?;

    if let Some(attr) = die.attr(gimli::DW_AT_encoding)? {
        if let AttributeValue::Encoding(encoding) = attr.value() {
            attrs.encoding = Some(encoding);
        }
    }
    if let Some(attr) = die.attr(gimli::DW_AT_external)? {
        attrs.external = matches!(attr.value(), AttributeValue::Flag(true));
    }
    if let Some(attr) = die.attr(gimli::DW_AT_location)? {
        if let AttributeValue::Exprloc(expr) = attr.value() {
            attrs.location = decode_static_location(&expr, unit.encoding());
        }
    }

    attrs.decl = decode_decl(die, files)?;

    Ok(attrs)
}

fn attr_string(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit: &GimliUnit,
    die: &GimliDie,
    attr: DwAt,
) -> Result<Option<String>, Error> {
    Ok(die
        .attr(attr)?
        .and_then(|attr| dwarf.attr_string(unit, attr.value()).ok())
        .map(|s| s.to_string_lossy().map(|s| s.to_string()))
        .transpose()?)
}

/// Numeric attribute slot. Dynamic forms (expressions, location lists) are
/// not part of a static layout and decode to `None`, anything else that is
/// not an integer is a hard error.
fn unsigned_attr(die: &GimliDie, at: DwAt, name: &'static str) -> Result<Option<u64>, Error> {
    let Some(attr) = die.attr(at)? else {
        return Ok(None);
    };
    match attr.udata_value() {
        Some(value) => Ok(Some(value)),
        None => match attr.value() {
            AttributeValue::Exprloc(_)
            | AttributeValue::LocationListsRef(_)
            | AttributeValue::Block(_) => Ok(None),
            AttributeValue::Sdata(value) if value >= 0 => Ok(Some(value as u64)),
            _ => Err(Error::NumericAttribute {
                offset: die.offset().0 as u64,
                attr: name,
            }),
        },
    }
}

fn signed_attr(die: &GimliDie, at: DwAt, name: &'static str) -> Result<Option<i64>, Error> {
    let Some(attr) = die.attr(at)? else {
        return Ok(None);
    };
    if let Some(value) = attr.sdata_value() {
        return Ok(Some(value));
    }
    match attr.udata_value() {
        Some(value) => Ok(Some(value as i64)),
        None => match attr.value() {
            AttributeValue::Exprloc(_)
            | AttributeValue::LocationListsRef(_)
            | AttributeValue::UnitRef(_)
            | AttributeValue::Block(_) => Ok(None),
            _ => Err(Error::NumericAttribute {
                offset: die.offset().0 as u64,
                attr: name,
            }),
        },
    }
}

fn decode_decl(die: &GimliDie, files: &[String]) -> Result<Option<String>, Error> {
    let file = unsigned_attr(die, gimli::DW_AT_decl_file, "decl_file")?;
    let line = unsigned_attr(die, gimli::DW_AT_decl_line, "decl_line")?;
    let (Some(file), Some(line)) = (file, line) else {
        return Ok(None);
    };
    let Some(file) = files.get(file as usize) else {
        return Ok(None);
    };

    let mut decl = format!("{file}:{line}");
    if let Some(column) = unsigned_attr(die, gimli::DW_AT_decl_column, "decl_column")? {
        decl.push_str(&format!(":{column}"));
    }
    Ok(Some(decl))
}

/// Reduce a location expression to one of the two statically resolvable
/// shapes: an absolute address or a TLS-base relative offset. Every other
/// expression (frame-relative, register, composite) describes a
/// non-static variable and decodes to `None`.
fn decode_static_location(
    expr: &Expression<EndianArcSlice>,
    encoding: gimli::Encoding,
) -> Option<StaticLocation> {
    let mut ops = expr.clone().operations(encoding);
    let first = ops.next().ok()??;
    match first {
        Operation::Address { address } => match ops.next() {
            Ok(None) => Some(StaticLocation::Absolute(address)),
            _ => None,
        },
        Operation::UnsignedConstant { value } => match ops.next() {
            Ok(Some(Operation::TLS)) => match ops.next() {
                Ok(None) => Some(StaticLocation::TlsOffset(value)),
                _ => None,
            },
            _ => None,
        },
        Operation::SignedConstant { value } => match ops.next() {
            Ok(Some(Operation::TLS)) => match ops.next() {
                Ok(None) => Some(StaticLocation::TlsOffset(value as u64)),
                _ => None,
            },
            _ => None,
        },
        _ => None,
    }
}

fn unit_files(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit: &GimliUnit,
) -> Result<Vec<String>, Error> {
    let Some(ref program) = unit.line_program else {
        return Ok(vec![]);
    };
    let header = program.header();

    let mut files = vec![];
    match header.file(0) {
        Some(file) => files.push(render_file_path(dwarf, unit, file, header)?),
        None => files.push(String::new()),
    }
    let mut index = 1;
    while let Some(file) = header.file(index) {
        files.push(render_file_path(dwarf, unit, file, header)?);
        index += 1;
    }

    Ok(files)
}

fn render_file_path(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit: &GimliUnit,
    file: &gimli::FileEntry<EndianArcSlice, usize>,
    header: &gimli::LineProgramHeader<EndianArcSlice, usize>,
) -> Result<String, Error> {
    let mut path = PathBuf::new();
    if let Some(ref comp_dir) = unit.comp_dir {
        path.push(comp_dir.to_string_lossy()?.as_ref());
    }

    if file.directory_index() != 0 {
        if let Some(directory) = file.directory(header) {
            path.push(dwarf.attr_string(unit, directory)?.to_string_lossy()?.as_ref());
        }
    }

    path.push(
        dwarf
            .attr_string(unit, file.path_name())?
            .to_string_lossy()?
            .as_ref(),
    );

    Ok(path.to_string_lossy().into_owned())
}
