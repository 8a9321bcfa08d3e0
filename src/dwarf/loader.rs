use crate::error::Error;
use gimli::RunTimeEndian;
use object::{Object, ObjectSection};
use std::borrow::Cow;
use std::sync::Arc;

pub type EndianArcSlice = gimli::EndianArcSlice<gimli::RunTimeEndian>;

fn load_section(
    id: gimli::SectionId,
    file: &object::File,
    endian: RunTimeEndian,
) -> Result<EndianArcSlice, Error> {
    let data = file
        .section_by_name(id.name())
        .and_then(|section| section.uncompressed_data().ok())
        .unwrap_or(Cow::Borrowed(&[]));
    Ok(gimli::EndianArcSlice::new(Arc::from(&*data), endian))
}

/// Load all DWARF sections of an object file, with empty fallbacks for the
/// ones it does not carry.
pub fn load(file: &object::File) -> Result<gimli::Dwarf<EndianArcSlice>, Error> {
    let endian = if file.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };
    gimli::Dwarf::load(|id| load_section(id, file, endian))
}
