pub mod symbol;

pub use symbol::{symbol_records, SymbolRecord};

use crate::error::Error;
use object::elf;
use object::read::elf::{FileHeader, ProgramHeader, SectionHeader};
use object::{Endianness, FileKind, Object, ObjectSection};
use serde::Serialize;
use std::collections::HashMap;
use strum_macros::Display;

pub const PAGE_SIZE: u64 = 4096;

/// Coarse classification of an address range.
///
/// `RELRO` is the read-only overlay inside a writable load segment,
/// finalized by the dynamic linker.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Category {
    R,
    Rw,
    Rx,
    Rwx,
    Tls,
    Relro,
}

impl Category {
    /// True for categories that contribute to the writable ABI view
    /// (`--writable`).
    #[inline(always)]
    pub fn is_writable_view(self) -> bool {
        matches!(
            self,
            Category::Rw | Category::Rwx | Category::Tls | Category::Relro
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRecord {
    pub category: Category,
    pub start: u64,
    pub size: u64,
}

impl SegmentRecord {
    #[inline(always)]
    fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.start + self.size
    }
}

/// Program-header view of one ELF object: load/TLS segments with their
/// categories, the optional RELRO overlay, the build ID note and the
/// section-index to segment-index containment map.
#[derive(Debug, Default)]
pub struct ElfLayout {
    pub segments: Vec<SegmentRecord>,
    pub relro: Option<(u64, u64)>,
    pub build_id: Option<Vec<u8>>,
    pub section_to_segment: HashMap<usize, usize>,
}

impl ElfLayout {
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        match FileKind::parse(data)? {
            FileKind::Elf32 => Self::parse_headers::<elf::FileHeader32<Endianness>>(data),
            FileKind::Elf64 => Self::parse_headers::<elf::FileHeader64<Endianness>>(data),
            _ => Err(Error::NotElf),
        }
    }

    fn parse_headers<Elf: FileHeader<Endian = Endianness>>(data: &[u8]) -> Result<Self, Error> {
        let header = Elf::parse(data)?;
        let endian = header.endian()?;

        let mut layout = ElfLayout::default();
        for phdr in header.program_headers(endian, data)? {
            match phdr.p_type(endian) {
                elf::PT_LOAD => layout.segments.push(SegmentRecord {
                    category: category_from_flags(phdr.p_flags(endian)),
                    start: phdr.p_vaddr(endian).into(),
                    size: phdr.p_memsz(endian).into(),
                }),
                elf::PT_TLS => layout.segments.push(SegmentRecord {
                    category: Category::Tls,
                    start: phdr.p_vaddr(endian).into(),
                    size: phdr.p_memsz(endian).into(),
                }),
                elf::PT_GNU_RELRO => {
                    layout.relro = Some((phdr.p_vaddr(endian).into(), phdr.p_memsz(endian).into()))
                }
                elf::PT_NOTE => {
                    if layout.build_id.is_none() {
                        layout.build_id = find_build_id::<Elf>(phdr, endian, data);
                    }
                }
                _ => {}
            }
        }

        if let Some((start, size)) = layout.relro {
            let covered = layout.segments.iter().any(|seg| {
                matches!(seg.category, Category::Rw | Category::Rwx)
                    && start >= seg.start
                    && start + size <= seg.start + seg.size
            });
            if !covered {
                return Err(Error::RelroOutsideLoad { start });
            }
        }

        for (index, section) in header.sections(endian, data)?.iter().enumerate() {
            let flags: u64 = section.sh_flags(endian).into();
            if flags & u64::from(elf::SHF_ALLOC) == 0 {
                continue;
            }
            let addr: u64 = section.sh_addr(endian).into();
            let size: u64 = section.sh_size(endian).into();
            let segment = layout.segments.iter().position(|seg| {
                seg.category != Category::Tls
                    && addr >= seg.start
                    && addr + size <= seg.start + seg.size
            });
            if let Some(segment) = segment {
                layout.section_to_segment.insert(index, segment);
            }
        }

        Ok(layout)
    }

    /// Categorize an absolute address: its load segment's category, with
    /// writable addresses inside the RELRO overlay reclassified, plus the
    /// start of the enclosing segment.
    pub fn classify(&self, addr: u64) -> Option<(Category, u64)> {
        let segment = self
            .segments
            .iter()
            .find(|seg| seg.category != Category::Tls && seg.contains(addr))?;
        Some((self.reclassify(segment.category, addr), segment.start))
    }

    /// Apply the RELRO overlay to a category assigned by segment lookup.
    pub fn reclassify(&self, category: Category, addr: u64) -> Category {
        if matches!(category, Category::Rw | Category::Rwx) {
            if let Some((start, size)) = self.relro {
                if addr >= start && addr < start + size {
                    return Category::Relro;
                }
            }
        }
        category
    }

    /// Category of the segment a section belongs to, per the containment
    /// map built at parse time.
    pub fn section_category(&self, section_index: usize) -> Option<Category> {
        self.section_to_segment
            .get(&section_index)
            .map(|&seg| self.segments[seg].category)
    }

    /// Categories present in this object, the universe of per-category
    /// digests.
    pub fn categories(&self) -> Vec<Category> {
        let mut categories: Vec<_> = self.segments.iter().map(|seg| seg.category).collect();
        if self.relro.is_some() {
            categories.push(Category::Relro);
        }
        categories.sort_unstable();
        categories.dedup();
        categories
    }

    /// Build ID rendered as lower-case hex.
    pub fn build_id_hex(&self) -> Option<String> {
        self.build_id
            .as_ref()
            .map(|id| id.iter().map(|b| format!("{b:02x}")).collect())
    }
}

fn category_from_flags(flags: u32) -> Category {
    match (flags & elf::PF_W != 0, flags & elf::PF_X != 0) {
        (false, false) => Category::R,
        (true, false) => Category::Rw,
        (false, true) => Category::Rx,
        (true, true) => Category::Rwx,
    }
}

fn find_build_id<Elf: FileHeader<Endian = Endianness>>(
    phdr: &Elf::ProgramHeader,
    endian: Endianness,
    data: &[u8],
) -> Option<Vec<u8>> {
    let mut notes = phdr.notes(endian, data).ok()??;
    while let Ok(Some(note)) = notes.next() {
        if note.name() == elf::ELF_NOTE_GNU && note.n_type(endian) == elf::NT_GNU_BUILD_ID {
            return Some(note.desc().to_vec());
        }
    }
    None
}

/// True when the object carries its own DWARF data.
pub fn has_embedded_dwarf(obj: &object::File) -> bool {
    obj.section_by_name(".debug_info")
        .is_some_and(|section| section.size() > 0)
}
