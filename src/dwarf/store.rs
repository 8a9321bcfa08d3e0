use crate::dwarf::resolve::TypeMemo;
use crate::error::Error;
use gimli::DwAte;
use indexmap::IndexMap;
use strum_macros::Display;

/// Closed tag vocabulary of the store. Tags outside of it are kept as
/// [`DieTag::Other`]: they still participate in type chains but carry no
/// tag-specific meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum DieTag {
    CompileUnit,
    StructureType,
    ClassType,
    UnionType,
    EnumerationType,
    Enumerator,
    Typedef,
    ConstType,
    PointerType,
    ArrayType,
    SubrangeType,
    BaseType,
    Member,
    Variable,
    Other,
}

impl DieTag {
    /// True for tags that declare an aggregate data type.
    #[inline(always)]
    pub fn is_aggregate(self) -> bool {
        matches!(
            self,
            DieTag::StructureType
                | DieTag::ClassType
                | DieTag::UnionType
                | DieTag::EnumerationType
        )
    }
}

/// A variable location already reduced to one of the two statically
/// resolvable shapes. Everything else (stack, register, optimized out)
/// never reaches the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticLocation {
    /// An absolute virtual address.
    Absolute(u64),
    /// An offset relative to the TLS block base.
    TlsOffset(u64),
}

impl StaticLocation {
    #[inline(always)]
    pub fn value(self) -> u64 {
        match self {
            StaticLocation::Absolute(addr) => addr,
            StaticLocation::TlsOffset(offset) => offset,
        }
    }

    #[inline(always)]
    pub fn is_tls(self) -> bool {
        matches!(self, StaticLocation::TlsOffset(_))
    }
}

/// Decoded attributes of a single DIE.
#[derive(Debug, Clone, Default)]
pub struct DieAttributes {
    pub name: Option<String>,
    /// Unit-local offset of the referenced type DIE.
    pub type_ref: Option<u64>,
    pub byte_size: Option<u64>,
    pub data_member_location: Option<u64>,
    pub encoding: Option<DwAte>,
    pub const_value: Option<i64>,
    pub lower_bound: Option<i64>,
    pub upper_bound: Option<i64>,
    pub count: Option<i64>,
    pub location: Option<StaticLocation>,
    pub external: bool,
    /// Declaration source folded into a single `file:line[:column]` string.
    pub decl: Option<String>,
    /// Address size of the compile unit, only meaningful on unit roots.
    pub address_size: Option<u8>,
}

/// One decoded DIE event of the debug-info stream.
#[derive(Debug, Clone)]
pub struct DieEvent {
    /// Nesting depth, 0 for compile unit roots.
    pub depth: usize,
    /// Unit-local offset.
    pub offset: u64,
    pub tag: DieTag,
    pub attrs: DieAttributes,
}

/// An attributed node of the reconstructed per-unit tree.
#[derive(Debug)]
pub struct Die {
    pub offset: u64,
    pub tag: DieTag,
    pub attrs: DieAttributes,
    /// Local id of the parent, roots point to themselves.
    pub parent: usize,
    /// Local ids of children in textual order.
    pub children: Vec<usize>,
    pub(crate) memo: TypeMemo,
}

/// One compile unit: a flat DIE vector indexed by a compact local id with an
/// offset map populated during parse.
#[derive(Debug, Default)]
pub struct Unit {
    dies: Vec<Die>,
    by_offset: IndexMap<u64, usize>,
    address_size: u8,
}

const DEFAULT_ADDRESS_SIZE: u8 = 8;

impl Unit {
    /// O(1) lookup by unit-local offset.
    pub fn lookup(&self, offset: u64) -> Option<&Die> {
        self.by_offset.get(&offset).map(|&id| &self.dies[id])
    }

    #[inline(always)]
    pub fn die(&self, id: usize) -> &Die {
        &self.dies[id]
    }

    /// DIEs in the order encountered in the stream.
    pub fn dies(&self) -> impl Iterator<Item = &Die> {
        self.dies.iter()
    }

    /// Children of a DIE in textual order.
    pub fn children<'a>(&'a self, die: &'a Die) -> impl Iterator<Item = &'a Die> {
        die.children.iter().map(|&id| &self.dies[id])
    }

    /// Pointer width of the unit's target machine.
    #[inline(always)]
    pub fn address_size(&self) -> u8 {
        self.address_size
    }
}

/// In-memory forest of DIEs grouped by compile unit, rebuilt from a stream
/// of [`DieEvent`]s.
///
/// Reconstruction tracks the depth of the last inserted DIE (`level`) and
/// its local id (`last`): a depth-0 event opens a fresh unit, a one-deeper
/// event nests under `last`, a shallower-or-equal event walks the parent
/// chain upward. Any other depth is a fatal discontinuity.
#[derive(Debug, Default)]
pub struct DieStore {
    units: Vec<Unit>,
    level: usize,
    last: usize,
}

impl DieStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn ingest(&mut self, event: DieEvent) -> Result<(), Error> {
        if event.tag == DieTag::CompileUnit {
            if event.depth != 0 {
                return Err(Error::DepthViolation {
                    offset: event.offset,
                    depth: event.depth,
                    level: self.level,
                });
            }

            let mut unit = Unit {
                address_size: event.attrs.address_size.unwrap_or(DEFAULT_ADDRESS_SIZE),
                ..Default::default()
            };
            unit.by_offset.insert(event.offset, 0);
            unit.dies.push(Die {
                offset: event.offset,
                tag: event.tag,
                attrs: event.attrs,
                parent: 0,
                children: vec![],
                memo: TypeMemo::default(),
            });

            self.units.push(unit);
            self.level = 0;
            self.last = 0;
            return Ok(());
        }

        let Some(unit) = self.units.last_mut() else {
            return Err(Error::NoUnitRoot {
                offset: event.offset,
            });
        };

        let parent = if event.depth > self.level {
            if event.depth != self.level + 1 {
                return Err(Error::DepthViolation {
                    offset: event.offset,
                    depth: event.depth,
                    level: self.level,
                });
            }
            self.last
        } else {
            let mut parent = unit.dies[self.last].parent;
            for _ in event.depth..self.level {
                parent = unit.dies[parent].parent;
            }
            parent
        };
        self.level = event.depth;

        let id = unit.dies.len();
        if unit.by_offset.insert(event.offset, id).is_some() {
            return Err(Error::DuplicateDie {
                offset: event.offset,
                unit: self.units.len() - 1,
            });
        }

        unit.dies[parent].children.push(id);
        unit.dies.push(Die {
            offset: event.offset,
            tag: event.tag,
            attrs: event.attrs,
            parent,
            children: vec![],
            memo: TypeMemo::default(),
        });
        self.last = id;

        Ok(())
    }
}
