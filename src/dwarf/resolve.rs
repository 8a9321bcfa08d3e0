use crate::dwarf::store::{Die, DieStore, DieTag, Unit};
use crate::error::Error;
use gimli::DwAte;
use once_cell::unsync::OnceCell;
use std::cell::Cell;
use std::collections::BTreeSet;
use std::fmt::Write;
use xxhash_rust::xxh64::Xxh64;

/// Fingerprint switches, fixed for the lifetime of a resolver.
///
/// `aliases` controls whether `typedef`/`const` decorate identity or stay
/// transparent, `names` controls whether type and member names take part in
/// identifiers and hashes at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FingerprintOptions {
    pub aliases: bool,
    pub names: bool,
}

/// Canonical identity of a type: a human-readable identifier, the total
/// size in bytes (element size times all array factors) and a stable 64-bit
/// hash. The hash is authoritative for comparison, the identifier is a
/// byproduct for humans.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ResolvedType {
    pub identifier: String,
    pub total_size: u64,
    pub hash: u64,
}

/// Resolution flavor: deep identity expands aggregate members, flat
/// identity does not. Flat is entered permanently once a pointer is
/// traversed, which is what makes cyclic type graphs terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Deep,
    Flat,
}

/// Per-DIE memoization: one slot per resolution flavor plus the
/// flavor-independent total size.
#[derive(Debug, Default)]
pub(crate) struct TypeMemo {
    deep: OnceCell<ResolvedType>,
    flat: OnceCell<ResolvedType>,
    total_size: Cell<Option<u64>>,
}

impl TypeMemo {
    fn slot(&self, mode: Mode) -> &OnceCell<ResolvedType> {
        match mode {
            Mode::Deep => &self.deep,
            Mode::Flat => &self.flat,
        }
    }

    fn get(&self, mode: Mode) -> Option<ResolvedType> {
        self.slot(mode).get().cloned()
    }

    fn set(&self, mode: Mode, resolved: ResolvedType) {
        let _ = self.slot(mode).set(resolved);
    }
}

/// The fingerprint engine. Walks the (possibly cyclic) type graph of one
/// compile unit and folds every type DIE into a [`ResolvedType`], memoized
/// on the DIE record.
pub struct TypeResolver<'a> {
    unit: &'a Unit,
    opts: FingerprintOptions,
}

impl<'a> TypeResolver<'a> {
    pub fn new(unit: &'a Unit, opts: FingerprintOptions) -> Self {
        Self { unit, opts }
    }

    /// Resolve the deep identity of a type DIE.
    pub fn resolve(&self, die: &Die) -> Result<ResolvedType, Error> {
        self.resolve_in(die, Mode::Deep)
    }

    fn referent(&self, offset: u64) -> Result<&'a Die, Error> {
        self.unit.lookup(offset).ok_or(Error::DieNotFound(offset))
    }

    fn resolve_in(&self, die: &Die, mode: Mode) -> Result<ResolvedType, Error> {
        if let Some(cached) = die.memo.get(mode) {
            return Ok(cached);
        }

        // Transparent aliases: identifier and hash are exactly those of the
        // referent.
        if matches!(die.tag, DieTag::Typedef | DieTag::ConstType) && !self.opts.aliases {
            if let Some(type_ref) = die.attrs.type_ref {
                let resolved = self.resolve_in(self.referent(type_ref)?, mode)?;
                self.cache_total_size(die, resolved.total_size)?;
                die.memo.set(mode, resolved.clone());
                return Ok(resolved);
            }
        }

        let mut hasher = Xxh64::new(0);
        let mut identifier = String::new();
        let mut size = 0u64;
        let mut factor = 1u64;
        let mut expand_members = false;
        // the cache slot is keyed by the mode this call entered with, a
        // pointer's switch to flat applies to the traversal only
        let cache_mode = mode;
        let mut mode = mode;

        hasher.update(b"%");
        hasher.update(die.tag.to_string().as_bytes());

        match die.tag {
            DieTag::StructureType => {
                identifier.push_str("struct");
                expand_members = true;
            }
            DieTag::ClassType => {
                identifier.push_str("class");
                expand_members = true;
            }
            DieTag::UnionType => {
                identifier.push_str("union");
                expand_members = true;
            }
            DieTag::EnumerationType => {
                identifier.push_str("enum");
                expand_members = true;
            }
            DieTag::ConstType => identifier.push_str("const"),
            DieTag::Typedef => identifier.push_str("typedef"),
            // a pointer switches the whole subtree to flat resolution,
            // members of its pointee contribute name and tag only
            DieTag::PointerType => mode = Mode::Flat,
            _ => {}
        }

        if self.opts.names {
            if let Some(name) = die.attrs.name.as_deref() {
                hasher.update(b".");
                hasher.update(name.as_bytes());
                if !identifier.is_empty() {
                    identifier.push(' ');
                }
                identifier.push_str(name);
            }
        }

        if expand_members && mode == Mode::Deep {
            identifier.push_str(" { ");
            for child in self.unit.children(die) {
                match child.tag {
                    DieTag::Member => {
                        let member = self.resolve_in(child, mode)?;
                        hasher.update(format!(">{:016x}", member.hash).as_bytes());
                        identifier.push_str(&member.identifier);
                        if let Some(offset) = child.attrs.data_member_location {
                            hasher.update(format!("@{offset}").as_bytes());
                            let _ = write!(identifier, " @ {offset}");
                        }
                        identifier.push_str("; ");
                    }
                    DieTag::Enumerator => {
                        let (Some(name), Some(value)) =
                            (child.attrs.name.as_deref(), child.attrs.const_value)
                        else {
                            continue;
                        };
                        hasher.update(format!(">{name}={value}").as_bytes());
                        let _ = write!(identifier, "{name} = {value}; ");
                    }
                    _ => {}
                }
            }
            identifier.push('}');
        }

        if let Some(type_ref) = die.attrs.type_ref {
            let referent = self.resolve_in(self.referent(type_ref)?, mode)?;
            if identifier.is_empty() {
                identifier = referent.identifier;
            } else {
                let _ = write!(identifier, "({})", referent.identifier);
            }
            hasher.update(format!("#{:016x}", referent.hash).as_bytes());
            if die.tag != DieTag::PointerType {
                size = referent.total_size;
            }
        }

        if die.tag == DieTag::PointerType {
            identifier.push('*');
            // pointer width comes from the pointer itself, never the pointee
            size = die
                .attrs
                .byte_size
                .unwrap_or(self.unit.address_size() as u64);
        } else if die.tag == DieTag::ArrayType {
            for child in self.unit.children(die) {
                if child.tag != DieTag::SubrangeType {
                    continue;
                }
                let lower = child.attrs.lower_bound.unwrap_or(0);
                let elements = match (child.attrs.count, child.attrs.upper_bound) {
                    (Some(count), _) => {
                        hasher.update(format!("[{lower}:{}]", lower + count - 1).as_bytes());
                        count.max(0) as u64
                    }
                    (None, Some(upper)) => {
                        hasher.update(format!("[{lower}:{upper}]").as_bytes());
                        (upper - lower + 1).max(0) as u64
                    }
                    // no bound means a flexible array member: it occupies
                    // no space of its own
                    (None, None) => {
                        hasher.update(format!("[{lower}:]").as_bytes());
                        0
                    }
                };
                let _ = write!(identifier, "[{elements}]");
                factor *= elements;
            }
        }

        if let Some(byte_size) = die.attrs.byte_size {
            size = byte_size;
        }

        if let Some(encoding) = die.attrs.encoding {
            debug_assert_eq!(factor, 1);
            let encoding = encoding_name(encoding);
            hasher.update(encoding.as_bytes());
            if identifier.is_empty() {
                let _ = write!(identifier, "{size} byte {encoding}");
            } else {
                let _ = write!(identifier, "({size} byte {encoding})");
            }
        }

        hasher.update(format!(":{size}*{factor}").as_bytes());

        let total_size = size * factor;
        self.cache_total_size(die, total_size)?;

        let resolved = ResolvedType {
            identifier,
            total_size,
            hash: hasher.digest(),
        };
        die.memo.set(cache_mode, resolved.clone());
        Ok(resolved)
    }

    fn cache_total_size(&self, die: &Die, computed: u64) -> Result<(), Error> {
        match die.memo.total_size.get() {
            Some(cached) if cached != computed => Err(Error::SizeRecomputation {
                offset: die.offset,
                cached,
                computed,
            }),
            Some(_) => Ok(()),
            None => {
                die.memo.total_size.set(Some(computed));
                Ok(())
            }
        }
    }
}

/// Render a DWARF base type encoding the way it appears inside canonical
/// identifiers ("signed", "unsigned char", "float", ...).
fn encoding_name(encoding: DwAte) -> String {
    match encoding.static_string() {
        Some(s) => s.trim_start_matches("DW_ATE_").replace('_', " "),
        None => format!("encoding {:#x}", encoding.0),
    }
}

/// Deep identities of every aggregate type in the store, deduplicated and
/// sorted by identifier. This is the raw material of the type-set digest:
/// it describes the declared schema irrespective of which variables
/// instantiate it.
pub fn aggregate_types(
    store: &DieStore,
    opts: FingerprintOptions,
) -> Result<Vec<ResolvedType>, Error> {
    let mut seen = BTreeSet::new();
    for unit in store.units() {
        let resolver = TypeResolver::new(unit, opts);
        for die in unit.dies() {
            if die.tag.is_aggregate() {
                let resolved = resolver.resolve(die)?;
                seen.insert((resolved.identifier, resolved.hash, resolved.total_size));
            }
        }
    }

    Ok(seen
        .into_iter()
        .map(|(identifier, hash, total_size)| ResolvedType {
            identifier,
            total_size,
            hash,
        })
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dwarf::store::{DieAttributes, DieEvent, DieStore};
    use gimli::constants;

    const NAMED: FingerprintOptions = FingerprintOptions {
        aliases: false,
        names: true,
    };

    fn ingest(store: &mut DieStore, depth: usize, offset: u64, tag: DieTag, attrs: DieAttributes) {
        store
            .ingest(DieEvent {
                depth,
                offset,
                tag,
                attrs,
            })
            .unwrap();
    }

    fn base_type(name: &str, size: u64, encoding: gimli::DwAte) -> DieAttributes {
        DieAttributes {
            name: Some(name.to_string()),
            byte_size: Some(size),
            encoding: Some(encoding),
            ..Default::default()
        }
    }

    fn named_ref(name: &str, type_ref: u64) -> DieAttributes {
        DieAttributes {
            name: Some(name.to_string()),
            type_ref: Some(type_ref),
            ..Default::default()
        }
    }

    /// One unit: `int` at 0x10, `struct list { struct list* next; int value; }`
    /// with the struct at 0x20 and the pointer at 0x50.
    fn cyclic_store() -> DieStore {
        let mut store = DieStore::new();
        ingest(
            &mut store,
            0,
            0xb,
            DieTag::CompileUnit,
            DieAttributes::default(),
        );
        ingest(
            &mut store,
            1,
            0x10,
            DieTag::BaseType,
            base_type("int", 4, constants::DW_ATE_signed),
        );
        ingest(
            &mut store,
            1,
            0x20,
            DieTag::StructureType,
            DieAttributes {
                name: Some("list".to_string()),
                byte_size: Some(16),
                ..Default::default()
            },
        );
        ingest(
            &mut store,
            2,
            0x28,
            DieTag::Member,
            DieAttributes {
                data_member_location: Some(0),
                ..named_ref("next", 0x50)
            },
        );
        ingest(
            &mut store,
            2,
            0x38,
            DieTag::Member,
            DieAttributes {
                data_member_location: Some(8),
                ..named_ref("value", 0x10)
            },
        );
        ingest(
            &mut store,
            1,
            0x50,
            DieTag::PointerType,
            DieAttributes {
                type_ref: Some(0x20),
                byte_size: Some(8),
                ..Default::default()
            },
        );
        store
    }

    #[test]
    fn test_base_type_identity() {
        let mut store = DieStore::new();
        ingest(
            &mut store,
            0,
            0xb,
            DieTag::CompileUnit,
            DieAttributes::default(),
        );
        ingest(
            &mut store,
            1,
            0x10,
            DieTag::BaseType,
            base_type("int", 4, constants::DW_ATE_signed),
        );

        let unit = &store.units()[0];
        let resolver = TypeResolver::new(unit, NAMED);
        let int = resolver.resolve(unit.lookup(0x10).unwrap()).unwrap();
        assert_eq!(int.identifier, "int(4 byte signed)");
        assert_eq!(int.total_size, 4);

        let anon = TypeResolver::new(unit, FingerprintOptions::default())
            .resolve(unit.lookup(0x10).unwrap());
        // names off: structure only
        assert_eq!(anon.unwrap().identifier, "4 byte signed");
    }

    #[test]
    fn test_cyclic_struct_terminates_with_stable_hash() {
        let store = cyclic_store();
        let unit = &store.units()[0];
        let resolver = TypeResolver::new(unit, NAMED);

        let list = resolver.resolve(unit.lookup(0x20).unwrap()).unwrap();
        assert_eq!(
            list.identifier,
            "struct list { next(struct list*) @ 0; value(int(4 byte signed)) @ 8; }"
        );
        assert_eq!(list.total_size, 16);

        // memoized resolution is bit-identical
        let again = resolver.resolve(unit.lookup(0x20).unwrap()).unwrap();
        assert_eq!(list, again);

        // an independently rebuilt store produces the same fingerprint
        let store2 = cyclic_store();
        let unit2 = &store2.units()[0];
        let other = TypeResolver::new(unit2, NAMED)
            .resolve(unit2.lookup(0x20).unwrap())
            .unwrap();
        assert_eq!(list.hash, other.hash);
        assert_eq!(list.identifier, other.identifier);
    }

    #[test]
    fn test_pointer_identity_cached_under_entry_mode() {
        // a second aggregate reusing the pointer die at 0x50
        let mut store = cyclic_store();
        ingest(
            &mut store,
            1,
            0x60,
            DieTag::StructureType,
            DieAttributes {
                name: Some("holder".to_string()),
                byte_size: Some(8),
                ..Default::default()
            },
        );
        ingest(
            &mut store,
            2,
            0x68,
            DieTag::Member,
            DieAttributes {
                data_member_location: Some(0),
                ..named_ref("q", 0x50)
            },
        );

        let unit = &store.units()[0];
        let resolver = TypeResolver::new(unit, NAMED);
        resolver.resolve(unit.lookup(0x20).unwrap()).unwrap();

        // the deep member walk entered the pointer in deep mode, so its
        // identity must be memoized in the deep slot
        let pointer = unit.lookup(0x50).unwrap();
        let cached = pointer.memo.get(Mode::Deep).unwrap();
        assert_eq!(cached.identifier, "struct list*");

        let holder = resolver.resolve(unit.lookup(0x60).unwrap()).unwrap();
        assert_eq!(holder.identifier, "struct holder { q(struct list*) @ 0; }");
        assert_eq!(holder.total_size, 8);
    }

    #[test]
    fn test_member_rename_changes_hash_iff_names_enabled() {
        let original = cyclic_store();

        let mut rebuilt = DieStore::new();
        ingest(
            &mut rebuilt,
            0,
            0xb,
            DieTag::CompileUnit,
            DieAttributes::default(),
        );
        ingest(
            &mut rebuilt,
            1,
            0x10,
            DieTag::BaseType,
            base_type("int", 4, constants::DW_ATE_signed),
        );
        ingest(
            &mut rebuilt,
            1,
            0x20,
            DieTag::StructureType,
            DieAttributes {
                name: Some("list".to_string()),
                byte_size: Some(16),
                ..Default::default()
            },
        );
        ingest(
            &mut rebuilt,
            2,
            0x28,
            DieTag::Member,
            DieAttributes {
                data_member_location: Some(0),
                ..named_ref("next", 0x50)
            },
        );
        ingest(
            &mut rebuilt,
            2,
            0x38,
            DieTag::Member,
            DieAttributes {
                data_member_location: Some(8),
                ..named_ref("val", 0x10)
            },
        );
        ingest(
            &mut rebuilt,
            1,
            0x50,
            DieTag::PointerType,
            DieAttributes {
                type_ref: Some(0x20),
                byte_size: Some(8),
                ..Default::default()
            },
        );

        let with_names = |store: &DieStore| {
            let unit = &store.units()[0];
            TypeResolver::new(unit, NAMED)
                .resolve(unit.lookup(0x20).unwrap())
                .unwrap()
                .hash
        };
        let structural = |store: &DieStore| {
            let unit = &store.units()[0];
            TypeResolver::new(unit, FingerprintOptions::default())
                .resolve(unit.lookup(0x20).unwrap())
                .unwrap()
                .hash
        };

        assert_ne!(with_names(&original), with_names(&rebuilt));
        assert_eq!(structural(&original), structural(&rebuilt));
    }

    #[test]
    fn test_alias_transparency() {
        // typedef word -> typedef inner -> int
        let mut store = DieStore::new();
        ingest(
            &mut store,
            0,
            0xb,
            DieTag::CompileUnit,
            DieAttributes::default(),
        );
        ingest(
            &mut store,
            1,
            0x10,
            DieTag::BaseType,
            base_type("int", 4, constants::DW_ATE_signed),
        );
        ingest(
            &mut store,
            1,
            0x20,
            DieTag::Typedef,
            named_ref("inner", 0x10),
        );
        ingest(
            &mut store,
            1,
            0x30,
            DieTag::Typedef,
            named_ref("word", 0x20),
        );

        let unit = &store.units()[0];
        let transparent = TypeResolver::new(unit, NAMED);
        let word = transparent.resolve(unit.lookup(0x30).unwrap()).unwrap();
        let int = transparent.resolve(unit.lookup(0x10).unwrap()).unwrap();
        assert_eq!(word.hash, int.hash);
        assert_eq!(word.identifier, int.identifier);
        assert_eq!(word.total_size, 4);

        // fresh store, the memo of the transparent run must not leak
        let store2 = {
            let mut s = DieStore::new();
            ingest(&mut s, 0, 0xb, DieTag::CompileUnit, DieAttributes::default());
            ingest(
                &mut s,
                1,
                0x10,
                DieTag::BaseType,
                base_type("int", 4, constants::DW_ATE_signed),
            );
            ingest(&mut s, 1, 0x20, DieTag::Typedef, named_ref("inner", 0x10));
            ingest(&mut s, 1, 0x30, DieTag::Typedef, named_ref("word", 0x20));
            s
        };
        let unit2 = &store2.units()[0];
        let decorated = TypeResolver::new(
            unit2,
            FingerprintOptions {
                aliases: true,
                names: true,
            },
        );
        let word = decorated.resolve(unit2.lookup(0x30).unwrap()).unwrap();
        let int = decorated.resolve(unit2.lookup(0x10).unwrap()).unwrap();
        assert_ne!(word.hash, int.hash);
        assert_eq!(
            word.identifier,
            "typedef word(typedef inner(int(4 byte signed)))"
        );
    }

    #[test]
    fn test_array_factors_multiply() {
        let mut store = DieStore::new();
        ingest(
            &mut store,
            0,
            0xb,
            DieTag::CompileUnit,
            DieAttributes::default(),
        );
        ingest(
            &mut store,
            1,
            0x10,
            DieTag::BaseType,
            base_type("int", 4, constants::DW_ATE_signed),
        );
        ingest(
            &mut store,
            1,
            0x20,
            DieTag::ArrayType,
            DieAttributes {
                type_ref: Some(0x10),
                ..Default::default()
            },
        );
        ingest(
            &mut store,
            2,
            0x28,
            DieTag::SubrangeType,
            DieAttributes {
                upper_bound: Some(2),
                ..Default::default()
            },
        );
        ingest(
            &mut store,
            2,
            0x30,
            DieTag::SubrangeType,
            DieAttributes {
                count: Some(4),
                ..Default::default()
            },
        );

        let unit = &store.units()[0];
        let arr = TypeResolver::new(unit, NAMED)
            .resolve(unit.lookup(0x20).unwrap())
            .unwrap();
        assert_eq!(arr.identifier, "int(4 byte signed)[3][4]");
        assert_eq!(arr.total_size, 48);
    }

    #[test]
    fn test_flexible_array_member_has_zero_size() {
        let mut store = DieStore::new();
        ingest(
            &mut store,
            0,
            0xb,
            DieTag::CompileUnit,
            DieAttributes::default(),
        );
        ingest(
            &mut store,
            1,
            0x10,
            DieTag::BaseType,
            base_type("char", 1, constants::DW_ATE_signed_char),
        );
        ingest(
            &mut store,
            1,
            0x20,
            DieTag::ArrayType,
            DieAttributes {
                type_ref: Some(0x10),
                ..Default::default()
            },
        );
        ingest(
            &mut store,
            2,
            0x28,
            DieTag::SubrangeType,
            DieAttributes::default(),
        );

        let unit = &store.units()[0];
        let arr = TypeResolver::new(unit, NAMED)
            .resolve(unit.lookup(0x20).unwrap())
            .unwrap();
        assert_eq!(arr.identifier, "char(1 byte signed char)[0]");
        assert_eq!(arr.total_size, 0);
    }

    #[test]
    fn test_enumeration_identity() {
        let mut store = DieStore::new();
        ingest(
            &mut store,
            0,
            0xb,
            DieTag::CompileUnit,
            DieAttributes::default(),
        );
        ingest(
            &mut store,
            1,
            0x10,
            DieTag::EnumerationType,
            DieAttributes {
                name: Some("color".to_string()),
                byte_size: Some(4),
                ..Default::default()
            },
        );
        ingest(
            &mut store,
            2,
            0x18,
            DieTag::Enumerator,
            DieAttributes {
                name: Some("RED".to_string()),
                const_value: Some(0),
                ..Default::default()
            },
        );
        ingest(
            &mut store,
            2,
            0x20,
            DieTag::Enumerator,
            DieAttributes {
                name: Some("GREEN".to_string()),
                const_value: Some(1),
                ..Default::default()
            },
        );

        let unit = &store.units()[0];
        let color = TypeResolver::new(unit, NAMED)
            .resolve(unit.lookup(0x10).unwrap())
            .unwrap();
        assert_eq!(color.identifier, "enum color { RED = 0; GREEN = 1; }");
        assert_eq!(color.total_size, 4);
    }

    #[test]
    fn test_aggregate_types_are_deduplicated_and_sorted() {
        let store = cyclic_store();
        let types = aggregate_types(&store, NAMED).unwrap();
        assert_eq!(types.len(), 1);
        assert!(types[0].identifier.starts_with("struct list"));
    }
}
