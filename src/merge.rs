use crate::dwarf::variable::RawVariable;
use crate::elf::{Category, ElfLayout, SymbolRecord, PAGE_SIZE};
use crate::error::Error;
use log::{info, warn};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

/// A debug-info variable after address classification.
#[derive(Debug, Clone, Serialize)]
pub struct VariableRecord {
    pub name: String,
    pub value: u64,
    pub size: u64,
    pub category: Category,
    pub external: bool,
    pub type_identifier: String,
    pub type_hash: u64,
    pub decl: Option<String>,
    pub relative_value: u64,
    pub page_alignment: u64,
}

impl VariableRecord {
    /// Attach a category to a raw debug record. Returns `None` for
    /// variables whose address lies outside every load segment.
    pub fn classify(raw: RawVariable, layout: &ElfLayout) -> Option<Self> {
        let (category, segment_start) = if raw.location.is_tls() {
            (Category::Tls, 0)
        } else {
            let Some((category, start)) = layout.classify(raw.value) else {
                warn!(
                    target: "elflayout",
                    "variable `{}` at {:#x} lies outside every load segment, dropped",
                    raw.name, raw.value
                );
                return None;
            };
            (category, start)
        };

        Some(Self {
            name: raw.name,
            value: raw.value,
            size: raw.size,
            category,
            external: raw.external,
            type_identifier: raw.type_identifier,
            type_hash: raw.type_hash,
            decl: raw.decl,
            relative_value: raw.value - segment_start,
            page_alignment: raw.value % PAGE_SIZE,
        })
    }
}

/// The left join of symbol table and debug info for one category/address.
#[derive(Debug, Clone, Serialize)]
pub struct MergedRecord {
    pub name: String,
    pub value: u64,
    pub relative_value: u64,
    pub page_alignment: u64,
    pub size: u64,
    pub category: Category,
    pub external: bool,
    pub type_identifier: Option<String>,
    pub type_hash: Option<u64>,
    pub decl: Option<String>,
}

impl MergedRecord {
    fn from_symbol(symbol: SymbolRecord) -> Self {
        Self {
            name: symbol.name,
            value: symbol.value,
            relative_value: symbol.relative_value,
            page_alignment: symbol.page_alignment,
            size: symbol.size,
            category: symbol.category,
            external: symbol.external,
            type_identifier: None,
            type_hash: None,
            decl: None,
        }
    }

    fn from_debug(debug: VariableRecord) -> Self {
        Self {
            name: debug.name,
            value: debug.value,
            relative_value: debug.relative_value,
            page_alignment: debug.page_alignment,
            size: debug.size,
            category: debug.category,
            external: debug.external,
            type_identifier: Some(debug.type_identifier),
            type_hash: Some(debug.type_hash),
            decl: debug.decl,
        }
    }

    fn from_match(symbol: SymbolRecord, debug: &VariableRecord) -> Self {
        if symbol.size != debug.size {
            warn!(
                target: "elflayout",
                "size mismatch for `{}`: {} in symbol table, {} in debug info",
                symbol.name, symbol.size, debug.size
            );
        }
        if symbol.external != debug.external {
            warn!(
                target: "elflayout",
                "external flag mismatch for `{}`", symbol.name
            );
        }

        // keep the possibly-versioned symbol name, take type and linkage
        // attributes from debug info
        Self {
            name: symbol.name,
            value: symbol.value,
            relative_value: symbol.relative_value,
            page_alignment: symbol.page_alignment,
            size: symbol.size,
            category: symbol.category,
            external: debug.external,
            type_identifier: Some(debug.type_identifier.clone()),
            type_hash: Some(debug.type_hash),
            decl: debug.decl.clone(),
        }
    }
}

/// Strip a trailing `@VERSION`/`@@VERSION` suffix from a symbol name.
fn unversioned(name: &str) -> &str {
    name.split_once('@').map_or(name, |(head, _)| head)
}

fn sort_and_dedup_symbols(symbols: &mut Vec<SymbolRecord>) {
    // sorted by the same key the merge comparison uses, otherwise the
    // two-pointer walk can skip a legitimate match; the full name only
    // breaks ties so exact duplicates stay adjacent for dedup
    symbols.sort_by(|a, b| {
        (a.category, a.value, unversioned(&a.name), a.name.as_str()).cmp(&(
            b.category,
            b.value,
            unversioned(&b.name),
            b.name.as_str(),
        ))
    });
    symbols.dedup_by(|dup, kept| {
        let equal =
            dup.category == kept.category && dup.value == kept.value && dup.name == kept.name;
        if equal && dup.size != kept.size {
            warn!(
                target: "elflayout",
                "duplicate symbol `{}` with differing sizes: {} vs {}",
                kept.name, kept.size, dup.size
            );
        }
        equal
    });
}

fn sort_and_dedup_debug(debug: &mut Vec<VariableRecord>) {
    debug.sort_by(|a, b| {
        (a.category, a.value, a.name.as_str()).cmp(&(b.category, b.value, b.name.as_str()))
    });
    debug.dedup_by(|dup, kept| {
        let equal =
            dup.category == kept.category && dup.value == kept.value && dup.name == kept.name;
        if equal && dup.size != kept.size {
            warn!(
                target: "elflayout",
                "duplicate debug record `{}` with differing sizes: {} vs {}",
                kept.name, kept.size, dup.size
            );
        }
        equal
    });
}

/// Ordered left join of the symbol-table view with the debug-info view.
///
/// Both sides are sorted by `(category, address, name)`; a pair matches iff
/// category and address are equal and the names are equal after the symbol
/// name loses its version suffix. Unmatched debug records are emitted
/// as-is, unmatched global symbols are reported and emitted without type
/// information.
pub fn merge(
    mut symbols: Vec<SymbolRecord>,
    mut debug: Vec<VariableRecord>,
) -> Result<Vec<MergedRecord>, Error> {
    sort_and_dedup_symbols(&mut symbols);
    sort_and_dedup_debug(&mut debug);

    let mut merged = Vec::with_capacity(symbols.len().max(debug.len()));
    let mut unmatched_symbols: Vec<SymbolRecord> = vec![];
    let mut unmatched_debug: Vec<&VariableRecord> = vec![];

    // three-way state machine: advance-left, advance-right, or both
    let (mut i, mut j) = (0, 0);
    while i < symbols.len() && j < debug.len() {
        let symbol = &symbols[i];
        let record = &debug[j];
        let skey = (symbol.category, symbol.value, unversioned(&symbol.name));
        let dkey = (record.category, record.value, record.name.as_str());
        match skey.cmp(&dkey) {
            Ordering::Equal => {
                merged.push(MergedRecord::from_match(symbol.clone(), record));
                i += 1;
                j += 1;
            }
            Ordering::Less => {
                unmatched_symbols.push(symbol.clone());
                i += 1;
            }
            Ordering::Greater => {
                unmatched_debug.push(record);
                j += 1;
            }
        }
    }
    unmatched_symbols.extend(symbols[i..].iter().cloned());
    unmatched_debug.extend(debug[j..].iter());

    // a symbol and a debug record that share an address and a name but
    // disagree on the category is a corrupt input
    let leftover: HashMap<(u64, &str), Category> = unmatched_symbols
        .iter()
        .map(|s| ((s.value, unversioned(&s.name)), s.category))
        .collect();
    for record in &unmatched_debug {
        if let Some(&symbol_category) = leftover.get(&(record.value, record.name.as_str())) {
            return Err(Error::CategoryMismatch {
                name: record.name.clone(),
                symbol: symbol_category,
                debug: record.category,
            });
        }
    }

    for symbol in unmatched_symbols {
        if symbol.external {
            info!(
                target: "elflayout",
                "no debug definition of `{}`, fingerprint of category {} is degraded",
                symbol.name, symbol.category
            );
        }
        merged.push(MergedRecord::from_symbol(symbol));
    }
    merged.extend(unmatched_debug.into_iter().cloned().map(MergedRecord::from_debug));

    merged.sort_by(|a, b| {
        (a.category, a.value, a.name.as_str()).cmp(&(b.category, b.value, b.name.as_str()))
    });
    Ok(merged)
}

#[cfg(test)]
mod test {
    use super::*;

    fn symbol(name: &str, value: u64, size: u64, category: Category) -> SymbolRecord {
        SymbolRecord::new(name.to_string(), value, size, category, true, value & !0xfff)
    }

    fn debug_record(name: &str, value: u64, size: u64, category: Category) -> VariableRecord {
        VariableRecord {
            name: name.to_string(),
            value,
            size,
            category,
            external: true,
            type_identifier: "int(4 byte signed)".to_string(),
            type_hash: 0xdead,
            decl: Some("main.c:1".to_string()),
            relative_value: value & 0xfff,
            page_alignment: value % PAGE_SIZE,
        }
    }

    #[test]
    fn test_match_takes_type_from_debug_and_name_from_symbol() {
        let symbols = vec![symbol("x@@GLIBC_2.34", 0x404010, 4, Category::Rw)];
        let debug = vec![debug_record("x", 0x404010, 4, Category::Rw)];

        let merged = merge(symbols, debug).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].name, "x@@GLIBC_2.34");
        assert_eq!(merged[0].type_hash, Some(0xdead));
        assert_eq!(merged[0].decl.as_deref(), Some("main.c:1"));
        assert!(merged[0].external);
    }

    #[test]
    fn test_versioned_symbol_matches_across_name_collisions() {
        // '@' sorts after '.', so ordering symbols by their full name
        // would put "foo.init" in front of "foo@bar" and consume the
        // debug record before the legitimate match is ever compared
        let symbols = vec![
            symbol("foo.init", 0x404010, 4, Category::Rw),
            symbol("foo@bar", 0x404010, 4, Category::Rw),
        ];
        let debug = vec![debug_record("foo", 0x404010, 4, Category::Rw)];

        let merged = merge(symbols, debug).unwrap();
        assert_eq!(merged.len(), 2);
        let matched = merged.iter().find(|r| r.name == "foo@bar").unwrap();
        assert_eq!(matched.type_hash, Some(0xdead));
        let unmatched = merged.iter().find(|r| r.name == "foo.init").unwrap();
        assert!(unmatched.type_hash.is_none());
    }

    #[test]
    fn test_unmatched_records_are_still_emitted() {
        let symbols = vec![symbol("sym_only", 0x404000, 8, Category::Rw)];
        let debug = vec![debug_record("dbg_only", 0x405000, 4, Category::Rw)];

        let merged = merge(symbols, debug).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].name, "sym_only");
        assert!(merged[0].type_hash.is_none());
        assert_eq!(merged[1].name, "dbg_only");
        assert_eq!(merged[1].type_hash, Some(0xdead));
    }

    #[test]
    fn test_duplicate_symbols_are_collapsed() {
        let symbols = vec![
            symbol("x", 0x404010, 4, Category::Rw),
            symbol("x", 0x404010, 4, Category::Rw),
        ];
        let merged = merge(symbols, vec![]).unwrap();
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_category_disagreement_is_fatal() {
        let symbols = vec![symbol("x", 0x404010, 4, Category::Relro)];
        let debug = vec![debug_record("x", 0x404010, 4, Category::Rw)];

        let err = merge(symbols, debug).unwrap_err();
        assert!(matches!(err, Error::CategoryMismatch { .. }));
    }

    #[test]
    fn test_merged_order_is_category_address_name() {
        let symbols = vec![
            symbol("b", 0x404020, 4, Category::Rw),
            symbol("a", 0x402000, 4, Category::R),
        ];
        let debug = vec![debug_record("t", 0x8, 8, Category::Tls)];

        let merged = merge(symbols, debug).unwrap();
        let names: Vec<_> = merged.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "t"]);
    }
}
