use crate::elf::{Category, ElfLayout, PAGE_SIZE};
use crate::weak_error;
use log::debug;
use object::{Object, ObjectSymbol, SymbolKind};
use serde::Serialize;

/// A statically sized object from the ELF symbol tables, categorized by its
/// enclosing segment. For TLS symbols `value` is already relative to the
/// TLS block base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolRecord {
    pub name: String,
    pub value: u64,
    pub size: u64,
    pub category: Category,
    pub external: bool,
    pub relative_value: u64,
    pub page_alignment: u64,
}

impl SymbolRecord {
    pub fn new(
        name: String,
        value: u64,
        size: u64,
        category: Category,
        external: bool,
        segment_start: u64,
    ) -> Self {
        Self {
            name,
            value,
            size,
            category,
            external,
            relative_value: value - segment_start,
            page_alignment: value % PAGE_SIZE,
        }
    }
}

/// Enumerate all defined OBJECT and TLS symbols with nonzero size and
/// assign each the category of its enclosing segment, reclassifying
/// writable addresses inside the RELRO overlay.
pub fn symbol_records(obj: &object::File, layout: &ElfLayout) -> Vec<SymbolRecord> {
    let mut records = vec![];
    let symbols: Vec<_> = if obj.symbols().next().is_some() {
        obj.symbols().collect()
    } else {
        obj.dynamic_symbols().collect()
    };

    for symbol in symbols {
        if symbol.size() == 0 || symbol.is_undefined() {
            continue;
        }
        let tls = match symbol.kind() {
            SymbolKind::Data => false,
            SymbolKind::Tls => true,
            _ => continue,
        };
        let Some(name) = weak_error!(symbol.name()) else {
            continue;
        };

        let value = symbol.address();
        let (category, segment_start) = if tls {
            (Category::Tls, 0)
        } else {
            let section = symbol.section_index().map(|index| index.0);
            let Some(category) = section.and_then(|index| layout.section_category(index)) else {
                debug!(
                    target: "elflayout",
                    "symbol `{name}` has no categorizable section, skipped"
                );
                continue;
            };
            let segment_start = layout
                .classify(value)
                .map(|(_, start)| start)
                .unwrap_or_default();
            (layout.reclassify(category, value), segment_start)
        };

        records.push(SymbolRecord::new(
            name.to_string(),
            value,
            symbol.size(),
            category,
            symbol.is_global(),
            segment_start,
        ));
    }
    records
}
