use crate::dwarf::resolve::{FingerprintOptions, TypeResolver};
use crate::dwarf::store::{DieStore, DieTag, StaticLocation};
use crate::error::Error;
use serde::Serialize;

/// A static or thread-local variable paired with its resolved type
/// identity. Produced straight from the debug information, before any
/// reconciliation with the symbol table.
#[derive(Debug, Clone, Serialize)]
pub struct RawVariable {
    pub name: String,
    #[serde(skip)]
    pub location: StaticLocation,
    pub value: u64,
    pub size: u64,
    pub external: bool,
    pub type_identifier: String,
    pub type_hash: u64,
    pub decl: Option<String>,
}

/// Walk every `variable` DIE of the store and admit those that carry a type
/// reference and a location of one of the two statically resolvable
/// shapes. Everything else (stack locals, register residents, optimized
/// out) is skipped without note, that is the expected fate of most
/// variable DIEs.
pub fn extract_variables(
    store: &DieStore,
    opts: FingerprintOptions,
) -> Result<Vec<RawVariable>, Error> {
    let mut variables = vec![];
    for unit in store.units() {
        let resolver = TypeResolver::new(unit, opts);
        for die in unit.dies() {
            if die.tag != DieTag::Variable {
                continue;
            }
            let Some(location) = die.attrs.location else {
                continue;
            };
            let (Some(type_ref), Some(name)) = (die.attrs.type_ref, die.attrs.name.as_ref())
            else {
                continue;
            };

            let type_die = unit.lookup(type_ref).ok_or(Error::DieNotFound(type_ref))?;
            let resolved = resolver.resolve(type_die)?;

            variables.push(RawVariable {
                name: name.clone(),
                location,
                value: location.value(),
                size: resolved.total_size,
                external: die.attrs.external,
                type_identifier: resolved.identifier,
                type_hash: resolved.hash,
                decl: die.attrs.decl.clone(),
            });
        }
    }
    Ok(variables)
}
