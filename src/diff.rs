use crate::digest::FileDescriptor;
use itertools::Itertools;

/// Partition file descriptors into equivalence classes by their digest
/// key. Classes and their members are ordered by file name, so the report
/// is deterministic regardless of argument order.
pub fn partition(descriptors: Vec<FileDescriptor>) -> Vec<Vec<FileDescriptor>> {
    let mut classes: Vec<Vec<FileDescriptor>> = descriptors
        .into_iter()
        .map(|descriptor| (descriptor.equivalence_key(), descriptor))
        .into_group_map()
        .into_values()
        .collect();

    for class in &mut classes {
        class.sort_by(|a, b| a.path.cmp(&b.path));
    }
    classes.sort_by(|a, b| a[0].path.cmp(&b[0].path));
    classes
}

/// The input set is identical iff exactly one equivalence class remains.
pub fn identical(classes: &[Vec<FileDescriptor>]) -> bool {
    classes.len() == 1
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::elf::Category;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn descriptor(path: &str, rw_digest: u64) -> FileDescriptor {
        FileDescriptor {
            path: PathBuf::from(path),
            build_id: None,
            dbgsym_path: None,
            digests: BTreeMap::from([(Category::Rw, rw_digest)]),
            type_set_digest: None,
        }
    }

    #[test]
    fn test_identical_set_collapses_to_one_class() {
        let classes = partition(vec![descriptor("b", 7), descriptor("a", 7)]);
        assert!(identical(&classes));
        assert_eq!(classes[0][0].path, PathBuf::from("a"));
        assert_eq!(classes[0][1].path, PathBuf::from("b"));
    }

    #[test]
    fn test_differing_digests_split_classes() {
        let classes = partition(vec![
            descriptor("a", 7),
            descriptor("b", 8),
            descriptor("c", 7),
        ]);
        assert!(!identical(&classes));
        assert_eq!(classes.len(), 2);
        assert_eq!(classes[0].len(), 2);
        assert_eq!(classes[1][0].path, PathBuf::from("b"));
    }

    #[test]
    fn test_type_set_digest_participates_in_equivalence() {
        let mut with_types = descriptor("a", 7);
        with_types.type_set_digest = Some(1);
        let classes = partition(vec![with_types, descriptor("b", 7)]);
        assert_eq!(classes.len(), 2);
    }
}
