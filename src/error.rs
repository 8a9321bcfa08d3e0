use crate::elf::Category;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- input errors ----------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),
    #[error("dwarf file parsing error: {0}")]
    DwarfParsing(#[from] gimli::Error),
    #[error("unsupported file format, elf object expected")]
    NotElf,
    #[error("no debug information for {0}")]
    NoDebugInformation(PathBuf),

    // --------------------------------- die store errors ------------------------------------------
    #[error("die depth discontinuity at {offset:#x}: depth {depth} after level {level}")]
    DepthViolation {
        offset: u64,
        depth: usize,
        level: usize,
    },
    #[error("die {offset:#x} inserted before any compile unit root")]
    NoUnitRoot { offset: u64 },
    #[error("duplicate die offset {offset:#x} in unit {unit}")]
    DuplicateDie { offset: u64, unit: usize },
    #[error("debug information entry (die) not found, offset: {0:#x}")]
    DieNotFound(u64),
    #[error("attribute {attr} of die {offset:#x} is not a valid integer")]
    NumericAttribute { offset: u64, attr: &'static str },

    // --------------------------------- fingerprint errors ----------------------------------------
    #[error("total size of die {offset:#x} recomputed to {computed}, {cached} cached")]
    SizeRecomputation {
        offset: u64,
        cached: u64,
        computed: u64,
    },

    // --------------------------------- classification errors -------------------------------------
    #[error("relro overlay at {start:#x} lies outside any writable load segment")]
    RelroOutsideLoad { start: u64 },
    #[error("category mismatch for `{name}`: symbol table says {symbol}, debug info says {debug}")]
    CategoryMismatch {
        name: String,
        symbol: Category,
        debug: Category,
    },
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "elflayout", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "elflayout", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}
