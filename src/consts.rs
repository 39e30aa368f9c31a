use phf::phf_ordered_set;

/// Key of the synthetic node every other path tree node descends from.
pub const ROOT: &str = "root";

/// Prefix given to symbols without a usable source location. It sorts before any real path and
/// can never collide with one.
pub const UNCLASSIFIED_PREFIX: &str = ":";

/// Last segment of the synthetic bucket that collects small siblings during pruning.
pub const OTHER: &str = "(other)";

/// A node is only expanded if its parent holds at least `1/PARENT_DIVISOR` of the total.
pub const PARENT_DIVISOR: u64 = 25;
/// A sibling group is only shown if its largest member holds at least `1/SIBLING_DIVISOR` of the
/// total. Smaller nodes end up in the `(other)` bucket.
pub const SIBLING_DIVISOR: u64 = 35;

/// Sections searched for in the `.stat` file; their sizes add up to the RAM in use.
pub const RAM_SECTIONS: phf::OrderedSet<&str> = phf_ordered_set! {
    "noinit",
    "bss",
    "initlevel",
    "datas",
    ".data",
    ".heap",
    ".stack",
    ".bss",
    ".panic_section",
};
