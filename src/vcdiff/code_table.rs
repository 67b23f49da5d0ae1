// src/vcdiff/code_table.rs

//! Default VCDIFF instruction code table
//!
//! RFC 3284 §5.6: each of the 256 instruction codes expands to one or two
//! instructions. The table below is generated by the construction rules in
//! the RFC rather than spelled out, which keeps the layout auditable:
//! RUN, then ADD by size, then COPY by mode and size, then the combined
//! ADD+COPY and COPY+ADD entries.

use std::sync::OnceLock;

/// Address modes: SELF, HERE, four near-cache slots, three same-cache rows.
pub(crate) const COPY_MODES: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstKind {
    NoOp,
    Add,
    Run,
    Copy,
}

/// One half of a code-table entry. `size == 0` means the actual size
/// follows as a varint in the instruction section.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Inst {
    pub kind: InstKind,
    pub size: u8,
    pub mode: u8,
}

const NOOP: Inst = Inst {
    kind: InstKind::NoOp,
    size: 0,
    mode: 0,
};

const fn add(size: u8) -> Inst {
    Inst {
        kind: InstKind::Add,
        size,
        mode: 0,
    }
}

const fn copy(size: u8, mode: u8) -> Inst {
    Inst {
        kind: InstKind::Copy,
        size,
        mode,
    }
}

pub(crate) struct CodeTable {
    entries: [[Inst; 2]; 256],
}

impl CodeTable {
    pub fn get(&self, code: u8) -> [Inst; 2] {
        self.entries[code as usize]
    }

    /// The shared default table.
    pub fn default_table() -> &'static CodeTable {
        static TABLE: OnceLock<CodeTable> = OnceLock::new();
        TABLE.get_or_init(CodeTable::build_default)
    }

    fn build_default() -> CodeTable {
        let mut entries = [[NOOP; 2]; 256];
        let mut index = 0;

        // 0: RUN with explicit size
        entries[index][0] = Inst {
            kind: InstKind::Run,
            size: 0,
            mode: 0,
        };
        index += 1;

        // 1..=18: ADD, explicit size then sizes 1..=17
        for size in 0..=17u8 {
            entries[index][0] = add(size);
            index += 1;
        }

        // 19..=162: COPY per mode, explicit size then sizes 4..=18
        for mode in 0..COPY_MODES {
            entries[index][0] = copy(0, mode);
            index += 1;
            for size in 4..=18u8 {
                entries[index][0] = copy(size, mode);
                index += 1;
            }
        }

        // 163..=234: ADD(1..=4) followed by COPY(4..=6) for modes 0..=5
        for mode in 0..6u8 {
            for add_size in 1..=4u8 {
                for copy_size in 4..=6u8 {
                    entries[index] = [add(add_size), copy(copy_size, mode)];
                    index += 1;
                }
            }
        }

        // 235..=246: ADD(1..=4) followed by COPY(4) for modes 6..=8
        for mode in 6..COPY_MODES {
            for add_size in 1..=4u8 {
                entries[index] = [add(add_size), copy(4, mode)];
                index += 1;
            }
        }

        // 247..=255: COPY(4) followed by ADD(1) for every mode
        for mode in 0..COPY_MODES {
            entries[index] = [copy(4, mode), add(1)];
            index += 1;
        }

        debug_assert_eq!(index, 256);
        CodeTable { entries }
    }
}
