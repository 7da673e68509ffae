//! Array references collected while analyzing a loop body.

use crate::ir::instr::InstrId;
use crate::ir::types::DataType;

use crate::opt::loops::induction::IndexOffset;

/// One `base[i + offset]` access of the candidate loop.
///
/// Ordered by base first so that all references to one array sit next to
/// each other in a sorted set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArrayReference {
    pub base: InstrId,
    pub ty: DataType,
    pub offset: IndexOffset,
    /// Written rather than read.
    pub lhs: bool,
    pub string_char_at: bool,
}

impl ArrayReference {
    pub fn new(base: InstrId, offset: IndexOffset, ty: DataType, lhs: bool, string_char_at: bool) -> Self {
        ArrayReference {
            base,
            ty,
            offset,
            lhs,
            string_char_at,
        }
    }

    /// Two references may carry a data dependence: same element type and
    /// at least one write. Arrays of different types never alias.
    pub fn may_conflict(&self, other: &ArrayReference) -> bool {
        self.ty == other.ty && (self.lhs || other.lhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_set_dedups_and_groups_by_base() {
        let a = InstrId::new(1);
        let b = InstrId::new(2);
        let mut refs = BTreeSet::new();
        refs.insert(ArrayReference::new(b, IndexOffset::Const(0), DataType::Int32, false, false));
        refs.insert(ArrayReference::new(a, IndexOffset::Const(1), DataType::Int32, true, false));
        refs.insert(ArrayReference::new(a, IndexOffset::Const(0), DataType::Int32, false, false));
        refs.insert(ArrayReference::new(a, IndexOffset::Const(0), DataType::Int32, false, false));
        let bases: Vec<InstrId> = refs.iter().map(|r| r.base).collect();
        assert_eq!(bases, vec![a, a, b]);
    }

    #[test]
    fn test_conflicts_need_a_write_and_same_type() {
        let a = InstrId::new(1);
        let read = ArrayReference::new(a, IndexOffset::Const(0), DataType::Int16, false, false);
        let write = ArrayReference { lhs: true, ..read };
        let other_type = ArrayReference { ty: DataType::Int32, ..write };
        assert!(!read.may_conflict(&read));
        assert!(read.may_conflict(&write));
        assert!(!read.may_conflict(&other_type));
    }
}
