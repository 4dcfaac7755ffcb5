use num_enum::TryFromPrimitive;

/// First value reserved for decompiler-inserted block markers. The compiler
/// never emits values this high, so they pass through version adaptation.
pub const SYNTHETIC_BASE: u32 = 0x1000;

/// TorqueScript VM opcodes in the canonical (dialect 44+) numbering, plus the
/// synthetic markers the decompiler plants in the code buffer to close blocks.
///
/// Older dialects are renumbered onto this table by [`Opcode::for_version`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum Opcode {
    FuncDecl = 0,
    CreateObject,
    AddObject,
    EndObject,
    FinishObject,
    JmpIffNot,
    JmpIfNot,
    JmpIff,
    JmpIf,
    JmpIfNotNp,
    JmpIfNp,
    Jmp,
    Return,
    ReturnVoid,
    CmpEq,
    CmpGr,
    CmpGe,
    CmpLt,
    CmpLe,
    CmpNe,
    Xor,
    Mod,
    BitAnd,
    BitOr,
    Not,
    NotF,
    OnesComplement,
    Shr,
    Shl,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    SetCurVar,
    SetCurVarCreate,
    SetCurVarArray,
    SetCurVarArrayCreate,
    LoadVarUint,
    LoadVarFlt,
    LoadVarStr,
    SaveVarUint,
    SaveVarFlt,
    SaveVarStr,
    SetCurObject,
    SetCurObjectNew,
    SetCurObjectInternal,
    SetCurField,
    SetCurFieldArray,
    SetCurFieldType,
    LoadFieldUint,
    LoadFieldFlt,
    LoadFieldStr,
    SaveFieldUint,
    SaveFieldFlt,
    SaveFieldStr,
    StrToUint,
    StrToFlt,
    StrToNone,
    FltToUint,
    FltToStr,
    FltToNone,
    UintToFlt,
    UintToStr,
    UintToNone,
    LoadImmedUint,
    LoadImmedFlt,
    TagToStr,
    LoadImmedStr,
    DocBlockStr,
    LoadImmedIdent,
    CallFuncResolve,
    CallFunc,
    AdvanceStr,
    AdvanceStrAppendChar,
    AdvanceStrComma,
    AdvanceStrNul,
    RewindStr,
    TerminateRewindStr,
    CompareStr,
    Push,
    PushFrame,
    Assert,
    Break,
    IterBegin,
    IterBeginStr,
    Iter,
    IterEnd,
    Invalid,

    // Markers inserted by the decompiler; outside the VM's numeric range.
    MetaElse = 0x1000,
    MetaEndIf = 0x1001,
    MetaEndWhileFlt = 0x1002,
    MetaEndWhile = 0x1003,
    MetaEndFunc = 0x1004,
    MetaEndBinaryOp = 0x1005,
}

impl Opcode {
    /// Map a raw code value from the given dialect onto the canonical table.
    ///
    /// Returns `None` when the value resolves to no opcode at all, which the
    /// driver treats as fatal.
    pub fn for_version(version: u32, value: u32) -> Option<Self> {
        Self::try_from(canonical(version, value)).ok()
    }

    /// Opcodes that leave a freshly loaded value on one of the typed stacks.
    /// A conditional branch whose arm ends in one of these is a ternary arm
    /// rather than a statement body.
    pub(crate) fn is_load(self) -> bool {
        matches!(
            self,
            Self::LoadVarUint
                | Self::LoadVarFlt
                | Self::LoadVarStr
                | Self::LoadFieldUint
                | Self::LoadFieldFlt
                | Self::LoadFieldStr
                | Self::LoadImmedUint
                | Self::LoadImmedFlt
                | Self::LoadImmedStr
                | Self::LoadImmedIdent
        )
    }

    /// Markers that sit two slots before the destination of a `break`.
    pub(crate) fn closes_loop(self) -> bool {
        matches!(self, Self::MetaEndWhile | Self::MetaEndWhileFlt | Self::IterEnd)
    }
}

/// Dialects before 44 renumbered parts of the table as opcodes were inserted
/// over the years; these range shifts slide legacy values up to the canonical
/// numbering. Synthetic markers are never touched.
fn canonical(version: u32, value: u32) -> u32 {
    if value >= SYNTHETIC_BASE {
        return value;
    }
    let mut value = value;
    if version <= 36 {
        if value >= 67 {
            value += 2;
        } else if value >= 46 {
            value += 1;
        }
    }
    if version < 44 {
        if value >= 81 {
            value += 4;
        } else if value >= 49 {
            value += 3;
        } else if value >= 12 {
            value += 2;
        } else if value >= 4 {
            value += 1;
        }
    }
    value
}

/// Dispatch mode carried in the third operand of a call opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum CallType {
    Function = 0,
    Method = 1,
    Parent = 2,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(44, 0, Opcode::FuncDecl)]
    #[case(45, 11, Opcode::Jmp)]
    #[case(45, 90, Opcode::Invalid)]
    #[case(43, 3, Opcode::EndObject)]
    #[case(43, 10, Opcode::Jmp)]
    #[case(43, 12, Opcode::CmpEq)]
    #[case(43, 49, Opcode::LoadFieldUint)]
    #[case(43, 80, Opcode::PushFrame)]
    #[case(43, 81, Opcode::Break)]
    #[case(36, 45, Opcode::SetCurObjectNew)]
    #[case(36, 46, Opcode::SetCurField)]
    #[case(36, 67, Opcode::LoadImmedIdent)]
    #[case(36, 79, Opcode::Break)]
    #[case(33, 3, Opcode::EndObject)]
    fn adapts_legacy_dialects(#[case] version: u32, #[case] value: u32, #[case] expected: Opcode) {
        assert_eq!(Opcode::for_version(version, value), Some(expected));
    }

    #[test]
    fn synthetic_markers_pass_through() {
        for version in [33, 36, 40, 44, 47] {
            assert_eq!(
                Opcode::for_version(version, 0x1004),
                Some(Opcode::MetaEndFunc)
            );
        }
    }

    #[test]
    fn unknown_values_resolve_to_none() {
        assert_eq!(Opcode::for_version(45, 91), None);
        assert_eq!(Opcode::for_version(45, 0x2000), None);
        assert_eq!(Opcode::for_version(45, 0xFFF), None);
    }
}
