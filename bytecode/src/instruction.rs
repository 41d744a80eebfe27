use core::fmt;

/// A decoded instruction with all operands resolved to their widest types.
///
/// Register operands are always `u16` regardless of whether the instruction
/// was encoded in narrow or wide form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    LoadConst {
        dst: u16,
        idx: u16,
    },
    LoadInt {
        dst: u16,
        value: i32,
    },
    SetNull {
        dst: u16,
    },
    SetEmptyList {
        dst: u16,
    },
    Copy {
        dst: u16,
        src: u16,
    },
    Move {
        dst: u16,
        src: u16,
    },
    Swap {
        a: u16,
        b: u16,
    },
    Cast {
        dst: u16,
        src: u16,
        type_idx: u16,
    },
    AddInt {
        dst: u16,
        lhs: u16,
        rhs: u16,
    },
    SubInt {
        dst: u16,
        lhs: u16,
        rhs: u16,
    },
    MulInt {
        dst: u16,
        lhs: u16,
        rhs: u16,
    },
    DivInt {
        dst: u16,
        lhs: u16,
        rhs: u16,
    },
    AddFloat {
        dst: u16,
        lhs: u16,
        rhs: u16,
    },
    SubFloat {
        dst: u16,
        lhs: u16,
        rhs: u16,
    },
    MulFloat {
        dst: u16,
        lhs: u16,
        rhs: u16,
    },
    DivFloat {
        dst: u16,
        lhs: u16,
        rhs: u16,
    },
    Equals {
        dst: u16,
        lhs: u16,
        rhs: u16,
    },
    LessThan {
        dst: u16,
        lhs: u16,
        rhs: u16,
    },
    Increment {
        reg: u16,
    },
    GetIndex {
        dst: u16,
        container: u16,
        index: u16,
    },
    SetIndex {
        container: u16,
        index: u16,
        src: u16,
    },
    Append {
        list: u16,
        src: u16,
    },
    Length {
        dst: u16,
        container: u16,
    },
    Jump {
        offset: i16,
    },
    JumpIf {
        cond: u16,
        offset: i16,
    },
    JumpIfNot {
        cond: u16,
        offset: i16,
    },
    JumpIfDone {
        index: u16,
        container: u16,
        offset: i16,
    },
    Call {
        block_idx: u16,
        base: u16,
        argc: u8,
        out: u16,
    },
    CallKeyed {
        block_idx: u16,
        base: u16,
        argc: u8,
        out: u16,
        key: u16,
    },
    CallFunc {
        base: u16,
        argc: u8,
        out: u16,
    },
    CallFuncApply {
        func: u16,
        args: u16,
        out: u16,
    },
    CallMethod {
        name_idx: u16,
        base: u16,
        argc: u8,
        out: u16,
        site: u16,
    },
    MakeFunc {
        dst: u16,
        block_idx: u16,
        first: u16,
        count: u8,
    },
    SplatBindings {
        first: u16,
        count: u8,
    },
    VarargsToList {
        first: u16,
    },
    GrowFrame {
        size: u16,
    },
    Native {
        idx: u16,
    },
    GetState {
        dst: u16,
        name_idx: u16,
    },
    SaveState {
        name_idx: u16,
        src: u16,
    },
    RetainFrame,
    Pause,
    Return,
}

impl Instruction {
    /// Whether executing this instruction can hand control to another frame
    /// or to host code.
    pub const fn leaves_frame(&self) -> bool {
        matches!(
            self,
            Self::Call { .. }
                | Self::CallKeyed { .. }
                | Self::CallFunc { .. }
                | Self::CallFuncApply { .. }
                | Self::CallMethod { .. }
                | Self::Native { .. }
                | Self::Pause
                | Self::Return
        )
    }
}

fn binary(
    f: &mut fmt::Formatter<'_>,
    name: &str,
    dst: u16,
    lhs: u16,
    rhs: u16,
) -> fmt::Result {
    write!(f, "{name} r{dst}, r{lhs}, r{rhs}")
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::LoadConst { dst, idx } => write!(f, "LoadConst r{dst}, #{idx}"),
            Self::LoadInt { dst, value } => write!(f, "LoadInt r{dst}, {value}"),
            Self::SetNull { dst } => write!(f, "SetNull r{dst}"),
            Self::SetEmptyList { dst } => write!(f, "SetEmptyList r{dst}"),
            Self::Copy { dst, src } => write!(f, "Copy r{dst}, r{src}"),
            Self::Move { dst, src } => write!(f, "Move r{dst}, r{src}"),
            Self::Swap { a, b } => write!(f, "Swap r{a}, r{b}"),
            Self::Cast { dst, src, type_idx } => {
                write!(f, "Cast r{dst}, r{src}, :{type_idx}")
            }
            Self::AddInt { dst, lhs, rhs } => binary(f, "AddInt", dst, lhs, rhs),
            Self::SubInt { dst, lhs, rhs } => binary(f, "SubInt", dst, lhs, rhs),
            Self::MulInt { dst, lhs, rhs } => binary(f, "MulInt", dst, lhs, rhs),
            Self::DivInt { dst, lhs, rhs } => binary(f, "DivInt", dst, lhs, rhs),
            Self::AddFloat { dst, lhs, rhs } => {
                binary(f, "AddFloat", dst, lhs, rhs)
            }
            Self::SubFloat { dst, lhs, rhs } => {
                binary(f, "SubFloat", dst, lhs, rhs)
            }
            Self::MulFloat { dst, lhs, rhs } => {
                binary(f, "MulFloat", dst, lhs, rhs)
            }
            Self::DivFloat { dst, lhs, rhs } => {
                binary(f, "DivFloat", dst, lhs, rhs)
            }
            Self::Equals { dst, lhs, rhs } => binary(f, "Equals", dst, lhs, rhs),
            Self::LessThan { dst, lhs, rhs } => {
                binary(f, "LessThan", dst, lhs, rhs)
            }
            Self::Increment { reg } => write!(f, "Increment r{reg}"),
            Self::GetIndex {
                dst,
                container,
                index,
            } => write!(f, "GetIndex r{dst}, r{container}[r{index}]"),
            Self::SetIndex {
                container,
                index,
                src,
            } => write!(f, "SetIndex r{container}[r{index}], r{src}"),
            Self::Append { list, src } => write!(f, "Append r{list}, r{src}"),
            Self::Length { dst, container } => {
                write!(f, "Length r{dst}, r{container}")
            }
            Self::Jump { offset } => write!(f, "Jump {offset:+}"),
            Self::JumpIf { cond, offset } => {
                write!(f, "JumpIf r{cond} {offset:+}")
            }
            Self::JumpIfNot { cond, offset } => {
                write!(f, "JumpIfNot r{cond} {offset:+}")
            }
            Self::JumpIfDone {
                index,
                container,
                offset,
            } => write!(f, "JumpIfDone r{index}, r{container} {offset:+}"),
            Self::Call {
                block_idx,
                base,
                argc,
                out,
            } => write!(f, "Call @{block_idx} r{base} {argc} -> r{out}"),
            Self::CallKeyed {
                block_idx,
                base,
                argc,
                out,
                key,
            } => write!(
                f,
                "CallKeyed @{block_idx} r{base} {argc} -> r{out} [r{key}]"
            ),
            Self::CallFunc { base, argc, out } => {
                write!(f, "CallFunc r{base} {argc} -> r{out}")
            }
            Self::CallFuncApply { func, args, out } => {
                write!(f, "CallFuncApply r{func} r{args}.. -> r{out}")
            }
            Self::CallMethod {
                name_idx,
                base,
                argc,
                out,
                site,
            } => write!(
                f,
                "CallMethod #{name_idx} r{base} {argc} -> r{out} ~{site}"
            ),
            Self::MakeFunc {
                dst,
                block_idx,
                first,
                count,
            } => write!(f, "MakeFunc r{dst}, @{block_idx} r{first} {count}"),
            Self::SplatBindings { first, count } => {
                write!(f, "SplatBindings r{first} {count}")
            }
            Self::VarargsToList { first } => write!(f, "VarargsToList r{first}"),
            Self::GrowFrame { size } => write!(f, "GrowFrame {size}"),
            Self::Native { idx } => write!(f, "Native !{idx}"),
            Self::GetState { dst, name_idx } => {
                write!(f, "GetState r{dst}, #{name_idx}")
            }
            Self::SaveState { name_idx, src } => {
                write!(f, "SaveState #{name_idx}, r{src}")
            }
            Self::RetainFrame => write!(f, "RetainFrame"),
            Self::Pause => write!(f, "Pause"),
            Self::Return => write!(f, "Return"),
        }
    }
}
