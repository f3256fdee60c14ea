//! Instruction model for loaded routines.
//!
//! A small stack-machine instruction set: enough to express every
//! allocation form the injector rewrites, the control flow around it, and
//! the legacy subroutine constructs it has to remove.

use std::sync::Arc;

use super::frames::StackMap;

/// Branch target. Defined by exactly one [`Insn::Label`] in a routine.
pub type Label = u32;

/// Computational type of a value on the operand stack or in a local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Int,
    Long,
    Float,
    Double,
    Ref,
}

impl ValueKind {
    /// Words occupied on the operand stack and in the locals array.
    pub fn size(self) -> u16 {
        match self {
            ValueKind::Long | ValueKind::Double => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(Arc<str>),
    Class(Arc<str>),
}

impl Constant {
    pub fn kind(&self) -> ValueKind {
        match self {
            Constant::Int(_) => ValueKind::Int,
            Constant::Long(_) => ValueKind::Long,
            Constant::Float(_) => ValueKind::Float,
            Constant::Double(_) => ValueKind::Double,
            Constant::Str(_) | Constant::Class(_) => ValueKind::Ref,
        }
    }
}

/// Element type operand of `newarray`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimType {
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
}

impl PrimType {
    /// Name reported to the hook, e.g. `int` for `new int[n]`.
    pub fn name(self) -> &'static str {
        match self {
            PrimType::Boolean => "boolean",
            PrimType::Char => "char",
            PrimType::Float => "float",
            PrimType::Double => "double",
            PrimType::Byte => "byte",
            PrimType::Short => "short",
            PrimType::Int => "int",
            PrimType::Long => "long",
        }
    }

    /// Decode the classic `newarray` operand (4..=11).
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            4 => PrimType::Boolean,
            5 => PrimType::Char,
            6 => PrimType::Float,
            7 => PrimType::Double,
            8 => PrimType::Byte,
            9 => PrimType::Short,
            10 => PrimType::Int,
            11 => PrimType::Long,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    /// Unary.
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeKind {
    Static,
    Special,
    Virtual,
    Interface,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOp {
    Get,
    Put,
    GetStatic,
    PutStatic,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Insn {
    Label(Label),
    Nop,
    AConstNull,
    Ldc(Constant),
    Load(ValueKind, u16),
    Store(ValueKind, u16),
    Pop,
    Pop2,
    Dup,
    DupX1,
    Swap,
    Arith(ValueKind, ArithOp),
    Goto(Label),
    /// Compare an int against zero.
    If(Cond, Label),
    /// Compare two ints.
    IfICmp(Cond, Label),
    IfNull(Label),
    IfNonNull(Label),
    /// Legacy subroutine call: push a return address and jump.
    Jsr(Label),
    /// Legacy subroutine return through the address held in a local.
    Ret(u16),
    New(Arc<str>),
    NewArray(PrimType),
    ANewArray(Arc<str>),
    MultiANewArray(Arc<str>, u8),
    ArrayLoad(ValueKind),
    ArrayStore(ValueKind),
    ArrayLength,
    Invoke {
        kind: InvokeKind,
        owner: Arc<str>,
        name: Arc<str>,
        desc: Arc<str>,
    },
    Field {
        op: FieldOp,
        owner: Arc<str>,
        name: Arc<str>,
        desc: Arc<str>,
    },
    CheckCast(Arc<str>),
    Return(Option<ValueKind>),
    Throw,
}

impl Insn {
    pub fn invoke(kind: InvokeKind, owner: &str, name: &str, desc: &str) -> Self {
        Insn::Invoke {
            kind,
            owner: owner.into(),
            name: name.into(),
            desc: desc.into(),
        }
    }

    /// Explicit jump target, if any.
    pub fn branch_target(&self) -> Option<Label> {
        match *self {
            Insn::Goto(l)
            | Insn::If(_, l)
            | Insn::IfICmp(_, l)
            | Insn::IfNull(l)
            | Insn::IfNonNull(l)
            | Insn::Jsr(l) => Some(l),
            _ => None,
        }
    }

    /// Whether execution can continue with the next instruction.
    pub fn falls_through(&self) -> bool {
        !matches!(
            self,
            Insn::Goto(_) | Insn::Ret(_) | Insn::Return(_) | Insn::Throw
        )
    }

    /// Copy with every label reference passed through `map`.
    pub fn map_labels(&self, map: impl Fn(Label) -> Label) -> Insn {
        match self {
            Insn::Label(l) => Insn::Label(map(*l)),
            Insn::Goto(l) => Insn::Goto(map(*l)),
            Insn::If(c, l) => Insn::If(*c, map(*l)),
            Insn::IfICmp(c, l) => Insn::IfICmp(*c, map(*l)),
            Insn::IfNull(l) => Insn::IfNull(map(*l)),
            Insn::IfNonNull(l) => Insn::IfNonNull(map(*l)),
            Insn::Jsr(l) => Insn::Jsr(map(*l)),
            other => other.clone(),
        }
    }
}

/// Exception handler: `[start, end)` is covered, control goes to `handler`.
#[derive(Debug, Clone, PartialEq)]
pub struct Handler {
    pub start: Label,
    pub end: Label,
    pub handler: Label,
    /// `None` catches everything.
    pub catch_type: Option<Arc<str>>,
}

/// One method body together with the metadata the loader checks.
#[derive(Debug, Clone, PartialEq)]
pub struct Routine {
    pub owner: Arc<str>,
    pub name: Arc<str>,
    pub desc: Arc<str>,
    pub is_static: bool,
    pub max_locals: u16,
    pub max_stack: u16,
    pub code: Vec<Insn>,
    pub handlers: Vec<Handler>,
    /// Frame state at each reachable label, filled in after rewriting.
    pub frames: Option<StackMap>,
}

impl Routine {
    /// Build a routine, sizing `max_locals` from the descriptor and the
    /// locals the code touches. `max_stack` is left for frame computation.
    pub fn new(owner: &str, name: &str, desc: &str, is_static: bool, code: Vec<Insn>) -> Self {
        let params = super::descriptor::parse_method(desc)
            .map(|sig| sig.params.iter().map(|k| k.size()).sum::<u16>())
            .unwrap_or(0);
        let mut max_locals = params + u16::from(!is_static);
        for insn in &code {
            if let Insn::Load(kind, idx) | Insn::Store(kind, idx) = insn {
                max_locals = max_locals.max(idx + kind.size());
            }
            if let Insn::Ret(idx) = insn {
                max_locals = max_locals.max(idx + 1);
            }
        }
        Self {
            owner: owner.into(),
            name: name.into(),
            desc: desc.into(),
            is_static,
            max_locals,
            max_stack: 0,
            code,
            handlers: Vec::new(),
            frames: None,
        }
    }

    #[must_use]
    pub fn with_handlers(mut self, handlers: Vec<Handler>) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn is_constructor(&self) -> bool {
        &*self.name == "<init>"
    }

    pub fn has_subroutines(&self) -> bool {
        self.code
            .iter()
            .any(|insn| matches!(insn, Insn::Jsr(_) | Insn::Ret(_)))
    }
}

/// Hands out labels not yet used in a routine.
#[derive(Debug)]
pub struct LabelGen {
    next: Label,
}

impl LabelGen {
    pub fn for_routine(routine: &Routine) -> Self {
        let in_code = routine.code.iter().filter_map(|insn| match insn {
            Insn::Label(l) => Some(*l),
            other => other.branch_target(),
        });
        let in_handlers = routine
            .handlers
            .iter()
            .flat_map(|h| [h.start, h.end, h.handler]);
        let max = in_code.chain(in_handlers).max();
        Self {
            next: max.map_or(0, |m| m + 1),
        }
    }

    pub fn fresh(&mut self) -> Label {
        let label = self.next;
        self.next += 1;
        label
    }
}
