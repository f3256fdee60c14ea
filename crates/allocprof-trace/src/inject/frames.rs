//! Stack-map inference by abstract interpretation.
//!
//! Walks every path through a routine, merging the type state where paths
//! join, and records the state at each reachable label. The transfer
//! function ([`execute`]) is shared with the verifier; inference and
//! checking are otherwise separate.

use std::collections::{BTreeMap, HashMap, VecDeque};

use super::InjectError;
use super::descriptor::{self, Signature};
use super::insn::{ArithOp, FieldOp, Insn, InvokeKind, Label, Routine, ValueKind};

/// Verification type of one stack entry or local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Unusable: unset, conflicting, or the upper half of a long/double.
    Top,
    Int,
    Float,
    Long,
    Double,
    Ref,
    Null,
    /// Result of the `new` at this instruction index, before `<init>`.
    Uninit(usize),
    /// `this` inside a constructor before the superclass `<init>`.
    UninitThis,
    ReturnAddress,
}

impl Slot {
    pub fn of(kind: ValueKind) -> Slot {
        match kind {
            ValueKind::Int => Slot::Int,
            ValueKind::Long => Slot::Long,
            ValueKind::Float => Slot::Float,
            ValueKind::Double => Slot::Double,
            ValueKind::Ref => Slot::Ref,
        }
    }

    pub fn words(self) -> usize {
        match self {
            Slot::Long | Slot::Double => 2,
            _ => 1,
        }
    }

    fn is_initialized_ref(self) -> bool {
        matches!(self, Slot::Ref | Slot::Null)
    }

    /// Whether a value of this type may stand where `kind` is expected.
    /// Uninitialized references are only accepted by loads and stores.
    fn fits(self, kind: ValueKind, allow_uninit: bool) -> bool {
        match kind {
            ValueKind::Ref => {
                self.is_initialized_ref()
                    || (allow_uninit
                        && matches!(self, Slot::Uninit(_) | Slot::UninitThis | Slot::ReturnAddress))
            }
            other => self == Slot::of(other),
        }
    }
}

/// Type state before an instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameState {
    pub locals: Vec<Slot>,
    pub stack: Vec<Slot>,
}

impl FrameState {
    /// State on entry to `routine`.
    pub fn entry(routine: &Routine, sig: &Signature) -> FrameState {
        let mut locals = Vec::with_capacity(routine.max_locals as usize);
        if !routine.is_static {
            let this = if routine.is_constructor() && &*routine.owner != "java/lang/Object" {
                Slot::UninitThis
            } else {
                Slot::Ref
            };
            locals.push(this);
        }
        for kind in &sig.params {
            locals.push(Slot::of(*kind));
            if kind.size() == 2 {
                locals.push(Slot::Top);
            }
        }
        if locals.len() < routine.max_locals as usize {
            locals.resize(routine.max_locals as usize, Slot::Top);
        }
        FrameState {
            locals,
            stack: Vec::new(),
        }
    }

    /// Operand stack depth in words.
    pub fn stack_words(&self) -> usize {
        self.stack.iter().map(|s| s.words()).sum()
    }

    fn pop(&mut self, at: usize) -> Result<Slot, InjectError> {
        self.stack
            .pop()
            .ok_or_else(|| InjectError::frames(at, "operand stack underflow"))
    }

    fn pop_kind(&mut self, at: usize, kind: ValueKind) -> Result<Slot, InjectError> {
        let slot = self.pop(at)?;
        if slot.fits(kind, false) {
            Ok(slot)
        } else {
            Err(InjectError::frames(
                at,
                format!("expected {kind:?} on the stack, found {slot:?}"),
            ))
        }
    }

    fn pop_single(&mut self, at: usize) -> Result<Slot, InjectError> {
        let slot = self.pop(at)?;
        if slot.words() == 1 {
            Ok(slot)
        } else {
            Err(InjectError::frames(at, format!("{slot:?} split by a one-word operation")))
        }
    }

    fn set_local(&mut self, idx: usize, slot: Slot) {
        let needed = idx + slot.words();
        if self.locals.len() < needed {
            self.locals.resize(needed, Slot::Top);
        }
        // Overwriting the upper half of a long/double invalidates it.
        if idx > 0 && matches!(self.locals[idx - 1], Slot::Long | Slot::Double) {
            self.locals[idx - 1] = Slot::Top;
        }
        self.locals[idx] = slot;
        if slot.words() == 2 {
            self.locals[idx + 1] = Slot::Top;
        }
    }

    fn initialize(&mut self, target: Slot) {
        for slot in self.locals.iter_mut().chain(self.stack.iter_mut()) {
            if *slot == target {
                *slot = Slot::Ref;
            }
        }
    }
}

/// State at each reachable label.
pub type StackMap = BTreeMap<Label, FrameState>;

/// Result of [`compute`].
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub frames: StackMap,
    pub max_stack: u16,
    pub max_locals: u16,
}

/// Apply `insn` (at index `at`) to `state`.
pub(crate) fn execute(
    insn: &Insn,
    at: usize,
    state: &mut FrameState,
    ret: Option<ValueKind>,
) -> Result<(), InjectError> {
    match insn {
        Insn::Label(_) | Insn::Nop | Insn::Goto(_) => {}
        Insn::AConstNull => state.stack.push(Slot::Null),
        Insn::Ldc(c) => state.stack.push(Slot::of(c.kind())),
        Insn::Load(kind, idx) => {
            let idx = *idx as usize;
            let slot = state.locals.get(idx).copied().unwrap_or(Slot::Top);
            if !slot.fits(*kind, true) {
                return Err(InjectError::frames(
                    at,
                    format!("load of {kind:?} from local {idx} holding {slot:?}"),
                ));
            }
            if kind.size() == 2 && state.locals.get(idx + 1) != Some(&Slot::Top) {
                return Err(InjectError::frames(at, format!("local {idx} is a torn {kind:?}")));
            }
            state.stack.push(slot);
        }
        Insn::Store(kind, idx) => {
            let slot = state.pop(at)?;
            if !slot.fits(*kind, true) {
                return Err(InjectError::frames(
                    at,
                    format!("store of {slot:?} as {kind:?}"),
                ));
            }
            state.set_local(*idx as usize, slot);
        }
        Insn::Pop => {
            state.pop_single(at)?;
        }
        Insn::Pop2 => {
            if state.pop(at)?.words() == 1 {
                state.pop_single(at)?;
            }
        }
        Insn::Dup => {
            let top = state.pop_single(at)?;
            state.stack.extend([top, top]);
        }
        Insn::DupX1 => {
            let v1 = state.pop_single(at)?;
            let v2 = state.pop_single(at)?;
            state.stack.extend([v1, v2, v1]);
        }
        Insn::Swap => {
            let v1 = state.pop_single(at)?;
            let v2 = state.pop_single(at)?;
            state.stack.extend([v1, v2]);
        }
        Insn::Arith(kind, op) => {
            state.pop_kind(at, *kind)?;
            if *op != ArithOp::Neg {
                state.pop_kind(at, *kind)?;
            }
            state.stack.push(Slot::of(*kind));
        }
        Insn::If(_, _) => {
            state.pop_kind(at, ValueKind::Int)?;
        }
        Insn::IfICmp(_, _) => {
            state.pop_kind(at, ValueKind::Int)?;
            state.pop_kind(at, ValueKind::Int)?;
        }
        Insn::IfNull(_) | Insn::IfNonNull(_) => {
            state.pop_kind(at, ValueKind::Ref)?;
        }
        Insn::Jsr(_) | Insn::Ret(_) => {
            return Err(InjectError::frames(at, "subroutine instruction left in code"));
        }
        Insn::New(_) => state.stack.push(Slot::Uninit(at)),
        Insn::NewArray(_) | Insn::ANewArray(_) => {
            state.pop_kind(at, ValueKind::Int)?;
            state.stack.push(Slot::Ref);
        }
        Insn::MultiANewArray(_, dims) => {
            if *dims == 0 {
                return Err(InjectError::frames(at, "multianewarray with zero dimensions"));
            }
            for _ in 0..*dims {
                state.pop_kind(at, ValueKind::Int)?;
            }
            state.stack.push(Slot::Ref);
        }
        Insn::ArrayLoad(kind) => {
            state.pop_kind(at, ValueKind::Int)?;
            state.pop_kind(at, ValueKind::Ref)?;
            state.stack.push(Slot::of(*kind));
        }
        Insn::ArrayStore(kind) => {
            state.pop_kind(at, *kind)?;
            state.pop_kind(at, ValueKind::Int)?;
            state.pop_kind(at, ValueKind::Ref)?;
        }
        Insn::ArrayLength => {
            state.pop_kind(at, ValueKind::Ref)?;
            state.stack.push(Slot::Int);
        }
        Insn::Invoke {
            kind, name, desc, ..
        } => {
            let sig = descriptor::parse_method(desc)?;
            for param in sig.params.iter().rev() {
                state.pop_kind(at, *param)?;
            }
            if *kind != InvokeKind::Static {
                let receiver = state.pop(at)?;
                if *kind == InvokeKind::Special && &**name == "<init>" {
                    if !matches!(receiver, Slot::Uninit(_) | Slot::UninitThis) {
                        return Err(InjectError::frames(
                            at,
                            format!("<init> on already initialized {receiver:?}"),
                        ));
                    }
                    state.initialize(receiver);
                } else if !receiver.is_initialized_ref() {
                    return Err(InjectError::frames(
                        at,
                        format!("call {name} on {receiver:?}"),
                    ));
                }
            }
            if let Some(ret) = sig.ret {
                state.stack.push(Slot::of(ret));
            }
        }
        Insn::Field { op, desc, .. } => {
            let kind = descriptor::parse_field(desc)?;
            match op {
                FieldOp::GetStatic => state.stack.push(Slot::of(kind)),
                FieldOp::PutStatic => {
                    state.pop_kind(at, kind)?;
                }
                FieldOp::Get => {
                    state.pop_kind(at, ValueKind::Ref)?;
                    state.stack.push(Slot::of(kind));
                }
                FieldOp::Put => {
                    state.pop_kind(at, kind)?;
                    let target = state.pop(at)?;
                    if !(target.is_initialized_ref() || target == Slot::UninitThis) {
                        return Err(InjectError::frames(at, format!("putfield on {target:?}")));
                    }
                }
            }
        }
        Insn::CheckCast(_) => {
            state.pop_kind(at, ValueKind::Ref)?;
            state.stack.push(Slot::Ref);
        }
        Insn::Return(kind) => {
            if *kind != ret {
                return Err(InjectError::frames(
                    at,
                    format!("return {kind:?} from routine returning {ret:?}"),
                ));
            }
            if let Some(kind) = kind {
                state.pop_kind(at, *kind)?;
            }
        }
        Insn::Throw => {
            state.pop_kind(at, ValueKind::Ref)?;
        }
    }
    Ok(())
}

/// Label positions, failing on any reference to an undefined label.
pub(crate) fn label_positions(routine: &Routine) -> Result<HashMap<Label, usize>, InjectError> {
    let positions: HashMap<Label, usize> = routine
        .code
        .iter()
        .enumerate()
        .filter_map(|(idx, insn)| match insn {
            Insn::Label(l) => Some((*l, idx)),
            _ => None,
        })
        .collect();
    let referenced = routine
        .code
        .iter()
        .filter_map(Insn::branch_target)
        .chain(routine.handlers.iter().flat_map(|h| [h.start, h.end, h.handler]));
    for label in referenced {
        if !positions.contains_key(&label) {
            return Err(InjectError::UndefinedLabel(label));
        }
    }
    Ok(positions)
}

/// Handler ranges resolved to `[start, end)` index ranges plus target index.
pub(crate) fn handler_ranges(
    routine: &Routine,
    positions: &HashMap<Label, usize>,
) -> Vec<(usize, usize, usize, Label)> {
    routine
        .handlers
        .iter()
        .map(|h| (positions[&h.start], positions[&h.end], positions[&h.handler], h.handler))
        .collect()
}

/// Join `incoming` into `existing`. Returns whether `existing` changed.
fn merge(existing: &mut FrameState, incoming: &FrameState, at: usize) -> Result<bool, InjectError> {
    if existing.stack.len() != incoming.stack.len() {
        return Err(InjectError::frames(
            at,
            format!(
                "stack heights differ at join: {} vs {}",
                existing.stack.len(),
                incoming.stack.len()
            ),
        ));
    }
    let mut changed = false;
    for (have, new) in existing.stack.iter_mut().zip(&incoming.stack) {
        let joined = match (*have, *new) {
            (a, b) if a == b => a,
            (Slot::Null, Slot::Ref) | (Slot::Ref, Slot::Null) => Slot::Ref,
            (a, b) => {
                return Err(InjectError::frames(
                    at,
                    format!("stack types differ at join: {a:?} vs {b:?}"),
                ));
            }
        };
        if joined != *have {
            *have = joined;
            changed = true;
        }
    }
    if existing.locals.len() < incoming.locals.len() {
        // Locals beyond what one path defines are unusable on the join.
        existing.locals.resize(incoming.locals.len(), Slot::Top);
    }
    for (idx, have) in existing.locals.iter_mut().enumerate() {
        let new = incoming.locals.get(idx).copied().unwrap_or(Slot::Top);
        let joined = match (*have, new) {
            (a, b) if a == b => a,
            (Slot::Null, Slot::Ref) | (Slot::Ref, Slot::Null) => Slot::Ref,
            _ => Slot::Top,
        };
        if joined != *have {
            *have = joined;
            changed = true;
        }
    }
    Ok(changed)
}

/// Propagate `incoming` to instruction `target`, queueing it if its state changed.
fn flow_into(
    target: usize,
    incoming: &FrameState,
    states: &mut [Option<FrameState>],
    work: &mut VecDeque<usize>,
    queued: &mut [bool],
) -> Result<(), InjectError> {
    let changed = if let Some(existing) = states[target].as_mut() {
        merge(existing, incoming, target)?
    } else {
        states[target] = Some(incoming.clone());
        true
    };
    if changed && !queued[target] {
        queued[target] = true;
        work.push_back(target);
    }
    Ok(())
}

/// Infer the frame at every reachable label plus stack and locals maxima.
pub fn compute(routine: &Routine) -> Result<Analysis, InjectError> {
    let sig = descriptor::parse_method(&routine.desc)?;
    let positions = label_positions(routine)?;
    let handlers = handler_ranges(routine, &positions);
    let code = &routine.code;
    if code.is_empty() {
        return Err(InjectError::frames(0, "empty routine"));
    }

    let mut states: Vec<Option<FrameState>> = vec![None; code.len()];
    let mut queued = vec![false; code.len()];
    let mut work = VecDeque::new();
    states[0] = Some(FrameState::entry(routine, &sig));
    work.push_back(0);
    queued[0] = true;

    let mut max_stack = 0usize;
    let mut max_locals = routine.max_locals as usize;

    while let Some(idx) = work.pop_front() {
        queued[idx] = false;
        let Some(before) = states[idx].clone() else {
            continue;
        };

        for &(start, end, target, _) in &handlers {
            if (start..end).contains(&idx) {
                let caught = FrameState {
                    locals: before.locals.clone(),
                    stack: vec![Slot::Ref],
                };
                max_stack = max_stack.max(1);
                flow_into(target, &caught, &mut states, &mut work, &mut queued)?;
            }
        }

        let insn = &code[idx];
        let mut after = before;
        execute(insn, idx, &mut after, sig.ret)?;
        max_stack = max_stack.max(after.stack_words());
        max_locals = max_locals.max(after.locals.len());

        if let Some(label) = insn.branch_target() {
            flow_into(positions[&label], &after, &mut states, &mut work, &mut queued)?;
        }
        if insn.falls_through() {
            if idx + 1 >= code.len() {
                return Err(InjectError::frames(idx, "execution falls off the end of the code"));
            }
            flow_into(idx + 1, &after, &mut states, &mut work, &mut queued)?;
        }
    }

    let frames = code
        .iter()
        .zip(&states)
        .filter_map(|(insn, state)| match (insn, state) {
            (Insn::Label(l), Some(state)) => Some((*l, state.clone())),
            _ => None,
        })
        .collect();

    Ok(Analysis {
        frames,
        max_stack: u16::try_from(max_stack)
            .map_err(|_| InjectError::frames(0, "operand stack exceeds 65535 words"))?,
        max_locals: u16::try_from(max_locals)
            .map_err(|_| InjectError::frames(0, "locals exceed 65535 words"))?,
    })
}
