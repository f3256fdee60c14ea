//! Post-rewrite type check.
//!
//! A single linear pass that trusts nothing but the recorded stack map:
//! every jump target and handler must have a frame, the state flowing into
//! a frame must be assignable to it, and code that no frame or fallthrough
//! reaches is rejected. It shares only the per-instruction transfer
//! function with inference, so a bug in the fixpoint iteration still shows
//! up here.

use super::InjectError;
use super::descriptor;
use super::frames::{FrameState, Slot, execute, handler_ranges, label_positions};
use super::insn::{Insn, Label, Routine};

/// Check `routine` against its stack map and declared maxima.
pub fn verify(routine: &Routine) -> Result<(), InjectError> {
    let Some(frames) = routine.frames.as_ref() else {
        return Err(InjectError::verify(0, "routine has no stack map"));
    };
    let sig = descriptor::parse_method(&routine.desc)?;
    let positions = label_positions(routine)?;
    let handlers = handler_ranges(routine, &positions);
    let code = &routine.code;

    let frame_at = |label: Label, at: usize| {
        frames
            .get(&label)
            .ok_or_else(|| InjectError::verify(at, format!("no frame for label {label}")))
    };

    let mut current = Some(FrameState::entry(routine, &sig));
    for (idx, insn) in code.iter().enumerate() {
        if let Insn::Label(label) = insn
            && let Some(frame) = frames.get(label)
        {
            if let Some(state) = &current {
                check_assignable(state, frame, idx)?;
            }
            current = Some(frame.clone());
        }
        let Some(mut state) = current.take() else {
            if matches!(insn, Insn::Label(_)) {
                continue;
            }
            return Err(InjectError::verify(idx, "unreachable instruction without a frame"));
        };

        for &(start, end, _, handler) in &handlers {
            if (start..end).contains(&idx) {
                let frame = frame_at(handler, idx)?;
                if frame.stack != [Slot::Ref] {
                    return Err(InjectError::verify(
                        idx,
                        format!("handler {handler} frame stack is {:?}", frame.stack),
                    ));
                }
                let caught = FrameState {
                    locals: state.locals.clone(),
                    stack: vec![Slot::Ref],
                };
                check_assignable(&caught, frame, idx)?;
            }
        }

        execute(insn, idx, &mut state, sig.ret).map_err(|err| match err {
            InjectError::Frames { at, reason } => InjectError::Verify { at, reason },
            other => other,
        })?;
        if state.stack_words() > routine.max_stack as usize {
            return Err(InjectError::verify(
                idx,
                format!("stack depth {} exceeds max_stack {}", state.stack_words(), routine.max_stack),
            ));
        }
        if state.locals.len() > routine.max_locals as usize {
            return Err(InjectError::verify(
                idx,
                format!("local {} exceeds max_locals {}", state.locals.len() - 1, routine.max_locals),
            ));
        }

        if let Some(target) = insn.branch_target() {
            check_assignable(&state, frame_at(target, idx)?, idx)?;
        }
        if insn.falls_through() {
            if idx + 1 == code.len() {
                return Err(InjectError::verify(idx, "execution falls off the end of the code"));
            }
            current = Some(state);
        }
    }
    Ok(())
}

fn slot_assignable(from: Slot, to: Slot) -> bool {
    from == to || to == Slot::Top || (from == Slot::Null && to == Slot::Ref)
}

fn check_assignable(from: &FrameState, to: &FrameState, at: usize) -> Result<(), InjectError> {
    if from.stack.len() != to.stack.len() {
        return Err(InjectError::verify(
            at,
            format!("stack height {} does not match frame height {}", from.stack.len(), to.stack.len()),
        ));
    }
    for (depth, (&a, &b)) in from.stack.iter().zip(&to.stack).enumerate() {
        if !slot_assignable(a, b) {
            return Err(InjectError::verify(
                at,
                format!("stack entry {depth} is {a:?}, frame expects {b:?}"),
            ));
        }
    }
    for (idx, &b) in to.locals.iter().enumerate() {
        let a = from.locals.get(idx).copied().unwrap_or(Slot::Top);
        if !slot_assignable(a, b) {
            return Err(InjectError::verify(
                at,
                format!("local {idx} is {a:?}, frame expects {b:?}"),
            ));
        }
    }
    Ok(())
}
