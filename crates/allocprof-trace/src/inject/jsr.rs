//! Legacy subroutine removal.
//!
//! Stack maps cannot describe `jsr`/`ret`, so every call site gets its own
//! copy of the subroutine body. A copy is appended after the existing code,
//! the `jsr` becomes a `goto` into it, and each `ret` in it becomes a `goto`
//! back to the instruction after the call site. Subroutine bodies that are
//! no longer called become unreachable and are dropped.

use std::collections::{BTreeSet, HashMap};

use super::InjectError;
use super::frames::{handler_ranges, label_positions};
use super::insn::{Handler, Insn, Label, LabelGen, Routine};

/// Upper bound on expansions per routine; nested `finally` blocks grow
/// exponentially.
pub const MAX_EXPANSIONS: usize = 256;

/// Replace every `jsr`/`ret` pair with inlined copies.
pub fn inline_subroutines(routine: &mut Routine) -> Result<(), InjectError> {
    if !routine.has_subroutines() {
        return Ok(());
    }
    let mut labels = LabelGen::for_routine(routine);
    let mut expansions = 0;

    while let Some(site) = routine.code.iter().position(|i| matches!(i, Insn::Jsr(_))) {
        if expansions == MAX_EXPANSIONS {
            return Err(InjectError::TooManySubroutines(MAX_EXPANSIONS));
        }
        expansions += 1;
        expand_call(routine, site, &mut labels)?;
    }

    remove_unreachable(routine)
}

fn expand_call(routine: &mut Routine, site: usize, labels: &mut LabelGen) -> Result<(), InjectError> {
    let Insn::Jsr(entry) = routine.code[site] else {
        return Ok(());
    };
    let positions = label_positions(routine)?;
    let entry_idx = positions[&entry];
    let body = subroutine_body(routine, entry_idx, &positions);

    // The first real instruction consumes the return address.
    let consumer = body
        .iter()
        .copied()
        .find(|&idx| !matches!(routine.code[idx], Insn::Label(_)))
        .ok_or(InjectError::SubroutineEntry(entry))?;
    if !matches!(routine.code[consumer], Insn::Store(_, _) | Insn::Pop) {
        return Err(InjectError::SubroutineEntry(entry));
    }

    let mut remap: HashMap<Label, Label> = HashMap::new();
    for &idx in &body {
        if let Insn::Label(l) = routine.code[idx] {
            remap.insert(l, labels.fresh());
        }
    }
    let relabel = |l: Label| remap.get(&l).copied().unwrap_or(l);
    let return_label = labels.fresh();
    let copy_entry = relabel(entry);

    let mut copy = Vec::with_capacity(body.len() + 1);
    for &idx in &body {
        let insn = &routine.code[idx];
        copy.push(match insn {
            _ if idx == consumer => Insn::Nop,
            Insn::Ret(_) => Insn::Goto(return_label),
            other => other.map_labels(relabel),
        });
    }

    // Ranges that lie wholly inside the body protect the copy too.
    let cloned: Vec<Handler> = routine
        .handlers
        .iter()
        .filter(|h| remap.contains_key(&h.start) && remap.contains_key(&h.end))
        .map(|h| Handler {
            start: relabel(h.start),
            end: relabel(h.end),
            handler: relabel(h.handler),
            catch_type: h.catch_type.clone(),
        })
        .collect();

    routine.code[site] = Insn::Goto(copy_entry);
    routine.code.insert(site + 1, Insn::Label(return_label));
    routine.code.extend(copy);
    routine.handlers.extend(cloned);
    Ok(())
}

/// Indices reachable from `entry` without returning: `ret` ends a path and
/// nested `jsr` calls are stepped over (they are expanded separately).
fn subroutine_body(
    routine: &Routine,
    entry: usize,
    positions: &HashMap<Label, usize>,
) -> BTreeSet<usize> {
    let mut body = BTreeSet::new();
    let mut stack = vec![entry];
    while let Some(idx) = stack.pop() {
        if idx >= routine.code.len() || !body.insert(idx) {
            continue;
        }
        let insn = &routine.code[idx];
        if let Some(target) = insn.branch_target()
            && !matches!(insn, Insn::Jsr(_))
        {
            stack.push(positions[&target]);
        }
        if insn.falls_through() {
            stack.push(idx + 1);
        }
    }
    body
}

/// Drop instructions no path reaches, then handlers left covering nothing.
pub fn remove_unreachable(routine: &mut Routine) -> Result<(), InjectError> {
    let positions = label_positions(routine)?;
    let handlers = handler_ranges(routine, &positions);
    let len = routine.code.len();
    let mut reachable = vec![false; len];
    let mut stack = vec![0usize];

    loop {
        while let Some(idx) = stack.pop() {
            if idx >= len || reachable[idx] {
                continue;
            }
            reachable[idx] = true;
            let insn = &routine.code[idx];
            if let Some(target) = insn.branch_target() {
                stack.push(positions[&target]);
            }
            if insn.falls_through() {
                stack.push(idx + 1);
            }
        }
        // A handler is live once anything in its range is.
        for &(start, end, target, _) in &handlers {
            if !reachable[target] && (start..end).any(|i| reachable[i]) {
                stack.push(target);
            }
        }
        if stack.is_empty() {
            break;
        }
    }

    let code = std::mem::take(&mut routine.code);
    routine.code = code
        .into_iter()
        .zip(&reachable)
        .filter(|(insn, live)| **live || matches!(insn, Insn::Label(_)))
        .map(|(insn, _)| insn)
        .collect();

    let positions = label_positions(routine)?;
    let code = &routine.code;
    routine.handlers.retain(|h| {
        let (start, end) = (positions[&h.start], positions[&h.end]);
        start < end && code[start..end].iter().any(|i| !matches!(i, Insn::Label(_)))
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inject::insn::{Constant, InvokeKind, ValueKind};

    fn call(name: &str) -> Insn {
        Insn::invoke(InvokeKind::Static, "app/Util", name, "()V")
    }

    /// try { body() } finally { cleanup() }, compiled the old way.
    fn try_finally() -> Routine {
        Routine::new(
            "app/Old",
            "run",
            "()V",
            true,
            vec![
                Insn::Label(0),
                call("body"),
                Insn::Label(1),
                Insn::Jsr(10),
                Insn::Return(None),
                // catch-all: save exception, run finally, rethrow
                Insn::Label(2),
                Insn::Store(ValueKind::Ref, 0),
                Insn::Jsr(10),
                Insn::Load(ValueKind::Ref, 0),
                Insn::Throw,
                // the finally subroutine
                Insn::Label(10),
                Insn::Store(ValueKind::Ref, 1),
                call("cleanup"),
                Insn::Ret(1),
            ],
        )
        .with_handlers(vec![Handler {
            start: 0,
            end: 1,
            handler: 2,
            catch_type: None,
        }])
    }

    fn count(code: &[Insn], pred: impl Fn(&Insn) -> bool) -> usize {
        code.iter().filter(|i| pred(i)).count()
    }

    #[test]
    fn inlines_each_call_site() {
        let mut routine = try_finally();
        inline_subroutines(&mut routine).unwrap();

        assert!(!routine.has_subroutines());
        let cleanups = count(&routine.code, |i| {
            matches!(i, Insn::Invoke { name, .. } if &**name == "cleanup")
        });
        assert_eq!(cleanups, 2);
        assert_eq!(routine.handlers.len(), 1);
    }

    #[test]
    fn inlined_routine_passes_frame_inference() {
        let mut routine = try_finally();
        inline_subroutines(&mut routine).unwrap();
        crate::inject::frames::compute(&routine).unwrap();
    }

    #[test]
    fn uncalled_subroutine_body_is_removed() {
        let mut routine = try_finally();
        inline_subroutines(&mut routine).unwrap();
        // Only the shared body stored the return address into local 1.
        let ret_stores = count(&routine.code, |i| matches!(i, Insn::Store(ValueKind::Ref, 1)));
        assert_eq!(ret_stores, 0);
    }

    #[test]
    fn nested_subroutines_expand() {
        let mut routine = Routine::new(
            "app/Old",
            "nested",
            "()V",
            true,
            vec![
                Insn::Jsr(10),
                Insn::Return(None),
                Insn::Label(10),
                Insn::Store(ValueKind::Ref, 0),
                Insn::Jsr(20),
                Insn::Ret(0),
                Insn::Label(20),
                Insn::Pop,
                call("inner"),
                Insn::Ret(0),
            ],
        );
        // `ret 0` in the inner subroutine is never reached with a valid
        // address in real code; here it only has to become a goto.
        inline_subroutines(&mut routine).unwrap();
        assert!(!routine.has_subroutines());
        crate::inject::frames::compute(&routine).unwrap();
    }

    #[test]
    fn subroutine_must_consume_return_address() {
        let mut routine = Routine::new(
            "app/Old",
            "bad",
            "()V",
            true,
            vec![
                Insn::Jsr(10),
                Insn::Return(None),
                Insn::Label(10),
                Insn::Ldc(Constant::Int(1)),
                Insn::Ret(0),
            ],
        );
        assert_eq!(
            inline_subroutines(&mut routine).unwrap_err(),
            InjectError::SubroutineEntry(10)
        );
    }

    #[test]
    fn recursion_is_bounded() {
        let mut routine = Routine::new(
            "app/Old",
            "forever",
            "()V",
            true,
            vec![
                Insn::Jsr(10),
                Insn::Return(None),
                Insn::Label(10),
                Insn::Store(ValueKind::Ref, 0),
                Insn::Jsr(10),
                Insn::Ret(0),
            ],
        );
        assert_eq!(
            inline_subroutines(&mut routine).unwrap_err(),
            InjectError::TooManySubroutines(MAX_EXPANSIONS)
        );
    }

    #[test]
    fn dead_code_and_empty_handlers_are_dropped() {
        let mut routine = Routine::new(
            "app/Dead",
            "run",
            "()V",
            true,
            vec![
                Insn::Return(None),
                Insn::Label(0),
                call("never"),
                Insn::Label(1),
                Insn::Return(None),
                Insn::Label(2),
                Insn::Throw,
            ],
        )
        .with_handlers(vec![Handler {
            start: 0,
            end: 1,
            handler: 2,
            catch_type: None,
        }]);
        remove_unreachable(&mut routine).unwrap();
        assert!(routine.handlers.is_empty());
        assert_eq!(
            count(&routine.code, |i| !matches!(i, Insn::Label(_))),
            1
        );
    }
}
