//! Hook insertion at allocation sites.

use super::descriptor::{self, element_class_name};
use super::insn::{Constant, Insn, InvokeKind, Routine, ValueKind};
use super::{HOOK_DESCRIPTOR, HookRef, InjectError};

/// Rewrite every allocation in `routine` to also call `hook`.
///
/// Returns whether anything was inserted. `max_locals` grows by whatever
/// the argument spills of paired constructor calls need.
pub fn insert_hooks(routine: &mut Routine, hook: &HookRef) -> Result<bool, InjectError> {
    // `new` sites whose `<init>` has not been seen yet. Constructor calls
    // made while this is zero chain to a superclass and are left alone.
    let mut pending_news = 0u32;
    let mut next_local = routine.max_locals;
    let mut changed = false;
    let mut out = Vec::with_capacity(routine.code.len() + 16);

    for insn in routine.code.drain(..) {
        match insn {
            Insn::New(_) => {
                pending_news += 1;
                out.push(insn);
            }
            Insn::Invoke {
                kind: InvokeKind::Special,
                ref owner,
                ref name,
                ref desc,
            } if &**name == "<init>" && pending_news > 0 => {
                pending_news -= 1;
                let owner = owner.clone();
                let sig = descriptor::parse_method(desc)?;

                // Copy the receiver from beneath the arguments.
                let mut spilled = Vec::with_capacity(sig.params.len());
                for kind in sig.params.iter().rev() {
                    spilled.push((*kind, next_local));
                    next_local = next_local
                        .checked_add(kind.size())
                        .ok_or(InjectError::TooManyLocals)?;
                }
                spilled.reverse();
                for &(kind, local) in spilled.iter().rev() {
                    out.push(Insn::Store(kind, local));
                }
                out.push(Insn::Dup);
                for &(kind, local) in &spilled {
                    out.push(Insn::Load(kind, local));
                    if kind == ValueKind::Ref {
                        out.push(Insn::AConstNull);
                        out.push(Insn::Store(ValueKind::Ref, local));
                    }
                }

                out.push(insn);
                // ... obj -> ... obj -1 obj -> record -> ... obj
                out.push(Insn::Ldc(Constant::Int(-1)));
                out.push(Insn::Swap);
                push_record(&mut out, &owner, hook);
                out.push(Insn::Pop);
                changed = true;
            }
            Insn::NewArray(prim) => {
                // ... count -> ... count count -> ... count array
                out.push(Insn::Dup);
                out.push(insn);
                push_record(&mut out, prim.name(), hook);
                changed = true;
            }
            Insn::ANewArray(ref element) => {
                let element = element.clone();
                out.push(Insn::Dup);
                out.push(insn);
                push_record(&mut out, &element, hook);
                changed = true;
            }
            Insn::MultiANewArray(ref type_name, dims) => {
                let type_name = type_name.clone();
                out.push(insn);
                // ... array -> ... array array dims -> ... array dims array
                out.push(Insn::Dup);
                out.push(Insn::Ldc(Constant::Int(i32::from(dims))));
                out.push(Insn::Swap);
                push_record(&mut out, &type_name, hook);
                out.push(Insn::Pop);
                changed = true;
            }
            other => out.push(other),
        }
    }

    routine.code = out;
    routine.max_locals = next_local;
    Ok(changed)
}

/// `... count obj` to `... obj`, calling `hook(count, type_name, obj)`.
fn push_record(out: &mut Vec<Insn>, type_name: &str, hook: &HookRef) {
    out.push(Insn::DupX1);
    out.push(Insn::Ldc(Constant::Str(element_class_name(type_name).into())));
    out.push(Insn::Swap);
    out.push(Insn::Invoke {
        kind: InvokeKind::Static,
        owner: hook.owner.clone(),
        name: hook.method.clone(),
        desc: HOOK_DESCRIPTOR.into(),
    });
}
