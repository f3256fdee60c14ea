//! Load-time code injection.
//!
//! The host's module loader hands every loaded [`ClassUnit`] to a
//! [`Transformer`]. [`Injector`] rewrites each routine so that every
//! allocation also calls the recording hook, then re-derives the stack map
//! and checks the result before handing it back. A routine that fails any
//! step is returned untouched.

pub mod alloc;
pub mod descriptor;
pub mod frames;
pub mod insn;
pub mod jsr;
pub mod verify;

use std::sync::Arc;

use thiserror::Error;

use insn::{Label, Routine};

/// Descriptor of the hook: `(count, type name, object)`.
pub const HOOK_DESCRIPTOR: &str = "(ILjava/lang/String;Ljava/lang/Object;)V";

/// Prefix of the tracer's own classes.
pub const OWN_PREFIX: &str = "allocprof_trace/";

/// Classes under [`OWN_PREFIX`] whose name contains this are still rewritten.
pub const TEST_MARKER: &str = "Test";

/// Runtime class the host reads the layout of while allocating.
const RUNTIME_INTERNAL: &str = "java/lang/ThreadLocal";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InjectError {
    #[error("malformed descriptor: {0}")]
    Descriptor(String),

    #[error("reference to undefined label {0}")]
    UndefinedLabel(Label),

    #[error("subroutine at label {0} does not begin by storing its return address")]
    SubroutineEntry(Label),

    #[error("subroutine expansion limit of {0} reached")]
    TooManySubroutines(usize),

    #[error("too many locals after spilling constructor arguments")]
    TooManyLocals,

    #[error("frame inference failed at instruction {at}: {reason}")]
    Frames { at: usize, reason: String },

    #[error("verification failed at instruction {at}: {reason}")]
    Verify { at: usize, reason: String },
}

impl InjectError {
    pub(crate) fn frames(at: usize, reason: impl Into<String>) -> Self {
        InjectError::Frames {
            at,
            reason: reason.into(),
        }
    }

    pub(crate) fn verify(at: usize, reason: impl Into<String>) -> Self {
        InjectError::Verify {
            at,
            reason: reason.into(),
        }
    }
}

/// Static method the rewritten code calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRef {
    pub owner: Arc<str>,
    pub method: Arc<str>,
}

impl Default for HookRef {
    fn default() -> Self {
        Self {
            owner: "allocprof_trace/AllocationRecorder".into(),
            method: "recordAllocation".into(),
        }
    }
}

/// Which loader is defining a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Loader {
    /// The root loader of the runtime's own classes.
    Bootstrap,
    Named(Arc<str>),
}

/// Routines defined together by one load.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassUnit {
    /// Internal name, e.g. `app/Main`.
    pub name: Arc<str>,
    pub routines: Vec<Routine>,
}

/// Load-time hook. `None` means "leave the class as loaded".
pub trait Transformer: Send + Sync {
    fn transform(&self, loader: &Loader, class: &ClassUnit) -> Option<ClassUnit>;
}

/// Inserts allocation hooks into loaded classes.
#[derive(Debug, Clone)]
pub struct Injector {
    hook: HookRef,
    denylist: Vec<Arc<str>>,
    can_rewrite_bootstrap: bool,
}

impl Default for Injector {
    fn default() -> Self {
        Self {
            hook: HookRef::default(),
            denylist: vec!["ognl/".into()],
            can_rewrite_bootstrap: false,
        }
    }
}

impl Injector {
    pub fn new(hook: HookRef) -> Self {
        Self {
            hook,
            ..Self::default()
        }
    }

    /// Skip classes whose name starts with `prefix`.
    #[must_use]
    pub fn with_denied_prefix(mut self, prefix: &str) -> Self {
        self.denylist.push(prefix.into());
        self
    }

    /// Whether the hook class is visible from bootstrap-loaded classes.
    #[must_use]
    pub fn with_bootstrap_access(mut self, reachable: bool) -> Self {
        self.can_rewrite_bootstrap = reachable;
        self
    }

    pub fn hook(&self) -> &HookRef {
        &self.hook
    }

    /// Whether `class_name` loaded by `loader` may be rewritten at all.
    pub fn can_rewrite(&self, loader: &Loader, class_name: &str) -> bool {
        if class_name.starts_with(OWN_PREFIX) && !class_name.contains(TEST_MARKER) {
            return false;
        }
        if class_name.starts_with(RUNTIME_INTERNAL) {
            return false;
        }
        if self.denylist.iter().any(|p| class_name.starts_with(&**p)) {
            return false;
        }
        !matches!(loader, Loader::Bootstrap) || self.can_rewrite_bootstrap
    }

    /// Rewrite one routine. Returns a copy of the input when it contains no
    /// allocation; otherwise the rewritten routine with a fresh stack map.
    pub fn instrument_routine(&self, routine: &Routine) -> Result<Routine, InjectError> {
        let mut rewritten = routine.clone();
        jsr::inline_subroutines(&mut rewritten)?;
        if !alloc::insert_hooks(&mut rewritten, &self.hook)? {
            return Ok(routine.clone());
        }
        jsr::remove_unreachable(&mut rewritten)?;

        let analysis = frames::compute(&rewritten)?;
        rewritten.max_stack = analysis.max_stack;
        rewritten.max_locals = analysis.max_locals;
        rewritten.frames = Some(analysis.frames);

        verify::verify(&rewritten)?;
        Ok(rewritten)
    }
}

impl Transformer for Injector {
    fn transform(&self, loader: &Loader, class: &ClassUnit) -> Option<ClassUnit> {
        if !self.can_rewrite(loader, &class.name) {
            tracing::trace!(class = %class.name, "exempt from instrumentation");
            return None;
        }

        let mut changed = false;
        let routines: Vec<Routine> = class
            .routines
            .iter()
            .map(|routine| match self.instrument_routine(routine) {
                Ok(rewritten) => {
                    changed |= rewritten != *routine;
                    rewritten
                }
                Err(err) => {
                    tracing::warn!(
                        class = %class.name,
                        routine = %routine.name,
                        desc = %routine.desc,
                        error = %err,
                        "failed to instrument routine; keeping original"
                    );
                    routine.clone()
                }
            })
            .collect();

        changed.then(|| ClassUnit {
            name: class.name.clone(),
            routines,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::insn::{Constant, Insn, InvokeKind, PrimType, ValueKind};

    fn allocating(owner: &str) -> Routine {
        Routine::new(
            owner,
            "make",
            "()Ljava/lang/Object;",
            true,
            vec![
                Insn::New("app/Foo".into()),
                Insn::Dup,
                Insn::invoke(InvokeKind::Special, "app/Foo", "<init>", "()V"),
                Insn::Return(Some(ValueKind::Ref)),
            ],
        )
    }

    fn class(name: &str, routines: Vec<Routine>) -> ClassUnit {
        ClassUnit {
            name: name.into(),
            routines,
        }
    }

    fn app() -> Loader {
        Loader::Named("app".into())
    }

    fn hook_count(routine: &Routine) -> usize {
        routine
            .code
            .iter()
            .filter(|i| matches!(i, Insn::Invoke { desc, .. } if &**desc == HOOK_DESCRIPTOR))
            .count()
    }

    #[test]
    fn instruments_and_attaches_frames() {
        let injector = Injector::default();
        let out = injector
            .transform(&app(), &class("app/Main", vec![allocating("app/Main")]))
            .unwrap();
        let routine = &out.routines[0];
        assert_eq!(hook_count(routine), 1);
        assert!(routine.frames.is_some());
        assert!(routine.max_stack >= 4);
    }

    #[test]
    fn class_without_allocations_is_unchanged() {
        let quiet = Routine::new(
            "app/Main",
            "id",
            "(I)I",
            true,
            vec![Insn::Load(ValueKind::Int, 0), Insn::Return(Some(ValueKind::Int))],
        );
        assert!(
            Injector::default()
                .transform(&app(), &class("app/Main", vec![quiet]))
                .is_none()
        );
    }

    #[test]
    fn exemptions() {
        let injector = Injector::default();
        assert!(!injector.can_rewrite(&app(), "allocprof_trace/AllocationRecorder"));
        assert!(injector.can_rewrite(&app(), "allocprof_trace/RecorderTest"));
        assert!(!injector.can_rewrite(&app(), "ognl/OgnlRuntime"));
        assert!(!injector.can_rewrite(&app(), "java/lang/ThreadLocal$ThreadLocalMap"));
        assert!(!injector.can_rewrite(&Loader::Bootstrap, "java/util/ArrayList"));
        assert!(
            injector
                .clone()
                .with_bootstrap_access(true)
                .can_rewrite(&Loader::Bootstrap, "java/util/ArrayList")
        );
        assert!(
            !injector
                .with_denied_prefix("com/fragile/")
                .can_rewrite(&app(), "com/fragile/Thing")
        );
    }

    #[test]
    fn exempt_class_is_not_touched() {
        let out = Injector::default().transform(
            &app(),
            &class(
                "allocprof_trace/Internal",
                vec![allocating("allocprof_trace/Internal")],
            ),
        );
        assert!(out.is_none());
    }

    #[test]
    fn failing_routine_is_kept_while_others_are_rewritten() {
        // Passes an uninitialized object to a call: rejected by inference.
        let broken = Routine::new(
            "app/Main",
            "broken",
            "()V",
            true,
            vec![
                Insn::New("app/Foo".into()),
                Insn::invoke(InvokeKind::Static, "app/Util", "leak", "(Ljava/lang/Object;)V"),
                Insn::Ldc(Constant::Int(1)),
                Insn::NewArray(PrimType::Byte),
                Insn::Pop,
                Insn::Return(None),
            ],
        );
        let class = class("app/Main", vec![broken.clone(), allocating("app/Main")]);
        let out = Injector::default().transform(&app(), &class).unwrap();

        assert_eq!(out.routines[0], broken);
        assert_eq!(hook_count(&out.routines[1]), 1);
    }

    #[test]
    fn legacy_subroutines_are_removed_before_frames() {
        let routine = Routine::new(
            "app/Old",
            "run",
            "()V",
            true,
            vec![
                Insn::Jsr(10),
                Insn::Ldc(Constant::Int(4)),
                Insn::NewArray(PrimType::Int),
                Insn::Pop,
                Insn::Return(None),
                Insn::Label(10),
                Insn::Store(ValueKind::Ref, 0),
                Insn::Ret(0),
            ],
        );
        let out = Injector::default().instrument_routine(&routine).unwrap();
        assert!(!out.has_subroutines());
        assert_eq!(hook_count(&out), 1);
    }

    #[test]
    fn instrument_error_converts_into_session_error() {
        let err: crate::Error = InjectError::TooManyLocals.into();
        assert!(matches!(err, crate::Error::Inject(InjectError::TooManyLocals)));
    }
}
