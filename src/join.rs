// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The join planner: typed builders for dataflow rules.
//!
//! A rule reads zero or more source relations and routes its output into a
//! destination relation, either immediately (visible to later rules in the
//! same tick) or deferred to the next tick. Construction is a short builder
//! chain starting from [`Dataflow::join0`] / [`Dataflow::join`] /
//! [`Dataflow::join2`] … [`Dataflow::join6`]:
//!
//! ```ignore
//! d.join2(&link, &path)
//!     .select(|l: &Link, p: &Path| /* Option<Path> or Path */)
//!     .into(&path);
//! ```
//!
//! The projection's parameter types are the sources' tuple types and its
//! return type must fit the destination — both enforced by the compiler,
//! which is what replaces the declaration-time signature checks a
//! dynamically-typed engine would do by reflection. A builder that is
//! dropped without reaching `into`/`into_async`/`apply` registers nothing
//! (and trips `#[must_use]`), so a projection join cannot lack a
//! destination.
//!
//! Three attachment modes exist, each its own builder type:
//!
//! - `select`: projection emitting destination tuples;
//! - `select_flat`: projection emitting the destination's whole lattice
//!   type, merged in rather than inserted;
//! - `apply`: side-effecting rule enqueueing explicitly through [`Ops`].
//!
//! Evaluation is a nested cartesian scan over per-source snapshots taken
//! once up front; an empty source therefore makes the whole rule emit
//! nothing for the tick.

use crate::dataflow::Dataflow;
use crate::lattice::TupleLattice;
use crate::relation::Relation;
use crate::tick::Change;
use std::marker::PhantomData;

/// One registered rule: a diagnostic name and the erased evaluator the
/// scheduler drives once per tick.
pub(crate) struct JoinDecl {
    pub(crate) name: Option<String>,
    pub(crate) exec: JoinExec,
}

pub(crate) type JoinExec = Box<dyn Fn(&mut Ops<'_>)>;

/// The change-queue view handed to `apply` rules (and used internally by
/// every evaluator): enqueue writes without touching relations directly.
/// `add`/`merge` land in the immediate buffer, `add_next`/`merge_next` in
/// the next tick's.
pub struct Ops<'a> {
    pub(crate) immediate: &'a mut Vec<Change>,
    pub(crate) next: &'a mut Vec<Change>,
}

impl<'a> Ops<'a> {
    pub fn add<L: TupleLattice>(&mut self, target: &Relation<L>, tuple: L::Tuple) {
        self.immediate.push(Change::add(target, tuple));
    }

    pub fn add_next<L: TupleLattice>(&mut self, target: &Relation<L>, tuple: L::Tuple) {
        self.next.push(Change::add(target, tuple));
    }

    pub fn merge<L: TupleLattice>(&mut self, target: &Relation<L>, source: &Relation<L>) {
        self.immediate.push(Change::merge(target, source));
    }

    pub fn merge_next<L: TupleLattice>(&mut self, target: &Relation<L>, source: &Relation<L>) {
        self.next.push(Change::merge(target, source));
    }

    pub(crate) fn sink(&mut self, deferred: bool) -> &mut Vec<Change> {
        if deferred {
            &mut *self.next
        } else {
            &mut *self.immediate
        }
    }
}

/// Output adapter for projections: a rule may return the output type
/// directly (always emitted) or `Option` of it (`None` means skip this
/// binding).
pub trait Emit<T> {
    fn emit(self) -> Option<T>;
}

impl<T> Emit<T> for T {
    fn emit(self) -> Option<T> {
        Some(self)
    }
}

impl<T> Emit<T> for Option<T> {
    fn emit(self) -> Option<T> {
        self
    }
}

macro_rules! nested_scan {
    ([$vec:ident $item:ident] $body:block) => {
        for $item in $vec.iter() $body
    };
    ([$vec:ident $item:ident, $($rest:tt)+] $body:block) => {
        for $item in $vec.iter() {
            nested_scan!([$($rest)+] $body)
        }
    };
}

macro_rules! define_join {
    ($joinfn:ident, $Join:ident, $Sel:ident, $Flat:ident,
     $(($S:ident, $src:ident, $vec:ident, $item:ident)),+) => {

        impl Dataflow {
            /// Start a rule over the given source relations, in scan order.
            pub fn $joinfn<$($S: TupleLattice),+>(
                &mut self,
                $($src: &Relation<$S>),+
            ) -> $Join<'_, $($S),+> {
                $Join {
                    d: self,
                    name: None,
                    sources: ($($src.clone(),)+),
                }
            }
        }

        #[must_use = "a join registers nothing until into/into_async/apply"]
        pub struct $Join<'d, $($S: TupleLattice),+> {
            d: &'d mut Dataflow,
            name: Option<String>,
            sources: ($(Relation<$S>,)+),
        }

        impl<'d, $($S: TupleLattice),+> $Join<'d, $($S),+> {
            /// Diagnostic name for this rule.
            pub fn name(mut self, name: &str) -> Self {
                self.name = Some(name.to_string());
                self
            }

            /// Attach a projection mapping one tuple per source to a
            /// destination tuple (or `Option` of one).
            pub fn select<R, F>(self, f: F) -> $Sel<'d, $($S,)+ R, F>
            where
                F: Fn($(&$S::Tuple),+) -> R + 'static,
            {
                $Sel {
                    d: self.d,
                    name: self.name,
                    sources: self.sources,
                    f,
                    _out: PhantomData,
                }
            }

            /// Attach a flatten projection: the return value is the
            /// destination's whole lattice type, merged in.
            pub fn select_flat<R, F>(self, f: F) -> $Flat<'d, $($S,)+ R, F>
            where
                F: Fn($(&$S::Tuple),+) -> R + 'static,
            {
                $Flat {
                    d: self.d,
                    name: self.name,
                    sources: self.sources,
                    f,
                    _out: PhantomData,
                }
            }

            /// Attach a side-effecting rule with no destination: the body
            /// enqueues its own changes through [`Ops`]. Registers the rule.
            pub fn apply<F>(self, f: F)
            where
                F: Fn(&mut Ops<'_>, $(&$S::Tuple),+) + 'static,
            {
                let ($($src,)+) = self.sources;
                let exec: JoinExec = Box::new(move |ops: &mut Ops<'_>| {
                    $(let $vec = $src.scan();)+
                    nested_scan!([$($vec $item),+] {
                        f(ops, $($item),+);
                    });
                });
                self.d.push_join(self.name, exec);
            }
        }

        #[must_use = "a join registers nothing until into/into_async"]
        pub struct $Sel<'d, $($S: TupleLattice,)+ R, F> {
            d: &'d mut Dataflow,
            name: Option<String>,
            sources: ($(Relation<$S>,)+),
            f: F,
            _out: PhantomData<fn() -> R>,
        }

        impl<'d, $($S: TupleLattice,)+ R, F> $Sel<'d, $($S,)+ R, F>
        where
            F: Fn($(&$S::Tuple),+) -> R + 'static,
            R: 'static,
        {
            pub fn name(mut self, name: &str) -> Self {
                self.name = Some(name.to_string());
                self
            }

            /// Register the rule with a destination; emissions are
            /// immediate (visible to later rules this tick).
            pub fn into<D>(self, dest: &Relation<D>)
            where
                D: TupleLattice,
                R: Emit<D::Tuple>,
            {
                self.finish(dest, false)
            }

            /// Register the rule with a destination; emissions are deferred
            /// to the next tick.
            pub fn into_async<D>(self, dest: &Relation<D>)
            where
                D: TupleLattice,
                R: Emit<D::Tuple>,
            {
                self.finish(dest, true)
            }

            fn finish<D>(self, dest: &Relation<D>, deferred: bool)
            where
                D: TupleLattice,
                R: Emit<D::Tuple>,
            {
                let ($($src,)+) = self.sources;
                let f = self.f;
                let dest = dest.clone();
                let exec: JoinExec = Box::new(move |ops: &mut Ops<'_>| {
                    $(let $vec = $src.scan();)+
                    nested_scan!([$($vec $item),+] {
                        if let Some(out) = f($($item),+).emit() {
                            ops.sink(deferred).push(Change::add(&dest, out));
                        }
                    });
                });
                self.d.push_join(self.name, exec);
            }
        }

        #[must_use = "a join registers nothing until into/into_async"]
        pub struct $Flat<'d, $($S: TupleLattice,)+ R, F> {
            d: &'d mut Dataflow,
            name: Option<String>,
            sources: ($(Relation<$S>,)+),
            f: F,
            _out: PhantomData<fn() -> R>,
        }

        impl<'d, $($S: TupleLattice,)+ R, F> $Flat<'d, $($S,)+ R, F>
        where
            F: Fn($(&$S::Tuple),+) -> R + 'static,
            R: 'static,
        {
            pub fn name(mut self, name: &str) -> Self {
                self.name = Some(name.to_string());
                self
            }

            pub fn into<D>(self, dest: &Relation<D>)
            where
                D: TupleLattice,
                R: Emit<D>,
            {
                self.finish(dest, false)
            }

            pub fn into_async<D>(self, dest: &Relation<D>)
            where
                D: TupleLattice,
                R: Emit<D>,
            {
                self.finish(dest, true)
            }

            fn finish<D>(self, dest: &Relation<D>, deferred: bool)
            where
                D: TupleLattice,
                R: Emit<D>,
            {
                let ($($src,)+) = self.sources;
                let f = self.f;
                let dest = dest.clone();
                let exec: JoinExec = Box::new(move |ops: &mut Ops<'_>| {
                    $(let $vec = $src.scan();)+
                    nested_scan!([$($vec $item),+] {
                        if let Some(value) = f($($item),+).emit() {
                            ops.sink(deferred).push(Change::merge_value(&dest, value));
                        }
                    });
                });
                self.d.push_join(self.name, exec);
            }
        }
    };
}

define_join!(join, Join1, Select1, Flatten1, (S0, s0, v0, t0));
define_join!(join2, Join2, Select2, Flatten2, (S0, s0, v0, t0), (S1, s1, v1, t1));
define_join!(
    join3,
    Join3,
    Select3,
    Flatten3,
    (S0, s0, v0, t0),
    (S1, s1, v1, t1),
    (S2, s2, v2, t2)
);
define_join!(
    join4,
    Join4,
    Select4,
    Flatten4,
    (S0, s0, v0, t0),
    (S1, s1, v1, t1),
    (S2, s2, v2, t2),
    (S3, s3, v3, t3)
);
define_join!(
    join5,
    Join5,
    Select5,
    Flatten5,
    (S0, s0, v0, t0),
    (S1, s1, v1, t1),
    (S2, s2, v2, t2),
    (S3, s3, v3, t3),
    (S4, s4, v4, t4)
);
define_join!(
    join6,
    Join6,
    Select6,
    Flatten6,
    (S0, s0, v0, t0),
    (S1, s1, v1, t1),
    (S2, s2, v2, t2),
    (S3, s3, v3, t3),
    (S4, s4, v4, t4),
    (S5, s5, v5, t5)
);

// A single-source rule may also forward its tuples verbatim, no projection
// required. Only arity one offers this; the tuple types must agree.
impl<'d, S0: TupleLattice> Join1<'d, S0> {
    pub fn into<D>(self, dest: &Relation<D>)
    where
        D: TupleLattice<Tuple = S0::Tuple>,
    {
        self.forward(dest, false)
    }

    pub fn into_async<D>(self, dest: &Relation<D>)
    where
        D: TupleLattice<Tuple = S0::Tuple>,
    {
        self.forward(dest, true)
    }

    fn forward<D>(self, dest: &Relation<D>, deferred: bool)
    where
        D: TupleLattice<Tuple = S0::Tuple>,
    {
        let (s0,) = self.sources;
        let dest = dest.clone();
        let exec: JoinExec = Box::new(move |ops: &mut Ops<'_>| {
            for t in s0.scan() {
                ops.sink(deferred).push(Change::add(&dest, t));
            }
        });
        self.d.push_join(self.name, exec);
    }
}

impl Dataflow {
    /// Start a zero-source rule: the function is invoked once per tick.
    /// Useful for rules computed from captured handles, like thresholds.
    pub fn join0(&mut self) -> Join0<'_> {
        Join0 {
            d: self,
            name: None,
        }
    }
}

#[must_use = "a join registers nothing until into/into_async/apply"]
pub struct Join0<'d> {
    d: &'d mut Dataflow,
    name: Option<String>,
}

impl<'d> Join0<'d> {
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn select<R, F>(self, f: F) -> Select0<'d, R, F>
    where
        F: Fn() -> R + 'static,
    {
        Select0 {
            d: self.d,
            name: self.name,
            f,
            _out: PhantomData,
        }
    }

    pub fn apply<F>(self, f: F)
    where
        F: Fn(&mut Ops<'_>) + 'static,
    {
        let exec: JoinExec = Box::new(move |ops: &mut Ops<'_>| f(ops));
        self.d.push_join(self.name, exec);
    }
}

#[must_use = "a join registers nothing until into/into_async"]
pub struct Select0<'d, R, F> {
    d: &'d mut Dataflow,
    name: Option<String>,
    f: F,
    _out: PhantomData<fn() -> R>,
}

impl<'d, R, F> Select0<'d, R, F>
where
    F: Fn() -> R + 'static,
    R: 'static,
{
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn into<D>(self, dest: &Relation<D>)
    where
        D: TupleLattice,
        R: Emit<D::Tuple>,
    {
        self.finish(dest, false)
    }

    pub fn into_async<D>(self, dest: &Relation<D>)
    where
        D: TupleLattice,
        R: Emit<D::Tuple>,
    {
        self.finish(dest, true)
    }

    fn finish<D>(self, dest: &Relation<D>, deferred: bool)
    where
        D: TupleLattice,
        R: Emit<D::Tuple>,
    {
        let f = self.f;
        let dest = dest.clone();
        let exec: JoinExec = Box::new(move |ops: &mut Ops<'_>| {
            if let Some(out) = f().emit() {
                ops.sink(deferred).push(Change::add(&dest, out));
            }
        });
        self.d.push_join(self.name, exec);
    }
}
