//! Register state model
//!
//! Every module instance owns two structurally identical snapshots of its
//! state: `current`, read by logic, and `pending`, written by logic. A clock
//! edge ("commit") replaces current wholesale with a copy of pending. A step
//! is always commit first, then the user's logic.

/// Current/pending pair. Deep copy is `Clone`, so every state type spells
/// out how it is duplicated.
#[derive(Debug, Clone, PartialEq)]
pub struct Registers<S: Clone> {
    current: S,
    pending: S,
}

impl<S: Clone> Registers<S> {
    /// Pending starts as a copy of the initial values.
    pub fn new(initial: S) -> Self {
        Self {
            pending: initial.clone(),
            current: initial,
        }
    }

    pub fn current(&self) -> &S {
        &self.current
    }

    pub fn pending(&self) -> &S {
        &self.pending
    }

    pub fn pending_mut(&mut self) -> &mut S {
        &mut self.pending
    }

    /// Clock edge: current := copy of pending.
    pub fn commit(&mut self) {
        self.current.clone_from(&self.pending);
    }

    /// Commit, then run `logic` against the fresh current state.
    pub fn tick<R>(&mut self, logic: impl FnOnce(&S, &mut S) -> R) -> R {
        self.commit();
        logic(&self.current, &mut self.pending)
    }
}

/// A unit of clocked behaviour. Implementors provide the clock edge and the
/// step body; [`clock`] composes them.
pub trait Clocked {
    type Input;
    type Output;
    type Error;

    fn commit(&mut self) -> Result<(), Self::Error>;

    fn step(&mut self, input: Self::Input) -> Result<Self::Output, Self::Error>;
}

/// One simulated cycle: commit, then step. Calls on one module must be
/// serialized by the caller.
pub fn clock<M: Clocked>(module: &mut M, input: M::Input) -> Result<M::Output, M::Error> {
    module.commit()?;
    module.step(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::{Overflow, Round, Sfix};
    use pretty_assertions::assert_eq;

    /// Registers a plain integer: output is the input from the previous call.
    struct Delay {
        regs: Registers<i64>,
    }

    impl Clocked for Delay {
        type Input = i64;
        type Output = i64;
        type Error = ();

        fn commit(&mut self) -> Result<(), ()> {
            self.regs.commit();
            Ok(())
        }

        fn step(&mut self, input: i64) -> Result<i64, ()> {
            *self.regs.pending_mut() = input;
            Ok(*self.regs.current())
        }
    }

    #[test]
    fn test_one_cycle_delay() {
        let mut delay = Delay {
            regs: Registers::new(-1),
        };
        let outputs: Vec<i64> = [1, 2, 3, 4]
            .into_iter()
            .map(|x| clock(&mut delay, x).unwrap())
            .collect();
        assert_eq!(outputs, vec![-1, 1, 2, 3]);
    }

    #[test]
    fn test_commit_is_idempotent() {
        let mut regs = Registers::new(vec![0, 0, 0]);
        regs.pending_mut()[1] = 7;
        regs.commit();
        let first = regs.current().clone();
        regs.commit();
        assert_eq!(regs.current(), &first);
        assert_eq!(first, vec![0, 7, 0]);
    }

    #[test]
    fn test_pending_is_independent_copy() {
        let mut regs = Registers::new(vec![1, 2]);
        regs.pending_mut().push(3);
        assert_eq!(regs.current(), &vec![1, 2]);
        regs.commit();
        regs.pending_mut().clear();
        assert_eq!(regs.current(), &vec![1, 2, 3]);
    }

    #[test]
    fn test_tick_saturating_accumulator() {
        let mut acc = Registers::new(Sfix::with_policy(0.0, 2, -10, Overflow::Saturate, Round::Round));
        let mut outputs = Vec::new();
        for _ in 0..6 {
            let out = acc.tick(|current, pending| {
                *pending = (*current + 1.5).resize(2, -10, Overflow::Saturate, Round::Round);
                *current
            });
            outputs.push(out.value());
        }
        let max = 4.0 - 2f64.powi(-10);
        assert_eq!(outputs, vec![0.0, 1.5, 3.0, max, max, max]);
    }
}
